//! Scheduler 单元测试
//!
//! 测试工作描述符、调度策略以及调度器的阻塞与唤醒行为


use crate::runtime::scheduler::{
    Architecture, FifoPolicy, SchedulePolicy, SchedulerConfig, TaskGroup, TaskPriority, WdBuilder,
    WdId, WdState, WorkDescriptor, WorkStealingPolicy, WorkerId, DEFAULT_STACK_SIZE,
};
use std::sync::Arc;

fn wd(id: u64) -> Arc<WorkDescriptor> {
    WorkDescriptor::builder().build(WdId(id), |_| {})
}

#[cfg(test)]
mod wd_id_tests {
    use super::*;

    #[test]
    fn test_wd_id_display() {
        assert_eq!(WdId(7).to_string(), "WD(7)");
        assert_eq!(WorkerId(2).to_string(), "Worker(2)");
    }

    #[test]
    fn test_wd_id_from() {
        let id: WdId = 42u64.into();
        assert_eq!(id.inner(), 42);
    }
}

#[cfg(test)]
mod wd_state_tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            WdState::Created,
            WdState::Queued,
            WdState::Running,
            WdState::Blocked,
            WdState::Done,
        ] {
            assert_eq!(WdState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_transition_only_from_expected_state() {
        let task = wd(1);
        assert_eq!(task.state(), WdState::Created);
        assert!(!task.transition(WdState::Blocked, WdState::Queued));
        assert!(task.transition(WdState::Created, WdState::Queued));
        assert_eq!(task.state(), WdState::Queued);
    }

    #[test]
    fn test_done_releases_parent_once() {
        let group = Arc::new(TaskGroup::new("parent"));
        let task = WorkDescriptor::builder().parent(&group).build(WdId(1), |_| {});
        assert_eq!(group.live(), 1);
        assert!(task.done());
        assert!(!task.done());
        assert_eq!(group.live(), 0);
        assert!(group.is_idle());
    }
}

#[cfg(test)]
mod wd_builder_tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let task = WdBuilder::new().build(WdId(3), |_| {});
        assert_eq!(task.name(), "WD(3)");
        assert_eq!(task.priority(), TaskPriority::Normal);
        assert_eq!(task.arch(), Architecture::Smp);
        assert_eq!(task.stack_size(), DEFAULT_STACK_SIZE);
        assert!(!task.is_tied());
        assert!(task.tied_to().is_none());
        assert!(task.origin().is_none());
    }

    #[test]
    fn test_tie_is_sticky() {
        let task = WdBuilder::new().tied(true).build(WdId(1), |_| {});
        assert!(task.can_run_on(WorkerId(0)));
        assert!(task.tie_to(WorkerId(1)));
        assert!(task.tie_to(WorkerId(1)));
        assert!(!task.tie_to(WorkerId(0)));
        assert!(!task.can_run_on(WorkerId(0)));
        assert_eq!(task.tied_to(), Some(WorkerId(1)));
    }

    #[test]
    fn test_architecture_wire_values() {
        assert_eq!(Architecture::from_u64(1), Some(Architecture::Gpu));
        assert_eq!(Architecture::OpenCl.as_u64(), 2);
        assert_eq!(Architecture::from_u64(9), None);
    }
}

#[cfg(test)]
mod policy_tests {
    use super::*;

    #[test]
    fn test_fifo_keeps_tied_tasks_private() {
        let policy = FifoPolicy::new(2);
        let tied = wd(1);
        tied.tie_to(WorkerId(1));
        policy.queue(None, tied);
        policy.queue(None, wd(2));

        assert_eq!(policy.num_ready(), 2);
        assert_eq!(policy.at_idle(WorkerId(0)).unwrap().id(), WdId(2));
        assert!(policy.at_idle(WorkerId(0)).is_none());
        assert_eq!(policy.at_idle(WorkerId(1)).unwrap().id(), WdId(1));
    }

    #[test]
    fn test_stealing_takes_from_other_workers() {
        let policy = WorkStealingPolicy::new(2);
        policy.queue(Some(WorkerId(0)), wd(1));
        policy.queue(Some(WorkerId(0)), wd(2));

        // Worker 1 has nothing local and steals from the back
        assert_eq!(policy.at_idle(WorkerId(1)).unwrap().id(), WdId(2));
        assert_eq!(policy.at_idle(WorkerId(0)).unwrap().id(), WdId(1));
        assert_eq!(policy.stats().steal_successes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tied_tasks_are_never_stolen() {
        let policy = WorkStealingPolicy::new(2);
        let tied = wd(1);
        tied.tie_to(WorkerId(0));
        policy.queue(Some(WorkerId(0)), tied);

        assert!(policy.at_idle(WorkerId(1)).is_none());
        assert_eq!(policy.at_idle(WorkerId(0)).unwrap().id(), WdId(1));
    }

    #[test]
    fn test_external_queue_round_robin() {
        let policy = WorkStealingPolicy::new(2);
        policy.queue(None, wd(1));
        policy.queue(None, wd(2));
        assert_eq!(policy.local_len(WorkerId(0)), 1);
        assert_eq!(policy.local_len(WorkerId(1)), 1);
    }
}

#[cfg(test)]
mod scheduler_config_tests {
    use super::*;

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert!(config.num_workers >= 1);
        assert_eq!(config.default_stack_size, 2 * 1024 * 1024);
        assert_eq!(config.wait_spins, 100);
        assert!(config.use_work_stealing);
    }

    #[test]
    fn test_scheduler_config_clone() {
        let config = SchedulerConfig::default();
        let cloned = config.clone();
        assert_eq!(cloned.num_workers, config.num_workers);
        assert_eq!(cloned.mode, config.mode);
    }
}
