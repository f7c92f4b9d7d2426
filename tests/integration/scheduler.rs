//! Scheduler integration tests
//!
//! Task life cycle and dependency ordering through the public API.

use nodeflow::runtime::scheduler::{
    CopyFlags, CopySet, ExecutionMode, Scheduler, SchedulerConfig, TaskGroup, WdState,
    WorkDescriptor,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

fn scheduler(mode: ExecutionMode) -> Scheduler {
    Scheduler::with_config(SchedulerConfig {
        num_workers: 1,
        mode,
        default_stack_size: 256 * 1024,
        ..SchedulerConfig::default()
    })
}

fn run_lifecycle(mode: ExecutionMode) {
    let scheduler = scheduler(mode);
    let group = Arc::new(TaskGroup::new("lifecycle"));

    // keep the only worker busy so the next task stays queued
    let started = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let (s, r) = (started.clone(), release.clone());
    let blocker = WorkDescriptor::builder()
        .parent(&group)
        .build(scheduler.next_id(), move |_| {
            s.store(true, Ordering::SeqCst);
            while !r.load(Ordering::SeqCst) {
                thread::yield_now();
            }
        });
    scheduler.submit(blocker);
    while !started.load(Ordering::SeqCst) {
        thread::yield_now();
    }

    let (copies, dims) = CopySet::new()
        .linear(0x10_0000, 1024 * 1024, CopyFlags::OUT)
        .finish();
    let seen = Arc::new(Mutex::new(None));
    let s = seen.clone();
    let task = WorkDescriptor::builder()
        .name("large-output")
        .copies(copies, dims)
        .parent(&group)
        .build(scheduler.next_id(), move |ctx| {
            *s.lock() = Some(ctx.wd().state());
        });
    assert_eq!(task.state(), WdState::Created);
    scheduler.submit(task.clone());
    assert_eq!(task.state(), WdState::Queued);
    assert_eq!(group.live(), 2);

    release.store(true, Ordering::SeqCst);
    scheduler.wait_completion(&group);

    assert_eq!(*seen.lock(), Some(WdState::Running));
    assert_eq!(task.state(), WdState::Done);
    assert_eq!(group.live(), 0);
    scheduler.shutdown();
}

#[test]
fn test_task_lifecycle_stackful() {
    run_lifecycle(ExecutionMode::Stackful);
}

#[test]
fn test_task_lifecycle_inline() {
    run_lifecycle(ExecutionMode::Inline);
}

#[test]
fn test_writers_of_one_region_run_in_order() {
    let scheduler = Scheduler::with_config(SchedulerConfig {
        num_workers: 4,
        default_stack_size: 256 * 1024,
        ..SchedulerConfig::default()
    });
    let group = Arc::new(TaskGroup::new("writers"));
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..8 {
        let (copies, dims) = CopySet::new()
            .linear(0x2000, 64, CopyFlags::INOUT)
            .finish();
        let order = order.clone();
        let task = WorkDescriptor::builder()
            .copies(copies, dims)
            .parent(&group)
            .build(scheduler.next_id(), move |ctx| {
                ctx.yield_now();
                order.lock().push(i);
            });
        scheduler.submit(task);
    }

    scheduler.wait_completion(&group);
    assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
    scheduler.shutdown();
}
