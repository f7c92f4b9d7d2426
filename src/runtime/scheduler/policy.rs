//! Scheduling policies
//!
//! The scheduler asks a `SchedulePolicy` what to run at each decision point:
//! when a task is submitted, when a worker is idle, when the running task
//! blocks, yields or exits. A policy owns the ready structures; the scheduler
//! only hands it tasks through `queue`.
//!
//! A policy must never return a task tied to another worker.

use std::fmt;
use std::sync::Arc;

use super::queue::{PriorityTaskQueue, TaskQueue};
use super::task::{WorkDescriptor, WorkerId};

/// Pluggable scheduling decisions.
pub trait SchedulePolicy: Send + Sync + fmt::Debug {
    /// Make `wd` ready. `worker` is the calling worker, if any.
    fn queue(
        &self,
        worker: Option<WorkerId>,
        wd: Arc<WorkDescriptor>,
    );

    /// A task was submitted. Return it (or another) to run it right away.
    fn at_submit(
        &self,
        worker: Option<WorkerId>,
        wd: Arc<WorkDescriptor>,
    ) -> Option<Arc<WorkDescriptor>> {
        self.queue(worker, wd);
        None
    }

    /// The worker has nothing to run.
    fn at_idle(
        &self,
        worker: WorkerId,
    ) -> Option<Arc<WorkDescriptor>>;

    /// `current` is about to block.
    fn at_block(
        &self,
        worker: WorkerId,
        _current: &Arc<WorkDescriptor>,
    ) -> Option<Arc<WorkDescriptor>> {
        self.at_idle(worker)
    }

    /// `current` offers the worker to another task.
    fn at_yield(
        &self,
        worker: WorkerId,
        _current: &Arc<WorkDescriptor>,
    ) -> Option<Arc<WorkDescriptor>> {
        self.at_idle(worker)
    }

    /// `current` finished.
    fn at_exit(
        &self,
        worker: WorkerId,
        _current: &Arc<WorkDescriptor>,
    ) -> Option<Arc<WorkDescriptor>> {
        self.at_idle(worker)
    }

    /// Tasks currently ready.
    fn num_ready(&self) -> usize;
}

/// One shared priority queue plus a private queue per worker for tied tasks.
#[derive(Debug)]
pub struct FifoPolicy {
    ready: PriorityTaskQueue,
    tied: Vec<TaskQueue>,
}

impl FifoPolicy {
    pub fn new(num_workers: usize) -> Self {
        Self {
            ready: PriorityTaskQueue::new(),
            tied: (0..num_workers.max(1)).map(|_| TaskQueue::new()).collect(),
        }
    }
}

impl SchedulePolicy for FifoPolicy {
    fn queue(
        &self,
        _worker: Option<WorkerId>,
        wd: Arc<WorkDescriptor>,
    ) {
        match wd.tied_to() {
            Some(owner) if owner.0 < self.tied.len() => self.tied[owner.0].push(wd),
            _ => self.ready.push(wd),
        }
    }

    fn at_idle(
        &self,
        worker: WorkerId,
    ) -> Option<Arc<WorkDescriptor>> {
        self.tied
            .get(worker.0)
            .and_then(TaskQueue::pop_front)
            .or_else(|| self.ready.pop())
    }

    fn num_ready(&self) -> usize {
        self.ready.len() + self.tied.iter().map(TaskQueue::len).sum::<usize>()
    }
}
