//! Ready queues for the scheduling policies
//!
//! Multi-producer, multi-consumer queues of work descriptors, with priority support.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::task::{TaskPriority, WorkDescriptor};

/// A thread-safe task queue supporting multiple producers and consumers.
#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: Mutex<VecDeque<Arc<WorkDescriptor>>>,
}

impl TaskQueue {
    /// Create a new empty task queue.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a task to the back of the queue.
    #[inline]
    pub fn push(
        &self,
        wd: Arc<WorkDescriptor>,
    ) {
        self.inner.lock().push_back(wd);
    }

    /// Push a task to the front of the queue (high priority).
    #[inline]
    pub fn push_front(
        &self,
        wd: Arc<WorkDescriptor>,
    ) {
        self.inner.lock().push_front(wd);
    }

    /// Pop a task from the front of the queue.
    #[inline]
    pub fn pop_front(&self) -> Option<Arc<WorkDescriptor>> {
        self.inner.lock().pop_front()
    }

    /// Pop a task from the back of the queue (for work stealing).
    #[inline]
    pub fn pop_back(&self) -> Option<Arc<WorkDescriptor>> {
        self.inner.lock().pop_back()
    }

    /// Get the number of tasks in the queue.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if the queue is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Priority-aware task queue.
///
/// Tasks are ordered by priority, with higher priority tasks executed first.
#[derive(Debug, Default)]
pub struct PriorityTaskQueue {
    high: TaskQueue,
    normal: TaskQueue,
    low: TaskQueue,
}

impl PriorityTaskQueue {
    /// Create a new priority task queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a task at its own priority.
    pub fn push(
        &self,
        wd: Arc<WorkDescriptor>,
    ) {
        match wd.priority() {
            TaskPriority::Critical => self.high.push_front(wd),
            TaskPriority::High => self.high.push(wd),
            TaskPriority::Normal => self.normal.push(wd),
            TaskPriority::Low => self.low.push(wd),
        }
    }

    /// Pop the highest priority task available.
    pub fn pop(&self) -> Option<Arc<WorkDescriptor>> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    /// Pop from back (for work stealing): less important tasks go first.
    pub fn pop_back(&self) -> Option<Arc<WorkDescriptor>> {
        self.low
            .pop_back()
            .or_else(|| self.normal.pop_back())
            .or_else(|| self.high.pop_back())
    }

    /// Get total number of tasks.
    pub fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.high.is_empty() && self.normal.is_empty() && self.low.is_empty()
    }
}
