//! Task groups.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::sync::{SyncCondition, WaiterList};

/// Counts the live children of a parent task.
///
/// The group is complete when the counter is zero. Every child is added
/// when it is built and removed exactly once, when it is done.
#[derive(Debug, Default)]
pub struct TaskGroup {
    name: String,
    live: AtomicUsize,
    waiters: WaiterList,
}

impl TaskGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            live: AtomicUsize::new(0),
            waiters: WaiterList::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register one more live child.
    #[inline]
    pub fn add_child(&self) {
        self.live.fetch_add(1, Ordering::SeqCst);
    }

    /// A child finished. Wakes waiters when it was the last one.
    pub fn child_done(&self) {
        let prev = self.live.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "task group {} underflow", self.name);
        if prev == 1 {
            self.waiters.signal();
        }
    }

    /// Number of live children.
    #[inline]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.live() == 0
    }
}

impl SyncCondition for TaskGroup {
    fn check(&self) -> bool {
        self.is_idle()
    }

    fn waiters(&self) -> &WaiterList {
        &self.waiters
    }
}
