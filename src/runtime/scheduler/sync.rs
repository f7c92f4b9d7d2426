//! Synchronization conditions
//!
//! A task blocks on a `SyncCondition` and is woken when the condition is
//! signalled. The waiter list doubles as the condition's lock: a waiter
//! rechecks the condition while holding it before registering, and a
//! signaller takes it after making the condition true, so a wake-up can never
//! slip between the recheck and the registration.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::task::WorkDescriptor;
use super::SchedulerCore;

/// Something a task can wait for.
pub trait SyncCondition: Send + Sync {
    /// Whether the condition holds.
    fn check(&self) -> bool;

    /// The condition's waiter list.
    fn waiters(&self) -> &WaiterList;
}

/// A task registered on a condition.
pub struct Waiter {
    pub(crate) wd: Arc<WorkDescriptor>,
    pub(crate) scheduler: Weak<SchedulerCore>,
}

/// Lock, waiter list and condvar of one condition.
#[derive(Default)]
pub struct WaiterList {
    waiters: Mutex<Vec<Waiter>>,
    /// Threads that are not scheduler workers wait here
    external: Condvar,
}

impl WaiterList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the condition lock.
    pub fn lock(&self) -> MutexGuard<'_, Vec<Waiter>> {
        self.waiters.lock()
    }

    /// Wake every waiter. Call after the condition became true.
    pub fn signal(&self) {
        let waiters = {
            let mut guard = self.waiters.lock();
            self.external.notify_all();
            std::mem::take(&mut *guard)
        };
        for waiter in waiters {
            if let Some(scheduler) = waiter.scheduler.upgrade() {
                scheduler.wake_up(&waiter.wd);
            }
        }
    }

    /// Block the calling OS thread until `check` holds or `timeout` passes.
    pub fn wait_external(
        &self,
        check: impl Fn() -> bool,
        timeout: Duration,
    ) -> bool {
        let mut guard = self.waiters.lock();
        if check() {
            return true;
        }
        self.external.wait_for(&mut guard, timeout);
        check()
    }

    /// Number of registered task waiters.
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

impl fmt::Debug for WaiterList {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("WaiterList")
            .field("waiters", &self.len())
            .finish()
    }
}

/// A one-shot flag.
#[derive(Debug, Default)]
pub struct SingleSyncCond {
    flag: AtomicBool,
    waiters: WaiterList,
}

impl SingleSyncCond {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every waiter.
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.waiters.signal();
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl SyncCondition for SingleSyncCond {
    fn check(&self) -> bool {
        self.is_set()
    }

    fn waiters(&self) -> &WaiterList {
        &self.waiters
    }
}
