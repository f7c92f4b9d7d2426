//! Task execution contexts
//!
//! A stackful task runs on a dedicated OS thread that acts as its context.
//! Exactly one context per worker is unparked at any time: switching hands a
//! `Resume` to the target context and parks the caller. The resumed side runs
//! the `SwitchHelper` it receives on behalf of the context that gave up the
//! worker.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use super::task::{WorkDescriptor, WorkerId};

/// What the resumed context must do for the context it replaced.
#[derive(Debug)]
pub(crate) enum SwitchHelper {
    /// Nothing. The old context is blocked, or it was the worker's home.
    None,
    /// The old task yielded and goes back to the ready queue.
    Requeue(Arc<WorkDescriptor>),
    /// The old task finished. Its thread is joined.
    Exit(Arc<WorkDescriptor>),
}

/// Handed to a context when it is given a worker.
#[derive(Debug)]
pub(crate) struct Resume {
    pub worker: WorkerId,
    pub helper: SwitchHelper,
}

/// One-slot handoff between contexts.
#[derive(Debug, Default)]
pub(crate) struct Parker {
    slot: Mutex<Option<Resume>>,
    cv: Condvar,
}

impl Parker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give the worker to the parked context. Works before it parks too.
    pub fn unpark(
        &self,
        resume: Resume,
    ) {
        let mut slot = self.slot.lock();
        debug_assert!(slot.is_none(), "context resumed twice");
        *slot = Some(resume);
        self.cv.notify_one();
    }

    /// Wait until some worker resumes this context.
    pub fn park(&self) -> Resume {
        let mut slot = self.slot.lock();
        loop {
            if let Some(resume) = slot.take() {
                return resume;
            }
            self.cv.wait(&mut slot);
        }
    }
}

/// The OS thread backing a stackful task.
#[derive(Debug)]
pub(crate) struct FiberContext {
    parker: Arc<Parker>,
    thread: Option<JoinHandle<()>>,
}

impl FiberContext {
    /// Spawn a parked context. `body` runs once it is first resumed.
    ///
    /// Fails when the OS refuses another thread or a stack of `stack_size`.
    pub fn spawn<F>(
        name: String,
        stack_size: usize,
        body: F,
    ) -> io::Result<Self>
    where
        F: FnOnce(Resume) + Send + 'static,
    {
        let parker = Arc::new(Parker::new());
        let entry = parker.clone();
        let thread = thread::Builder::new()
            .name(name)
            .stack_size(stack_size)
            .spawn(move || {
                let resume = entry.park();
                body(resume);
            })?;
        Ok(Self {
            parker,
            thread: Some(thread),
        })
    }

    #[inline]
    pub fn parker(&self) -> Arc<Parker> {
        self.parker.clone()
    }

    /// Wait for the context's thread to return.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("task context panicked");
            }
        }
    }
}
