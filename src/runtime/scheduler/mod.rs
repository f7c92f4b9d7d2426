//! Cooperative task scheduler
//!
//! Worker threads pull work descriptors from a pluggable `SchedulePolicy`.
//! A task that waits on a `SyncCondition` gives its worker to another task
//! instead of blocking the thread. Two execution modes exist:
//!
//! - `Stackful`: every task owns a context (see `fiber`). A blocked task is
//!   parked and later resumed, possibly on another worker unless it is tied.
//! - `Inline`: tasks run on the worker's own stack. A waiting task runs other
//!   ready tasks nested inside its wait until the condition holds.

pub mod copy;
pub mod deps;
mod fiber;
pub mod group;
pub mod policy;
pub mod queue;
pub mod sync;
pub mod task;
pub mod work_stealer;

pub use copy::{CopyData, CopyFlags, CopySet, DimRange, DimensionTable, RegionDimension};
pub use deps::DependencyTracker;
pub use group::TaskGroup;
pub use policy::{FifoPolicy, SchedulePolicy};
pub use queue::{PriorityTaskQueue, TaskQueue};
pub use sync::{SingleSyncCond, SyncCondition, WaiterList};
pub use task::{
    Architecture, RemoteOrigin, TaskContext, TaskFn, TaskPriority, WdBuilder, WdId, WdIdGenerator,
    WdState, WorkDescriptor, WorkerId,
};
pub use work_stealer::{StealStats, StealStrategy, WorkStealingPolicy};

use std::cell::RefCell;
use std::fmt;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use fiber::{FiberContext, Parker, Resume, SwitchHelper};
use sync::Waiter;

/// Stack size of a task context unless the task asks for another.
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

/// How tasks get a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Tasks run nested on the worker stack
    Inline,
    /// Each task runs on its own context
    #[default]
    Stackful,
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    pub num_workers: usize,
    /// Stack size for tasks that ask for zero.
    pub default_stack_size: usize,
    /// Checks of a condition before a task registers as a waiter.
    pub wait_spins: u32,
    /// Work stealing instead of one shared queue.
    pub use_work_stealing: bool,
    /// Idle timeout before polling again.
    pub idle_timeout: Duration,
    pub mode: ExecutionMode,
    /// Measure execution time.
    pub enable_stats: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let num_cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            num_workers: num_cpus,
            default_stack_size: DEFAULT_STACK_SIZE,
            wait_spins: 100,
            use_work_stealing: true,
            idle_timeout: Duration::from_millis(1),
            mode: ExecutionMode::Stackful,
            enable_stats: false,
        }
    }
}

/// Scheduler statistics.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Total tasks submitted.
    pub tasks_submitted: AtomicUsize,
    /// Total tasks completed.
    pub tasks_completed: AtomicUsize,
    /// Times a task registered on a condition.
    pub tasks_blocked: AtomicUsize,
    /// Blocked tasks made ready again.
    pub tasks_woken: AtomicUsize,
    /// Context switches between tasks.
    pub context_switches: AtomicUsize,
    /// Total execution time in microseconds.
    pub total_exec_time_us: AtomicUsize,
    /// Tasks executing right now.
    pub running: AtomicUsize,
    /// Peak number of running tasks.
    pub peak_parallelism: AtomicUsize,
}

impl SchedulerStats {
    #[inline]
    pub fn record_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub fn record_completed(
        &self,
        duration_us: usize,
    ) {
        self.tasks_completed.fetch_add(1, Ordering::SeqCst);
        self.total_exec_time_us
            .fetch_add(duration_us, Ordering::SeqCst);
    }

    #[inline]
    pub fn record_blocked(&self) {
        self.tasks_blocked.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub fn record_woken(&self) {
        self.tasks_woken.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub fn record_switch(&self) {
        self.context_switches.fetch_add(1, Ordering::SeqCst);
    }

    fn task_started(&self) {
        let current = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.update_parallelism(current);
    }

    fn task_finished(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    /// Update parallelism.
    #[inline]
    pub fn update_parallelism(
        &self,
        current: usize,
    ) {
        loop {
            let peak = self.peak_parallelism.load(Ordering::SeqCst);
            if current <= peak {
                break;
            }
            if self
                .peak_parallelism
                .compare_exchange(peak, current, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
    }
}

/// Observes task lifecycle events.
pub trait TaskHooks: Send + Sync {
    /// The task is about to run its body for the first time.
    fn on_start(
        &self,
        _wd: &Arc<WorkDescriptor>,
    ) {
    }

    /// The task finished and its dependents were released.
    fn on_done(
        &self,
        wd: &Arc<WorkDescriptor>,
        worker: WorkerId,
    );
}

/// Called by idle workers and by waiting tasks between condition checks.
pub type IdleHook = Arc<dyn Fn() + Send + Sync>;

/// Scheduling state shared by the workers and every task context.
pub struct SchedulerCore {
    config: SchedulerConfig,
    policy: Arc<dyn SchedulePolicy>,
    running: AtomicBool,
    stats: SchedulerStats,
    deps: Mutex<DependencyTracker>,
    hooks: RwLock<Option<Arc<dyn TaskHooks>>>,
    idle_hook: RwLock<Option<IdleHook>>,
    ids: WdIdGenerator,
    /// Home context of each worker thread
    homes: Vec<Arc<Parker>>,
}

impl fmt::Debug for SchedulerCore {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("SchedulerCore")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .field("running", &self.is_running())
            .finish()
    }
}

struct Current {
    core: Arc<SchedulerCore>,
    worker: WorkerId,
    wd: Option<Arc<WorkDescriptor>>,
}

thread_local! {
    static CURRENT: RefCell<Option<Current>> = const { RefCell::new(None) };
}

/// Worker the calling thread is executing for, if any.
pub(crate) fn current_worker() -> Option<WorkerId> {
    CURRENT.with(|c| c.borrow().as_ref().map(|c| c.worker))
}

fn set_current_worker(worker: WorkerId) {
    CURRENT.with(|c| {
        if let Some(current) = c.borrow_mut().as_mut() {
            current.worker = worker;
        }
    });
}

fn replace_current_wd(wd: Option<Arc<WorkDescriptor>>) -> Option<Arc<WorkDescriptor>> {
    CURRENT.with(|c| match c.borrow_mut().as_mut() {
        Some(current) => std::mem::replace(&mut current.wd, wd),
        None => None,
    })
}

impl SchedulerCore {
    fn new(config: SchedulerConfig) -> Self {
        let n = config.num_workers;
        let policy: Arc<dyn SchedulePolicy> = if config.use_work_stealing {
            Arc::new(WorkStealingPolicy::new(n))
        } else {
            Arc::new(FifoPolicy::new(n))
        };
        Self {
            policy,
            running: AtomicBool::new(true),
            stats: SchedulerStats::default(),
            deps: Mutex::new(DependencyTracker::new()),
            hooks: RwLock::new(None),
            idle_hook: RwLock::new(None),
            ids: WdIdGenerator::new(),
            homes: (0..n).map(|_| Arc::new(Parker::new())).collect(),
            config,
        }
    }

    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    #[inline]
    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    #[inline]
    pub fn policy(&self) -> &Arc<dyn SchedulePolicy> {
        &self.policy
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the workers once they are back at their home context.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Next task ID of this node.
    #[inline]
    pub fn next_id(&self) -> WdId {
        self.ids.next()
    }

    pub fn set_hooks(
        &self,
        hooks: Arc<dyn TaskHooks>,
    ) {
        *self.hooks.write() = Some(hooks);
    }

    pub fn set_idle_hook(
        &self,
        hook: IdleHook,
    ) {
        *self.idle_hook.write() = Some(hook);
    }

    fn run_idle_hook(&self) {
        let hook = self.idle_hook.read().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn hooks(&self) -> Option<Arc<dyn TaskHooks>> {
        self.hooks.read().clone()
    }

    /// The calling thread's worker and task, if it belongs to this scheduler.
    fn current_in(self: &Arc<Self>) -> Option<(WorkerId, Option<Arc<WorkDescriptor>>)> {
        CURRENT.with(|c| {
            c.borrow()
                .as_ref()
                .filter(|c| Arc::ptr_eq(&c.core, self))
                .map(|c| (c.worker, c.wd.clone()))
        })
    }

    fn stackful(
        &self,
        wd: &WorkDescriptor,
    ) -> bool {
        self.config.mode == ExecutionMode::Stackful && wd.context.lock().is_some()
    }

    /// Submit a task.
    ///
    /// The task waits for the unfinished tasks whose copies conflict with its
    /// own, then becomes ready. When the policy answers the submission with a
    /// task to run now, the calling task yields to it.
    pub fn submit(
        self: &Arc<Self>,
        wd: Arc<WorkDescriptor>,
    ) {
        let Some(ready) = self.admit(wd) else {
            return;
        };
        let here = self.current_in();
        let worker = here.as_ref().map(|(w, _)| *w);
        let Some(next) = self.policy.at_submit(worker, ready) else {
            return;
        };
        match here {
            Some((w, Some(cur))) if self.stackful(&cur) && next.can_run_on(w) => {
                self.switch_to(Some(next), SwitchHelper::Requeue(cur));
            },
            _ => self.policy.queue(worker, next),
        }
    }

    /// Queue a task without ever switching away from the caller.
    ///
    /// Safe to call from message handlers.
    pub fn spawn(
        self: &Arc<Self>,
        wd: Arc<WorkDescriptor>,
    ) {
        if let Some(ready) = self.admit(wd) {
            self.policy.queue(current_worker(), ready);
        }
    }

    /// Register dependencies; returns the task if it is ready now.
    fn admit(
        &self,
        wd: Arc<WorkDescriptor>,
    ) -> Option<Arc<WorkDescriptor>> {
        self.stats.record_submitted();
        let preds = self.deps.lock().register(&wd);
        if preds > 0 {
            tracing::trace!("{} waits for {} predecessors", wd.id(), preds);
            return None;
        }
        wd.set_state(WdState::Queued);
        Some(wd)
    }

    /// Make a task ready, bypassing dependency tracking.
    pub fn queue(
        &self,
        wd: Arc<WorkDescriptor>,
    ) {
        wd.set_state(WdState::Queued);
        self.policy.queue(current_worker(), wd);
    }

    /// Wait until `cond` holds without blocking the worker.
    pub fn wait_on_condition(
        self: &Arc<Self>,
        cond: &dyn SyncCondition,
    ) {
        for _ in 0..self.config.wait_spins {
            if cond.check() {
                return;
            }
            std::hint::spin_loop();
        }

        match self.current_in() {
            None => self.wait_external(cond),
            Some((_, Some(cur))) if self.stackful(&cur) => self.wait_stackful(cond, cur),
            Some((_, cur)) => self.wait_inline(cond, cur),
        }
    }

    fn wait_stackful(
        self: &Arc<Self>,
        cond: &dyn SyncCondition,
        cur: Arc<WorkDescriptor>,
    ) {
        loop {
            {
                let mut waiters = cond.waiters().lock();
                if cond.check() {
                    return;
                }
                cur.set_waiting(true);
                cur.set_state(WdState::Blocked);
                waiters.push(Waiter {
                    wd: cur.clone(),
                    scheduler: Arc::downgrade(self),
                });
            }
            self.stats.record_blocked();
            tracing::trace!("{} blocked", cur.id());

            let worker = current_worker().unwrap_or(WorkerId(0));
            let next = self.policy.at_block(worker, &cur);
            self.switch_to(next, SwitchHelper::None);
            cur.set_waiting(false);

            if cond.check() {
                return;
            }
        }
    }

    fn wait_inline(
        self: &Arc<Self>,
        cond: &dyn SyncCondition,
        cur: Option<Arc<WorkDescriptor>>,
    ) {
        loop {
            {
                let _waiters = cond.waiters().lock();
                if cond.check() {
                    return;
                }
            }
            let worker = current_worker().unwrap_or(WorkerId(0));
            let next = match &cur {
                Some(cur) => self.policy.at_block(worker, cur),
                None => self.policy.at_idle(worker),
            };
            match next {
                // A parked context cannot be nested, it must be resumed by a worker home
                Some(next) if next.context.lock().is_some() => {
                    self.policy.queue(Some(worker), next);
                    self.run_idle_hook();
                    thread::yield_now();
                },
                Some(next) => self.inline_work(next),
                None => {
                    self.run_idle_hook();
                    thread::yield_now();
                },
            }
        }
    }

    fn wait_external(
        &self,
        cond: &dyn SyncCondition,
    ) {
        loop {
            if cond.check() {
                return;
            }
            self.run_idle_hook();
            if cond
                .waiters()
                .wait_external(|| cond.check(), self.config.idle_timeout)
            {
                return;
            }
        }
    }

    /// Wait until every task in `group` has finished.
    pub fn wait_completion(
        self: &Arc<Self>,
        group: &TaskGroup,
    ) {
        self.wait_on_condition(group);
    }

    /// Make a blocked task ready again. A no-op for any other state.
    pub fn wake_up(
        &self,
        wd: &Arc<WorkDescriptor>,
    ) {
        if wd.transition(WdState::Blocked, WdState::Queued) {
            self.stats.record_woken();
            tracing::trace!("{} woken", wd.id());
            self.policy.queue(current_worker(), wd.clone());
        }
    }

    /// Offer the worker to another ready task.
    pub fn yield_now(self: &Arc<Self>) {
        let Some((worker, Some(cur))) = self.current_in() else {
            thread::yield_now();
            return;
        };
        let Some(next) = self.policy.at_yield(worker, &cur) else {
            return;
        };
        if self.stackful(&cur) {
            self.switch_to(Some(next), SwitchHelper::Requeue(cur));
        } else if next.context.lock().is_some() {
            self.policy.queue(Some(worker), next);
        } else {
            self.inline_work(next);
        }
    }

    /// Run `wd` to completion right here, nested in the current task.
    ///
    /// # Panics
    ///
    /// Panics if `wd` is tied to another worker.
    pub fn inline_work(
        self: &Arc<Self>,
        wd: Arc<WorkDescriptor>,
    ) {
        let Some(worker) = current_worker() else {
            self.queue(wd);
            return;
        };
        assert!(
            wd.can_run_on(worker),
            "{} is tied to {:?}, cannot run on {}",
            wd.id(),
            wd.tied_to(),
            worker
        );
        if wd.is_tied() {
            wd.tie_to(worker);
        }
        wd.set_state(WdState::Running);
        wd.mark_started();

        let prev = replace_current_wd(Some(wd.clone()));
        self.run_task(&wd);
        replace_current_wd(prev);

        // Inline tasks never leave the thread
        debug_assert_eq!(current_worker(), Some(worker));
    }

    /// Run the body of `wd` on the calling thread and finish it.
    fn run_task(
        self: &Arc<Self>,
        wd: &Arc<WorkDescriptor>,
    ) {
        if let Some(hooks) = self.hooks() {
            hooks.on_start(wd);
        }
        self.stats.task_started();
        let start = self.config.enable_stats.then(Instant::now);

        if let Some(work) = wd.take_work() {
            let ctx = TaskContext {
                scheduler: self,
                wd,
            };
            if panic::catch_unwind(AssertUnwindSafe(|| work(&ctx))).is_err() {
                tracing::error!("{} ({}) panicked", wd.id(), wd.name());
                std::process::abort();
            }
        }

        self.stats.task_finished();
        let duration_us = start.map_or(0, |s| s.elapsed().as_micros() as usize);
        self.finish(wd, duration_us);
    }

    fn finish(
        &self,
        wd: &Arc<WorkDescriptor>,
        duration_us: usize,
    ) {
        if !wd.mark_done() {
            return;
        }
        let worker = current_worker();
        let ready = self.deps.lock().release(wd.id());
        for succ in ready {
            succ.set_state(WdState::Queued);
            self.policy.queue(worker, succ);
        }
        if let Some(hooks) = self.hooks() {
            hooks.on_done(wd, worker.unwrap_or(WorkerId(0)));
        }
        self.stats.record_completed(duration_us);
        tracing::trace!("{} done", wd.id());

        // Group waiters observe everything above
        wd.release_parent();
    }

    /// Hand the worker to `next` (or the worker's home) and park the caller.
    fn switch_to(
        self: &Arc<Self>,
        next: Option<Arc<WorkDescriptor>>,
        helper: SwitchHelper,
    ) {
        let Some((worker, cur)) = self.current_in() else {
            return;
        };
        let parker = match &cur {
            Some(wd) => match wd.context.lock().as_ref() {
                Some(ctx) => ctx.parker(),
                None => return,
            },
            None => self.homes[worker.0].clone(),
        };

        self.stats.record_switch();
        self.resume(worker, next, helper);

        let resume = parker.park();
        set_current_worker(resume.worker);
        self.after_switch(resume.helper);
    }

    /// Give `worker` to `next`, or to the worker's home when there is none.
    fn resume(
        self: &Arc<Self>,
        worker: WorkerId,
        next: Option<Arc<WorkDescriptor>>,
        helper: SwitchHelper,
    ) {
        let resume = Resume { worker, helper };
        let Some(wd) = next else {
            self.homes[worker.0].unpark(resume);
            return;
        };

        assert!(
            wd.can_run_on(worker),
            "{} is tied to {:?}, cannot resume on {}",
            wd.id(),
            wd.tied_to(),
            worker
        );
        if wd.is_tied() {
            wd.tie_to(worker);
        }
        wd.set_state(WdState::Running);

        if wd.mark_started() {
            let stack_size = match wd.stack_size() {
                0 => self.config.default_stack_size,
                n => n,
            };
            let core = self.clone();
            let body_wd = wd.clone();
            let spawned = FiberContext::spawn(format!("flow-task-{}", wd.id().inner()), stack_size, move |resume| {
                core.context_main(body_wd, resume)
            });
            match spawned {
                Ok(ctx) => *wd.context.lock() = Some(ctx),
                Err(err) => {
                    // Retry later from the ready queue; the worker goes home
                    tracing::error!("{}: cannot create a context of {} bytes: {}", wd.id(), stack_size, err);
                    wd.clear_started();
                    wd.set_state(WdState::Queued);
                    self.policy.queue(Some(worker), wd);
                    self.homes[worker.0].unpark(resume);
                    return;
                },
            }
        }

        let parker = wd.context.lock().as_ref().map(FiberContext::parker);
        match parker {
            Some(parker) => parker.unpark(resume),
            None => {
                // Started inline, so it never owned a context
                tracing::error!("{} has no context to resume", wd.id());
                self.homes[worker.0].unpark(resume);
            },
        }
    }

    fn after_switch(
        &self,
        helper: SwitchHelper,
    ) {
        match helper {
            SwitchHelper::None => {},
            SwitchHelper::Requeue(old) => {
                old.set_state(WdState::Queued);
                self.policy.queue(current_worker(), old);
            },
            SwitchHelper::Exit(old) => {
                let ctx = old.context.lock().take();
                if let Some(ctx) = ctx {
                    ctx.join();
                }
            },
        }
    }

    /// Body of a task context thread.
    fn context_main(
        self: Arc<Self>,
        wd: Arc<WorkDescriptor>,
        resume: Resume,
    ) {
        CURRENT.with(|c| {
            *c.borrow_mut() = Some(Current {
                core: self.clone(),
                worker: resume.worker,
                wd: Some(wd.clone()),
            })
        });
        self.after_switch(resume.helper);

        self.run_task(&wd);
        self.exit(wd);

        CURRENT.with(|c| c.borrow_mut().take());
    }

    /// Leave the finished task's context for good.
    fn exit(
        self: &Arc<Self>,
        wd: Arc<WorkDescriptor>,
    ) {
        let worker = current_worker().unwrap_or(WorkerId(0));
        let next = if self.is_running() {
            self.policy.at_exit(worker, &wd)
        } else {
            None
        };
        self.resume(worker, next, SwitchHelper::Exit(wd));
    }

    fn worker_main(
        self: Arc<Self>,
        worker: WorkerId,
    ) {
        CURRENT.with(|c| {
            *c.borrow_mut() = Some(Current {
                core: self.clone(),
                worker,
                wd: None,
            })
        });
        tracing::debug!("{} started", worker);

        self.idle(worker);

        tracing::debug!("{} stopped", worker);
        CURRENT.with(|c| c.borrow_mut().take());
    }

    /// Ask the policy for work until the scheduler stops.
    fn idle(
        self: &Arc<Self>,
        worker: WorkerId,
    ) {
        while self.is_running() {
            self.run_idle_hook();
            match self.policy.at_idle(worker) {
                Some(wd) => self.dispatch(worker, wd),
                None => thread::sleep(self.config.idle_timeout),
            }
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        worker: WorkerId,
        wd: Arc<WorkDescriptor>,
    ) {
        match self.config.mode {
            ExecutionMode::Stackful => self.switch_to(Some(wd), SwitchHelper::None),
            ExecutionMode::Inline if wd.context.lock().is_some() => {
                tracing::error!("{} owns a context in inline mode", wd.id());
                self.policy.queue(Some(worker), wd);
            },
            ExecutionMode::Inline => self.inline_work(wd),
        }
    }
}

/// Owner of a scheduler and its worker threads.
///
/// Dereferences to the shared core, which tasks and message handlers hold.
#[derive(Debug)]
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler with default config.
    #[inline]
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Create a scheduler and start its workers.
    pub fn with_config(mut config: SchedulerConfig) -> Self {
        config.num_workers = config.num_workers.max(1);
        let core = Arc::new(SchedulerCore::new(config));

        let workers = (0..core.config.num_workers)
            .map(|i| {
                let core = core.clone();
                thread::Builder::new()
                    .name(format!("flow-worker-{}", i))
                    .stack_size(core.config.default_stack_size)
                    .spawn(move || core.worker_main(WorkerId(i)))
                    .expect("Failed to spawn worker thread")
            })
            .collect();

        Self {
            core,
            workers: Mutex::new(workers),
        }
    }

    /// Shared handle to the scheduling state.
    #[inline]
    pub fn handle(&self) -> Arc<SchedulerCore> {
        self.core.clone()
    }

    /// Stop and join the workers.
    pub fn shutdown(&self) {
        self.core.stop();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

impl Deref for Scheduler {
    type Target = Arc<SchedulerCore>;

    fn deref(&self) -> &Self::Target {
        &self.core
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.is_running() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests;
