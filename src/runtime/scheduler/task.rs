//! Work descriptors.
//!
//! A `WorkDescriptor` is one schedulable task: a closure, its captured
//! argument bytes, the copies it declares for coherence, and the scheduling
//! state the scheduler keeps for it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::copy::{CopyData, DimensionTable};
use super::fiber::FiberContext;
use super::group::TaskGroup;
use super::SchedulerCore;
use crate::network::handle::Token;
use crate::network::NodeId;

/// Work descriptor identifier, unique per creating node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WdId(pub u64);

impl WdId {
    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl From<u64> for WdId {
    fn from(val: u64) -> Self {
        Self(val)
    }
}

impl fmt::Display for WdId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "WD({})", self.0)
    }
}

/// Worker thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Worker({})", self.0)
    }
}

/// Lifecycle of a work descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WdState {
    /// Built, or submitted and waiting for predecessors.
    Created,
    /// In a ready queue.
    Queued,
    /// Executing on a worker.
    Running,
    /// Suspended on a synchronization condition.
    Blocked,
    /// Finished.
    Done,
}

impl WdState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => WdState::Created,
            1 => WdState::Queued,
            2 => WdState::Running,
            3 => WdState::Blocked,
            _ => WdState::Done,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            WdState::Created => 0,
            WdState::Queued => 1,
            WdState::Running => 2,
            WdState::Blocked => 3,
            WdState::Done => 4,
        }
    }
}

/// Task priority levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Ord, PartialOrd, Default)]
pub enum TaskPriority {
    /// Low priority tasks.
    Low = 0,
    /// Normal priority (default).
    #[default]
    Normal = 1,
    /// High priority tasks.
    High = 2,
    /// Critical priority tasks.
    Critical = 3,
}

/// Device architecture a task is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Architecture {
    /// General purpose CPU
    #[default]
    Smp = 0,
    Gpu = 1,
    OpenCl = 2,
}

impl Architecture {
    /// Parse the wire value.
    pub fn from_u64(val: u64) -> Option<Self> {
        match val {
            0 => Some(Architecture::Smp),
            1 => Some(Architecture::Gpu),
            2 => Some(Architecture::OpenCl),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        *self as u64
    }

    /// Index into per-architecture tables.
    #[inline]
    pub fn index(&self) -> usize {
        *self as usize
    }
}

/// Back reference from a reconstructed task to the task that sent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteOrigin {
    /// Node the work came from
    pub node: NodeId,
    /// Id of the task on that node
    pub host_id: WdId,
    /// Completion handle to return with work-done
    pub token: Token,
}

/// The body of a task.
pub type TaskFn = Box<dyn FnOnce(&TaskContext<'_>) + Send>;

/// What a running task sees of its environment.
pub struct TaskContext<'a> {
    pub(crate) scheduler: &'a Arc<SchedulerCore>,
    pub(crate) wd: &'a Arc<WorkDescriptor>,
}

impl<'a> TaskContext<'a> {
    /// The running task.
    #[inline]
    pub fn wd(&self) -> &Arc<WorkDescriptor> {
        self.wd
    }

    /// Captured argument bytes.
    #[inline]
    pub fn args(&self) -> &Bytes {
        self.wd.args()
    }

    /// The scheduler running this task.
    #[inline]
    pub fn scheduler(&self) -> &Arc<SchedulerCore> {
        self.scheduler
    }

    /// Worker the task is executing on right now.
    ///
    /// An untied task may continue on another worker after it blocked.
    pub fn worker(&self) -> WorkerId {
        super::current_worker().unwrap_or(WorkerId(usize::MAX))
    }

    /// Submit a child task.
    pub fn submit(
        &self,
        wd: Arc<WorkDescriptor>,
    ) {
        self.scheduler.submit(wd);
    }

    /// Let another ready task run.
    pub fn yield_now(&self) {
        self.scheduler.yield_now();
    }
}

const NOT_TIED: usize = usize::MAX;

/// A schedulable task.
pub struct WorkDescriptor {
    id: WdId,
    name: String,
    state: AtomicU8,
    priority: TaskPriority,
    tied: bool,
    tied_to: AtomicUsize,
    arch: Architecture,
    stack_size: usize,
    args: Bytes,
    copies: Vec<CopyData>,
    dimensions: DimensionTable,
    parent: Option<Arc<TaskGroup>>,
    origin: Option<RemoteOrigin>,
    /// Set while the task waits on a condition
    waiting: AtomicBool,
    work: Mutex<Option<TaskFn>>,
    /// Unfinished predecessors
    pending_preds: AtomicUsize,
    started: AtomicBool,
    pub(crate) context: Mutex<Option<FiberContext>>,
}

impl fmt::Debug for WorkDescriptor {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("WorkDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("priority", &self.priority)
            .field("tied_to", &self.tied_to())
            .field("arch", &self.arch)
            .field("copies", &self.copies.len())
            .field("origin", &self.origin)
            .finish()
    }
}

impl WorkDescriptor {
    /// Start building a work descriptor.
    #[inline]
    pub fn builder() -> WdBuilder {
        WdBuilder::new()
    }

    #[inline]
    pub fn id(&self) -> WdId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn state(&self) -> WdState {
        WdState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn set_state(
        &self,
        state: WdState,
    ) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Move from `from` to `to` if the task is in `from`.
    #[inline]
    pub fn transition(
        &self,
        from: WdState,
        to: WdState,
    ) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Mark the task done and release its slot in the parent group.
    ///
    /// Returns `false` if it was already done.
    pub fn done(&self) -> bool {
        if !self.mark_done() {
            return false;
        }
        self.release_parent();
        true
    }

    /// Set the state to done. Returns `false` if it already was.
    #[inline]
    pub(crate) fn mark_done(&self) -> bool {
        WdState::from_u8(self.state.swap(WdState::Done.as_u8(), Ordering::SeqCst)) != WdState::Done
    }

    #[inline]
    pub(crate) fn release_parent(&self) {
        if let Some(parent) = &self.parent {
            parent.child_done();
        }
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.state() == WdState::Done
    }

    #[inline]
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// Whether the task must always resume on the worker that started it.
    #[inline]
    pub fn is_tied(&self) -> bool {
        self.tied
    }

    /// Worker the task is tied to, if any.
    #[inline]
    pub fn tied_to(&self) -> Option<WorkerId> {
        match self.tied_to.load(Ordering::SeqCst) {
            NOT_TIED => None,
            w => Some(WorkerId(w)),
        }
    }

    /// Tie the task to `worker`. Fails if it is tied elsewhere.
    pub fn tie_to(
        &self,
        worker: WorkerId,
    ) -> bool {
        match self.tied_to.compare_exchange(NOT_TIED, worker.0, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => true,
            Err(current) => current == worker.0,
        }
    }

    /// Whether `worker` may run or resume this task.
    #[inline]
    pub fn can_run_on(
        &self,
        worker: WorkerId,
    ) -> bool {
        self.tied_to().map_or(true, |w| w == worker)
    }

    #[inline]
    pub fn arch(&self) -> Architecture {
        self.arch
    }

    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    #[inline]
    pub fn args(&self) -> &Bytes {
        &self.args
    }

    #[inline]
    pub fn copies(&self) -> &[CopyData] {
        &self.copies
    }

    #[inline]
    pub fn dimensions(&self) -> &DimensionTable {
        &self.dimensions
    }

    #[inline]
    pub fn parent(&self) -> Option<&Arc<TaskGroup>> {
        self.parent.as_ref()
    }

    /// Set for tasks reconstructed from a work message.
    #[inline]
    pub fn origin(&self) -> Option<&RemoteOrigin> {
        self.origin.as_ref()
    }

    /// Whether the task is currently registered on a condition.
    #[inline]
    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn set_waiting(
        &self,
        waiting: bool,
    ) {
        self.waiting.store(waiting, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn take_work(&self) -> Option<TaskFn> {
        self.work.lock().take()
    }

    /// Returns `true` the first time it is called.
    #[inline]
    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    /// Undo `mark_started` for a task whose context could not be created.
    #[inline]
    pub(crate) fn clear_started(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn set_pending_preds(
        &self,
        n: usize,
    ) {
        self.pending_preds.store(n, Ordering::SeqCst);
    }

    /// One predecessor finished; `true` when none are left.
    #[inline]
    pub(crate) fn pred_done(&self) -> bool {
        self.pending_preds.fetch_sub(1, Ordering::SeqCst) == 1
    }
}

/// Builder for work descriptors.
#[derive(Debug, Default)]
pub struct WdBuilder {
    name: Option<String>,
    priority: TaskPriority,
    stack_size: Option<usize>,
    tied: bool,
    arch: Architecture,
    args: Bytes,
    copies: Vec<CopyData>,
    dimensions: DimensionTable,
    parent: Option<Arc<TaskGroup>>,
    origin: Option<RemoteOrigin>,
}

impl WdBuilder {
    /// Create a new builder.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn name(
        mut self,
        name: impl Into<String>,
    ) -> Self {
        self.name = Some(name.into());
        self
    }

    #[inline]
    pub fn priority(
        mut self,
        priority: TaskPriority,
    ) -> Self {
        self.priority = priority;
        self
    }

    #[inline]
    pub fn stack_size(
        mut self,
        size: usize,
    ) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Pin the task to the first worker that runs it.
    #[inline]
    pub fn tied(
        mut self,
        tied: bool,
    ) -> Self {
        self.tied = tied;
        self
    }

    #[inline]
    pub fn arch(
        mut self,
        arch: Architecture,
    ) -> Self {
        self.arch = arch;
        self
    }

    #[inline]
    pub fn args(
        mut self,
        args: impl Into<Bytes>,
    ) -> Self {
        self.args = args.into();
        self
    }

    /// Declare the task's copies and their dimension table.
    #[inline]
    pub fn copies(
        mut self,
        copies: Vec<CopyData>,
        dimensions: DimensionTable,
    ) -> Self {
        self.copies = copies;
        self.dimensions = dimensions;
        self
    }

    #[inline]
    pub fn parent(
        mut self,
        group: &Arc<TaskGroup>,
    ) -> Self {
        self.parent = Some(group.clone());
        self
    }

    #[inline]
    pub fn origin(
        mut self,
        origin: RemoteOrigin,
    ) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Build the task with the given ID and body.
    ///
    /// The task counts as a live child of its parent group from here on.
    pub fn build<F>(
        self,
        id: WdId,
        work: F,
    ) -> Arc<WorkDescriptor>
    where
        F: FnOnce(&TaskContext<'_>) + Send + 'static,
    {
        if let Some(parent) = &self.parent {
            parent.add_child();
        }
        Arc::new(WorkDescriptor {
            id,
            name: self.name.unwrap_or_else(|| id.to_string()),
            state: AtomicU8::new(WdState::Created.as_u8()),
            priority: self.priority,
            tied: self.tied,
            tied_to: AtomicUsize::new(NOT_TIED),
            arch: self.arch,
            stack_size: self.stack_size.unwrap_or(super::DEFAULT_STACK_SIZE),
            args: self.args,
            copies: self.copies,
            dimensions: self.dimensions,
            parent: self.parent,
            origin: self.origin,
            waiting: AtomicBool::new(false),
            work: Mutex::new(Some(Box::new(work))),
            pending_preds: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            context: Mutex::new(None),
        })
    }
}

/// Generator for task IDs.
#[derive(Debug)]
pub struct WdIdGenerator {
    next_id: std::sync::atomic::AtomicU64,
}

impl WdIdGenerator {
    /// Create a new ID generator. IDs start at 1.
    #[inline]
    pub fn new() -> Self {
        Self {
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Generate the next task ID.
    #[inline]
    #[allow(clippy::should_implement_trait)]
    pub fn next(&self) -> WdId {
        WdId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for WdIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
