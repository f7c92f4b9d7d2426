//! Remote work dispatch
//!
//! Offloads a task to another node. The task travels as one serialized
//! block:
//!
//! ```text
//! [args][n_copies: u64][copies][n_dims: u64][dims]
//! ```
//!
//! Blocks larger than one medium message are split: every fragment but the
//! last goes out as `WorkData`, the last one rides in the `Work` header. The
//! receiver reassembles, rebuilds the copy list against one shared dimension
//! table and creates the task through its `TaskFactory`. The task is queued
//! once the input bytes it expects have arrived, and its completion travels
//! back to the origin as `WorkDone`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};

use super::handle::Token;
use super::message::{self, ActiveMessage, WorkHeader, COPY_WIRE_SIZE, DIM_WIRE_SIZE};
use super::transport::NodeId;
use super::{Network, TransferError};
use crate::runtime::memory::AddressSpace;
use crate::runtime::scheduler::{
    Architecture, CopyData, DimensionTable, RemoteOrigin, SingleSyncCond, SyncCondition, TaskContext,
    TaskGroup, WaiterList, WdId, WorkDescriptor,
};

/// Name of a function every node registered under the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub u64);

impl fmt::Display for FunctionId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Fn({})", self.0)
    }
}

/// Body of an offloaded task. Receives the executing node's memory.
pub type EntryFn = Arc<dyn Fn(&TaskContext<'_>, &AddressSpace) + Send + Sync>;

/// Rewrites captured arguments for the executing node before the task is built.
pub type TranslateFn = Arc<dyn Fn(&mut [u8], &[CopyData]) + Send + Sync>;

/// Functions that can be named in work messages.
#[derive(Default)]
pub struct FunctionTable {
    entries: RwLock<HashMap<FunctionId, EntryFn>>,
    translators: RwLock<HashMap<FunctionId, TranslateFn>>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_entry(
        &self,
        id: FunctionId,
        entry: EntryFn,
    ) {
        self.entries.write().insert(id, entry);
    }

    pub fn register_translate(
        &self,
        id: FunctionId,
        translate: TranslateFn,
    ) {
        self.translators.write().insert(id, translate);
    }

    pub fn entry(
        &self,
        id: FunctionId,
    ) -> Option<EntryFn> {
        self.entries.read().get(&id).cloned()
    }

    pub fn translate(
        &self,
        id: FunctionId,
    ) -> Option<TranslateFn> {
        self.translators.read().get(&id).cloned()
    }
}

impl fmt::Debug for FunctionTable {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("FunctionTable")
            .field("entries", &self.entries.read().len())
            .field("translators", &self.translators.read().len())
            .finish()
    }
}

/// Errors raised while reconstructing incoming work.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Unsupported architecture {0}")]
    UnsupportedArchitecture(u64),
    #[error("no function registered as {0}")]
    UnknownFunction(FunctionId),
    #[error("malformed work block: {0}")]
    Malformed(&'static str),
}

/// A reconstructed task, ready to be turned into a work descriptor.
#[derive(Debug)]
pub struct IncomingWork {
    pub id: WdId,
    pub arch: Architecture,
    pub args: Bytes,
    pub copies: Vec<CopyData>,
    pub dimensions: DimensionTable,
    pub origin: RemoteOrigin,
    pub parent: Arc<TaskGroup>,
}

/// Creates work descriptors for incoming work.
pub trait TaskFactory: Send + Sync + fmt::Debug {
    /// Whether this node can run tasks built for `arch`.
    fn supports(
        &self,
        arch: Architecture,
    ) -> bool;

    fn create(
        &self,
        work: IncomingWork,
        entry: EntryFn,
        memory: Arc<AddressSpace>,
    ) -> Arc<WorkDescriptor>;
}

/// Builds plain work descriptors for a fixed set of architectures.
#[derive(Debug, Clone)]
pub struct DefaultTaskFactory {
    architectures: Vec<Architecture>,
}

impl DefaultTaskFactory {
    pub fn new(architectures: Vec<Architecture>) -> Self {
        Self { architectures }
    }
}

impl Default for DefaultTaskFactory {
    fn default() -> Self {
        Self::new(vec![Architecture::Smp])
    }
}

impl TaskFactory for DefaultTaskFactory {
    fn supports(
        &self,
        arch: Architecture,
    ) -> bool {
        self.architectures.contains(&arch)
    }

    fn create(
        &self,
        work: IncomingWork,
        entry: EntryFn,
        memory: Arc<AddressSpace>,
    ) -> Arc<WorkDescriptor> {
        WorkDescriptor::builder()
            .name(format!("remote-{}-{}", work.origin.node.0, work.origin.host_id.0))
            .arch(work.arch)
            .args(work.args)
            .copies(work.copies, work.dimensions)
            .parent(&work.parent)
            .origin(work.origin)
            .build(work.id, move |ctx| entry(ctx, &memory))
    }
}

/// Reassembly buffers of fragmented work, keyed by sender and task.
#[derive(Debug, Default)]
pub struct WorkBufferManager {
    buffers: Mutex<HashMap<(NodeId, WdId), Vec<u8>>>,
}

impl WorkBufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store fragment `index`; every fragment but the last has the same length.
    pub fn store(
        &self,
        source: NodeId,
        wd_id: WdId,
        index: u64,
        total_len: u64,
        data: &[u8],
    ) {
        let offset = index as usize * data.len();
        if offset + data.len() > total_len as usize {
            tracing::warn!(%source, %wd_id, index, "work fragment outside its block");
            return;
        }
        let mut buffers = self.buffers.lock();
        let buffer = buffers
            .entry((source, wd_id))
            .or_insert_with(|| vec![0u8; total_len as usize]);
        if buffer.len() != total_len as usize {
            tracing::warn!(%source, %wd_id, "work fragments disagree on block size");
            return;
        }
        buffer[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Complete the block with its final piece and hand it out.
    pub fn finish(
        &self,
        source: NodeId,
        wd_id: WdId,
        total_len: u64,
        piece: &[u8],
    ) -> Result<Vec<u8>, DispatchError> {
        let total = total_len as usize;
        if piece.len() > total {
            return Err(DispatchError::Malformed("final piece larger than the block"));
        }
        if piece.len() == total {
            self.buffers.lock().remove(&(source, wd_id));
            return Ok(piece.to_vec());
        }
        let mut buffer = self
            .buffers
            .lock()
            .remove(&(source, wd_id))
            .ok_or(DispatchError::Malformed("fragments missing"))?;
        if buffer.len() != total {
            return Err(DispatchError::Malformed("fragments disagree on block size"));
        }
        buffer[total - piece.len()..].copy_from_slice(piece);
        Ok(buffer)
    }

    /// Blocks still being reassembled.
    pub fn pending(&self) -> usize {
        self.buffers.lock().len()
    }
}

/// Serialize arguments, copies and dimensions into one block.
pub fn encode_work(
    args: &[u8],
    copies: &[CopyData],
    dimensions: &DimensionTable,
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(
        args.len() + 16 + copies.len() * COPY_WIRE_SIZE + dimensions.len() * DIM_WIRE_SIZE,
    );
    buf.put_slice(args);
    buf.put_u64_le(copies.len() as u64);
    for copy in copies {
        message::put_copy(&mut buf, copy);
    }
    buf.put_u64_le(dimensions.len() as u64);
    for dim in dimensions.as_slice() {
        message::put_dim(&mut buf, dim);
    }
    buf
}

/// Inverse of `encode_work`; every copy must point inside the dimension table.
pub fn decode_work(
    mut buf: Bytes,
    data_size: u64,
) -> Result<(Bytes, Vec<CopyData>, DimensionTable), DispatchError> {
    if buf.len() < data_size as usize {
        return Err(DispatchError::Malformed("argument block truncated"));
    }
    let args = buf.split_to(data_size as usize);

    if buf.remaining() < 8 {
        return Err(DispatchError::Malformed("copy count missing"));
    }
    let n_copies = buf.get_u64_le();
    let copies = (0..n_copies)
        .map(|_| message::get_copy(&mut buf))
        .collect::<Option<Vec<_>>>()
        .ok_or(DispatchError::Malformed("copy list truncated"))?;

    if buf.remaining() < 8 {
        return Err(DispatchError::Malformed("dimension count missing"));
    }
    let n_dims = buf.get_u64_le();
    let dims = (0..n_dims)
        .map(|_| message::get_dim(&mut buf))
        .collect::<Option<Vec<_>>>()
        .ok_or(DispatchError::Malformed("dimension table truncated"))?;
    let dims = DimensionTable::from(dims);

    if copies.iter().any(|copy| dims.get(copy.dims).is_none()) {
        return Err(DispatchError::Malformed("copy dimensions outside the table"));
    }
    Ok((args, copies, dims))
}

/// Work to offload.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub entry: FunctionId,
    pub translate: Option<FunctionId>,
    pub args: Bytes,
    pub copies: Vec<CopyData>,
    pub dimensions: DimensionTable,
    pub arch: Architecture,
    /// Input bytes the executing node must receive before running
    pub expected_data: u64,
    /// The task on this node the work stands for
    pub wd_id: WdId,
}

impl WorkRequest {
    pub fn new(
        entry: FunctionId,
        wd_id: WdId,
    ) -> Self {
        Self {
            entry,
            translate: None,
            args: Bytes::new(),
            copies: Vec::new(),
            dimensions: DimensionTable::new(),
            arch: Architecture::Smp,
            expected_data: 0,
            wd_id,
        }
    }

    pub fn args(
        mut self,
        args: impl Into<Bytes>,
    ) -> Self {
        self.args = args.into();
        self
    }

    pub fn copies(
        mut self,
        copies: Vec<CopyData>,
        dimensions: DimensionTable,
    ) -> Self {
        self.copies = copies;
        self.dimensions = dimensions;
        self
    }

    pub fn arch(
        mut self,
        arch: Architecture,
    ) -> Self {
        self.arch = arch;
        self
    }

    pub fn translate(
        mut self,
        id: FunctionId,
    ) -> Self {
        self.translate = Some(id);
        self
    }

    pub fn expected_data(
        mut self,
        bytes: u64,
    ) -> Self {
        self.expected_data = bytes;
        self
    }
}

/// Origin side handle of offloaded work; a condition set on completion.
#[derive(Debug)]
pub struct RemoteWork {
    dest: NodeId,
    wd_id: WdId,
    copies: Vec<CopyData>,
    done: SingleSyncCond,
    /// Worker that ran the task on `dest`
    pe: AtomicU64,
}

impl RemoteWork {
    #[inline]
    pub fn dest(&self) -> NodeId {
        self.dest
    }

    #[inline]
    pub fn wd_id(&self) -> WdId {
        self.wd_id
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.done.is_set()
    }

    /// Worker index on `dest` that ran the task, once done.
    pub fn executed_by(&self) -> Option<u64> {
        self.is_done().then(|| self.pe.load(Ordering::SeqCst))
    }
}

impl SyncCondition for RemoteWork {
    fn check(&self) -> bool {
        self.done.check()
    }

    fn waiters(&self) -> &WaiterList {
        self.done.waiters()
    }
}

impl Network {
    /// Offload `request` to `dest`.
    ///
    /// Region metadata for every copy goes first, then the serialized block.
    pub fn send_work(
        &self,
        dest: NodeId,
        request: WorkRequest,
    ) -> Result<Arc<RemoteWork>, TransferError> {
        self.check_node(dest)?;
        let remote = Arc::new(RemoteWork {
            dest,
            wd_id: request.wd_id,
            copies: request.copies.clone(),
            done: SingleSyncCond::new(),
            pe: AtomicU64::new(0),
        });
        let completion = self.remote_work.register(remote.clone());
        if let Err(err) = self.send_work_messages(dest, &request, completion) {
            self.remote_work.take(completion);
            return Err(err);
        }
        tracing::debug!(%dest, wd = %request.wd_id, "work sent");
        Ok(remote)
    }

    /// Region metadata for every copy, the fragments, then the header.
    fn send_work_messages(
        &self,
        dest: NodeId,
        request: &WorkRequest,
        completion: Token,
    ) -> Result<(), TransferError> {
        for copy in &request.copies {
            self.send_region_metadata(dest, copy, &request.dimensions)?;
        }

        let block = encode_work(&request.args, &request.copies, &request.dimensions).freeze();

        let fragment = self.limits.max_medium.max(1);
        let total = block.len();
        let piece_start = if total <= fragment {
            0
        } else {
            (total - 1) / fragment * fragment
        };
        for (index, start) in (0..piece_start).step_by(fragment).enumerate() {
            self.send(
                dest,
                ActiveMessage::WorkData {
                    wd_id: request.wd_id,
                    index: index as u64,
                    total_len: total as u64,
                    data: block.slice(start..start + fragment),
                },
            )?;
        }

        let seq = self.sequences.next(dest);
        self.send(
            dest,
            ActiveMessage::Work(WorkHeader {
                entry: request.entry,
                translate: request.translate,
                completion,
                expected_data: request.expected_data,
                total_size: total as u64,
                data_size: request.args.len() as u64,
                wd_id: request.wd_id,
                arch: request.arch.as_u64(),
                seq,
                piece: block.slice(piece_start..),
            }),
        )?;
        tracing::trace!(%dest, wd = %request.wd_id, bytes = total, "work block sent");
        Ok(())
    }

    /// A work header released by the sequence gate.
    pub(super) fn on_work(
        &self,
        source: NodeId,
        header: WorkHeader,
    ) {
        let host_id = header.wd_id;
        let expected = header.expected_data;
        match self.rebuild_work(source, header) {
            Ok(Some(wd)) => self.scheduler.spawn(wd),
            Ok(None) => tracing::debug!(%source, %host_id, "work waits for input"),
            Err(err) => {
                tracing::error!(%source, %host_id, "dropping work: {}", err);
                let dropped = self.arrivals.lock().discard((source, host_id), expected);
                if dropped > 0 {
                    tracing::debug!(%source, %host_id, bytes = dropped, "input of dropped work discarded");
                }
            },
        }
    }

    fn rebuild_work(
        &self,
        source: NodeId,
        header: WorkHeader,
    ) -> Result<Option<Arc<WorkDescriptor>>, DispatchError> {
        let block = self
            .work_buffers
            .finish(source, header.wd_id, header.total_size, &header.piece)?;
        let arch = Architecture::from_u64(header.arch)
            .filter(|arch| self.factory.supports(*arch))
            .ok_or(DispatchError::UnsupportedArchitecture(header.arch))?;
        let entry = self
            .functions
            .entry(header.entry)
            .ok_or(DispatchError::UnknownFunction(header.entry))?;
        let (mut args, copies, dimensions) = decode_work(Bytes::from(block), header.data_size)?;

        if let Some(id) = header.translate {
            let translate = self
                .functions
                .translate(id)
                .ok_or(DispatchError::UnknownFunction(id))?;
            let mut raw = args.to_vec();
            translate(&mut raw, &copies);
            args = Bytes::from(raw);
        }

        let work = IncomingWork {
            id: self.scheduler.next_id(),
            arch,
            args,
            copies,
            dimensions,
            origin: RemoteOrigin {
                node: source,
                host_id: header.wd_id,
                token: header.completion,
            },
            parent: self.remote_groups[arch.index()].clone(),
        };
        let wd = self.factory.create(work, entry, self.memory.clone());
        Ok(self
            .arrivals
            .lock()
            .expect((source, header.wd_id), header.expected_data, wd))
    }

    pub(super) fn on_work_done(
        &self,
        source: NodeId,
        token: Token,
        pe: u64,
    ) {
        let Some(remote) = self.remote_work.take(token) else {
            tracing::warn!(%source, %token, "work done for unknown work");
            return;
        };
        for copy in remote.copies.iter().filter(|copy| copy.is_output()) {
            self.directory.record_write(copy.region(), source);
        }
        remote.pe.store(pe, Ordering::SeqCst);
        remote.done.set();
        tracing::debug!(%source, wd = %remote.wd_id, pe, "work done");
    }
}
