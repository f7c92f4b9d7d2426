//! Transfer engine
//!
//! Moves bytes between the memories of two nodes. Every operation returns as
//! soon as its messages are queued on the transport; completion shows up
//! later through a handler.
//!
//! A PUT is driven by the master: it reserves a temporary buffer inside the
//! destination's registered segment, streams the data into it in chunks and
//! the destination copies each chunk to its final address. When the last
//! chunk is in, the destination hands the buffer back to the master, which
//! frees it and only then runs the transfer's completion functor.
//!
//! A GET is a small request; the serving node streams the data back and the
//! last reply chunk carries the requester's completion token.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::handle::{HandleRegistry, Token};
use super::message::{ActiveMessage, GetRequest, PutChunk, RelayRequest, ReplyChunk, Stride};
use super::transport::{NodeId, TransportError};
use super::{Deferred, Network, ReplySlot};
use crate::runtime::directory::{RegionKey, Version};
use crate::runtime::memory::{MemoryError, PinnedError};
use crate::runtime::scheduler::{
    CopyData, CopyFlags, DimensionTable, RegionDimension, SingleSyncCond, SyncCondition, WdId,
};

/// Completion callback of a PUT, run on the master once its buffer is free.
pub type Functor = Box<dyn FnOnce() + Send>;

/// Errors raised when issuing a transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("zero-byte transfer")]
    Empty,
    #[error("only the master node can drive this operation")]
    NotMaster,
    #[error("{0} is not part of the job")]
    UnknownNode(NodeId),
    #[error(transparent)]
    Pinned(#[from] PinnedError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Description of one transfer between this node and `remote`.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub remote: NodeId,
    /// Address on `remote`
    pub remote_addr: u64,
    /// Address on the node that issues the transfer
    pub local_addr: u64,
    /// Length in bytes, or bytes per row when strided
    pub len: u64,
    pub stride: Option<Stride>,
    /// Task the data belongs to
    pub owner: WdId,
    pub copy: CopyData,
    pub dims: DimensionTable,
}

impl Transfer {
    /// A contiguous transfer whose region is named by its local address.
    pub fn new(
        remote: NodeId,
        remote_addr: u64,
        local_addr: u64,
        len: u64,
    ) -> Self {
        let mut dims = DimensionTable::new();
        let range = dims.push(&[RegionDimension::whole(len)]);
        Self {
            remote,
            remote_addr,
            local_addr,
            len,
            stride: None,
            owner: WdId(0),
            copy: CopyData {
                address: local_addr,
                flags: CopyFlags::INOUT,
                dims: range,
                host_base_address: local_addr,
                host_region_id: 0,
            },
            dims,
        }
    }

    /// Move `count` rows of `len` bytes spaced `ld` bytes apart on both sides.
    pub fn strided(
        mut self,
        count: u64,
        ld: u64,
    ) -> Self {
        self.stride = Some(Stride {
            size: self.len,
            count,
            ld,
        });
        self
    }

    pub fn owner(
        mut self,
        owner: WdId,
    ) -> Self {
        self.owner = owner;
        self
    }

    /// Attach the copy descriptor the data belongs to.
    pub fn copy(
        mut self,
        copy: CopyData,
        dims: DimensionTable,
    ) -> Self {
        self.copy = copy;
        self.dims = dims;
        self
    }

    #[inline]
    pub fn region(&self) -> RegionKey {
        self.copy.region()
    }

    /// Bytes on the wire.
    #[inline]
    pub fn wire_len(&self) -> u64 {
        self.stride.map_or(self.len, |s| s.packed_len())
    }
}

/// A GET waiting for its last reply chunk.
struct PendingGet {
    cond: Arc<SingleSyncCond>,
    local_addr: u64,
    stride: Option<Stride>,
    /// Pack buffer a strided reply lands in
    pack: Option<u64>,
    region: RegionKey,
}

/// Outgoing PUT after the temporary buffer was reserved.
struct OutgoingPut {
    dest: NodeId,
    dest_addr: u64,
    tmp: u64,
    stride: Option<Stride>,
    owner: WdId,
    functor: Option<Token>,
    region: RegionKey,
    version: Version,
    relay: bool,
}

/// Transfer bookkeeping of one node.
#[derive(Default)]
pub(crate) struct TransferState {
    functors: HandleRegistry<Functor>,
    gets: HandleRegistry<PendingGet>,
    /// Relays announced into an address minus relays landed there
    relays: Mutex<HashMap<u64, i64>>,
    /// GETs held back by a relay into the address they read
    blocked_gets: Mutex<HashMap<u64, Vec<(NodeId, GetRequest)>>>,
}

impl TransferState {
    /// Completion functors not yet run.
    pub(crate) fn pending_functors(&self) -> usize {
        self.functors.len()
    }

    /// GETs not yet answered.
    pub(crate) fn pending_gets(&self) -> usize {
        self.gets.len()
    }
}

impl Network {
    /// Wait for a transfer or reply condition, polling in the meantime.
    pub fn wait(
        &self,
        cond: &dyn SyncCondition,
    ) {
        self.scheduler.wait_on_condition(cond);
    }

    /// Completion functors still waiting for their buffer to come back.
    pub fn pending_functors(&self) -> usize {
        self.transfers.pending_functors()
    }

    /// GETs still waiting for their data.
    pub fn pending_gets(&self) -> usize {
        self.transfers.pending_gets()
    }

    /// Push `transfer.local_addr` to `transfer.remote_addr` on `transfer.remote`.
    ///
    /// Master only. Blocks, polling, until a temporary buffer is free in the
    /// destination segment; `functor` runs once that buffer is released.
    pub fn put(
        &self,
        transfer: Transfer,
        functor: Option<Functor>,
    ) -> Result<(), TransferError> {
        if !self.is_master() {
            return Err(TransferError::NotMaster);
        }
        self.check_node(transfer.remote)?;
        let len = transfer.wire_len();
        if len == 0 {
            return Err(TransferError::Empty);
        }

        let data = self.gather(transfer.local_addr, transfer.len, transfer.stride)?;
        let tmp = self
            .pinned
            .allocate_blocking(transfer.remote.index(), len as usize, || self.poll())?;
        let region = transfer.region();
        let version = self.directory.get_version_info(region).version;
        let functor = functor.map(|f| self.transfers.functors.register(f));

        let sent = self.send_put(
            OutgoingPut {
                dest: transfer.remote,
                dest_addr: transfer.remote_addr,
                tmp,
                stride: transfer.stride,
                owner: transfer.owner,
                functor,
                region,
                version,
                relay: false,
            },
            data,
        );
        if let Err(err) = sent {
            self.abandon_put(transfer.remote, tmp, functor);
            return Err(err);
        }
        Ok(())
    }

    /// `put` of `count` rows of `transfer.len` bytes, `ld` bytes apart.
    pub fn put_strided_1d(
        &self,
        transfer: Transfer,
        count: u64,
        ld: u64,
        functor: Option<Functor>,
    ) -> Result<(), TransferError> {
        self.put(transfer.strided(count, ld), functor)
    }

    /// Pull `transfer.remote_addr` on `transfer.remote` into `transfer.local_addr`.
    ///
    /// The returned condition is set once every byte arrived.
    pub fn get(
        &self,
        transfer: Transfer,
    ) -> Result<Arc<SingleSyncCond>, TransferError> {
        self.check_node(transfer.remote)?;
        let len = transfer.wire_len();
        if len == 0 {
            return Err(TransferError::Empty);
        }

        let pack = match transfer.stride {
            Some(_) => Some(self.pinned.pack_allocate_blocking(len as usize, || self.poll())?),
            None => None,
        };
        let cond = Arc::new(SingleSyncCond::new());
        let completion = self.transfers.gets.register(PendingGet {
            cond: cond.clone(),
            local_addr: transfer.local_addr,
            stride: transfer.stride,
            pack,
            region: transfer.region(),
        });

        let seq = self.sequences.next(transfer.remote);
        let request = GetRequest {
            seq,
            origin_addr: pack.unwrap_or(transfer.local_addr),
            remote_addr: transfer.remote_addr,
            len: transfer.len,
            stride: transfer.stride,
            completion,
            copy: transfer.copy,
            dims: transfer.dims,
        };
        if let Err(err) = self.send(transfer.remote, ActiveMessage::Get(request)) {
            self.transfers.gets.take(completion);
            if let Some(pack) = pack {
                if let Err(err) = self.pinned.pack_free(pack) {
                    tracing::warn!("pack buffer {:#x}: {}", pack, err);
                }
            }
            return Err(err.into());
        }
        Ok(cond)
    }

    /// `get` of `count` rows of `transfer.len` bytes, `ld` bytes apart.
    pub fn get_strided_1d(
        &self,
        transfer: Transfer,
        count: u64,
        ld: u64,
    ) -> Result<Arc<SingleSyncCond>, TransferError> {
        self.get(transfer.strided(count, ld))
    }

    /// Have `source` push its `transfer.local_addr` to `transfer.remote`.
    ///
    /// Master only. The master reserves the temporary buffer and announces
    /// the relay to the destination before asking the source to send.
    pub fn request_put(
        &self,
        source: NodeId,
        transfer: Transfer,
        functor: Option<Functor>,
    ) -> Result<(), TransferError> {
        if !self.is_master() {
            return Err(TransferError::NotMaster);
        }
        self.check_node(source)?;
        self.check_node(transfer.remote)?;
        if source == self.node {
            return self.put(transfer, functor);
        }
        let len = transfer.wire_len();
        if len == 0 {
            return Err(TransferError::Empty);
        }

        let dest = transfer.remote;
        let tmp = self
            .pinned
            .allocate_blocking(dest.index(), len as usize, || self.poll())?;
        let region = transfer.region();
        let version = self.directory.get_version_info(region).version;
        let functor = functor.map(|f| self.transfers.functors.register(f));

        let seq = self.sequences.next(dest);
        let announced = self.send(
            dest,
            ActiveMessage::WaitRequestPut {
                addr: transfer.remote_addr,
                wd_id: transfer.owner,
                seq,
            },
        );
        // A relay that was never requested will not give the buffer back
        let requested = announced.and_then(|()| {
            self.send(
                source,
                ActiveMessage::RequestPut(RelayRequest {
                    origin_addr: transfer.local_addr,
                    dest,
                    dest_addr: transfer.remote_addr,
                    tmp_addr: tmp,
                    len: transfer.len,
                    stride: transfer.stride,
                    wd_id: transfer.owner,
                    functor,
                    region,
                    version,
                }),
            )
        });
        if let Err(err) = requested {
            self.abandon_put(dest, tmp, functor);
            return Err(err.into());
        }
        Ok(())
    }

    /// Strided variant of `request_put`.
    pub fn request_put_strided_1d(
        &self,
        source: NodeId,
        transfer: Transfer,
        count: u64,
        ld: u64,
        functor: Option<Functor>,
    ) -> Result<(), TransferError> {
        self.request_put(source, transfer.strided(count, ld), functor)
    }

    /// Allocate `size` bytes on `node`'s heap.
    pub fn malloc(
        &self,
        node: NodeId,
        size: usize,
    ) -> Result<u64, TransferError> {
        self.check_node(node)?;
        if size == 0 {
            return Err(TransferError::Empty);
        }
        let slot = Arc::new(ReplySlot::default());
        let waiter = self.replies.register(slot.clone());
        let sent = self.send(
            node,
            ActiveMessage::Malloc {
                size: size as u64,
                waiter,
            },
        );
        if let Err(err) = sent {
            self.replies.take(waiter);
            return Err(err.into());
        }
        self.wait(&slot.cond);
        Ok(slot.value.load(Ordering::SeqCst))
    }

    /// Release memory obtained with `malloc`.
    pub fn free(
        &self,
        node: NodeId,
        addr: u64,
    ) -> Result<(), TransferError> {
        self.check_node(node)?;
        self.send(node, ActiveMessage::Free { addr })?;
        Ok(())
    }

    /// Move an allocation on `node` to a new one of `new_size` bytes.
    pub fn realloc(
        &self,
        node: NodeId,
        old_addr: u64,
        old_size: usize,
        new_size: usize,
    ) -> Result<u64, TransferError> {
        let new_addr = self.malloc(node, new_size)?;
        self.send(
            node,
            ActiveMessage::Realloc {
                old_addr,
                old_size: old_size as u64,
                new_addr,
                new_size: new_size as u64,
            },
        )?;
        Ok(new_addr)
    }

    /// Fill `len` bytes at `addr` on `node` with a repeated word.
    pub fn put_fill(
        &self,
        node: NodeId,
        addr: u64,
        len: usize,
        word_size: usize,
        value: u64,
    ) -> Result<(), TransferError> {
        self.check_node(node)?;
        if !matches!(word_size, 1 | 2 | 4 | 8) {
            return Err(MemoryError::BadWordSize(word_size).into());
        }
        self.send(
            node,
            ActiveMessage::PutFill {
                addr,
                len: len as u64,
                word_size: word_size as u64,
                value,
            },
        )?;
        Ok(())
    }

    /// Read data to send. Strided rows are packed through a pack buffer
    /// since the transport sends from registered memory.
    fn gather(
        &self,
        addr: u64,
        len: u64,
        stride: Option<Stride>,
    ) -> Result<Bytes, TransferError> {
        let Some(stride) = stride else {
            return Ok(Bytes::from(self.memory.read(addr, len as usize)?));
        };
        let packed = self.memory.read_strided(
            addr,
            stride.size as usize,
            stride.count as usize,
            stride.ld as usize,
        )?;
        let pack = self
            .pinned
            .pack_allocate_blocking(packed.len(), || self.poll())?;
        let staged = self
            .memory
            .write(pack, &packed)
            .and_then(|()| self.memory.read(pack, packed.len()));
        self.pinned.pack_free(pack)?;
        Ok(Bytes::from(staged?))
    }

    fn send_put(
        &self,
        put: OutgoingPut,
        data: Bytes,
    ) -> Result<(), TransferError> {
        let chunk_len = self.limits.max_long_request.max(1);
        let total = data.len();
        let seq = self.sequences.next(put.dest);

        let mut offset = 0;
        while offset < total {
            let end = (offset + chunk_len).min(total);
            let chunk = PutChunk {
                seq,
                dest_addr: put.dest_addr,
                offset: offset as u64,
                total_len: total as u64,
                last: end == total,
                relay: put.relay,
                wd_id: put.owner,
                functor: put.functor,
                region: put.region,
                version: put.version,
                stride: put.stride,
                data: data.slice(offset..end),
                landing: put.tmp + offset as u64,
            };
            self.send(put.dest, ActiveMessage::Put(chunk))?;
            offset = end;
        }
        tracing::trace!(dest = %put.dest, seq, len = total, tmp = format_args!("{:#x}", put.tmp), "put sent");
        Ok(())
    }

    /// A PUT chunk landed in its temporary buffer.
    pub(super) fn on_put_chunk(
        &self,
        source: NodeId,
        chunk: PutChunk,
    ) -> Option<PutChunk> {
        if chunk.stride.is_none() {
            let dest = chunk.dest_addr + chunk.offset;
            if let Err(err) = self.memory.copy(chunk.landing, dest, chunk.data.len()) {
                tracing::error!(%source, seq = chunk.seq, "put chunk dropped: {}", err);
            }
        }
        if !chunk.last {
            return None;
        }

        if let Some(stride) = chunk.stride {
            let unpacked = self
                .memory
                .read(chunk.tmp_base(), stride.packed_len() as usize)
                .and_then(|packed| {
                    self.memory.write_strided(
                        chunk.dest_addr,
                        &packed,
                        stride.size as usize,
                        stride.count as usize,
                        stride.ld as usize,
                    )
                });
            if let Err(err) = unpacked {
                tracing::error!(%source, seq = chunk.seq, "strided put dropped: {}", err);
            }
        }
        self.defer(Deferred::Send(
            NodeId::MASTER,
            ActiveMessage::FreeTmpBuffer {
                addr: chunk.tmp_base(),
                wd_id: chunk.wd_id,
                functor: chunk.functor,
                region: chunk.region,
                version: chunk.version,
            },
        ));
        Some(chunk)
    }

    /// Bookkeeping of a complete PUT, applied in sequence order.
    pub(super) fn complete_put(
        &self,
        chunk: PutChunk,
    ) {
        self.directory
            .record_location(chunk.region, self.node, chunk.version);
        if chunk.wd_id != WdId(0) {
            self.data_arrived(chunk.wd_id, chunk.total_len);
        }
        if chunk.relay {
            self.relay_landed(chunk.dest_addr);
        }
    }

    /// The master announced a relay into `addr`.
    pub(super) fn expect_relay(
        &self,
        addr: u64,
    ) {
        let mut relays = self.transfers.relays.lock();
        let pending = relays.entry(addr).or_insert(0);
        *pending += 1;
        if *pending == 0 {
            relays.remove(&addr);
        }
    }

    fn relay_landed(
        &self,
        addr: u64,
    ) {
        let released = {
            let mut relays = self.transfers.relays.lock();
            let pending = relays.entry(addr).or_insert(0);
            *pending -= 1;
            if *pending != 0 {
                return;
            }
            relays.remove(&addr);
            self.transfers.blocked_gets.lock().remove(&addr)
        };
        for (source, request) in released.into_iter().flatten() {
            self.defer(Deferred::ServeGet(source, request));
        }
    }

    /// A GET request released by the sequence gate.
    pub(super) fn on_get(
        &self,
        source: NodeId,
        request: GetRequest,
    ) {
        let relays = self.transfers.relays.lock();
        if relays.get(&request.remote_addr).is_some_and(|&n| n > 0) {
            tracing::debug!(%source, addr = format_args!("{:#x}", request.remote_addr), "get waits for relay");
            self.transfers
                .blocked_gets
                .lock()
                .entry(request.remote_addr)
                .or_default()
                .push((source, request));
            return;
        }
        drop(relays);
        self.defer(Deferred::ServeGet(source, request));
    }

    pub(super) fn serve_get(
        &self,
        source: NodeId,
        request: GetRequest,
    ) {
        let version = self
            .directory
            .get_version_info(request.copy.region())
            .version;
        let data = match self.gather(request.remote_addr, request.len, request.stride) {
            Ok(data) => data,
            Err(err) => {
                tracing::error!(%source, seq = request.seq, "get failed: {}", err);
                return;
            },
        };

        let chunk_len = self.limits.max_long_reply.max(1);
        let total = data.len();
        let mut offset = 0;
        while offset < total {
            let end = (offset + chunk_len).min(total);
            let reply = ReplyChunk {
                completion: request.completion,
                offset: offset as u64,
                total_len: total as u64,
                last: end == total,
                version,
                strided: request.stride.is_some(),
                data: data.slice(offset..end),
                landing: request.origin_addr + offset as u64,
            };
            if self.send(source, ActiveMessage::GetReply(reply)).is_err() {
                return;
            }
            offset = end;
        }
    }

    pub(super) fn on_get_reply(
        &self,
        source: NodeId,
        chunk: ReplyChunk,
    ) {
        if !chunk.last {
            return;
        }
        let Some(pending) = self.transfers.gets.take(chunk.completion) else {
            tracing::warn!(%source, token = %chunk.completion, "reply for unknown get");
            return;
        };

        if let (Some(stride), Some(pack)) = (pending.stride, pending.pack) {
            let unpacked = self
                .memory
                .read(pack, stride.packed_len() as usize)
                .and_then(|packed| {
                    self.memory.write_strided(
                        pending.local_addr,
                        &packed,
                        stride.size as usize,
                        stride.count as usize,
                        stride.ld as usize,
                    )
                });
            if let Err(err) = unpacked {
                tracing::error!(%source, "strided reply dropped: {}", err);
            }
            if let Err(err) = self.pinned.pack_free(pack) {
                tracing::warn!("pack buffer {:#x}: {}", pack, err);
            }
        }

        self.directory
            .record_location(pending.region, self.node, chunk.version);
        self.directory
            .record_location(pending.region, source, chunk.version);
        pending.cond.set();
    }

    /// Perform a relay the master asked for.
    pub(super) fn relay_put(
        &self,
        request: RelayRequest,
    ) {
        let data = match self.gather(request.origin_addr, request.len, request.stride) {
            Ok(data) => data,
            Err(err) => {
                tracing::error!(dest = %request.dest, "relay failed: {}", err);
                return;
            },
        };
        let _ = self.send_put(
            OutgoingPut {
                dest: request.dest,
                dest_addr: request.dest_addr,
                tmp: request.tmp_addr,
                stride: request.stride,
                owner: request.wd_id,
                functor: request.functor,
                region: request.region,
                version: request.version,
                relay: true,
            },
            data,
        );
    }

    /// A PUT that never fully left: take its buffer and functor back.
    fn abandon_put(
        &self,
        dest: NodeId,
        tmp: u64,
        functor: Option<Token>,
    ) {
        if let Err(err) = self.pinned.free(dest.index(), tmp) {
            tracing::warn!(%dest, "temporary buffer {:#x}: {}", tmp, err);
        }
        if let Some(token) = functor {
            self.transfers.functors.take(token);
        }
        tracing::debug!(%dest, tmp = format_args!("{tmp:#x}"), "put abandoned");
    }

    /// Master side: give a temporary buffer back, then run its functor.
    pub(super) fn release_tmp_buffer(
        &self,
        node: NodeId,
        addr: u64,
        functor: Option<Token>,
    ) {
        match self.pinned.free(node.index(), addr) {
            Ok(len) => tracing::trace!(%node, addr = format_args!("{addr:#x}"), len, "temporary buffer released"),
            Err(err) => tracing::warn!(%node, "temporary buffer {:#x}: {}", addr, err),
        }
        let Some(token) = functor else {
            return;
        };
        match self.transfers.functors.take(token) {
            Some(functor) => functor(),
            None => tracing::warn!(%token, "completion functor already ran"),
        }
    }

    pub(super) fn on_malloc(
        &self,
        source: NodeId,
        size: u64,
        waiter: Token,
    ) {
        let addr = self.memory.allocate(size as usize);
        tracing::trace!(%source, size, addr = format_args!("{addr:#x}"), "malloc");
        self.defer(Deferred::Send(source, ActiveMessage::MallocReply { addr, waiter }));
    }

    pub(super) fn on_realloc(
        &self,
        old_addr: u64,
        old_size: u64,
        new_addr: u64,
        new_size: u64,
    ) {
        let moved = self
            .memory
            .copy(old_addr, new_addr, old_size.min(new_size) as usize)
            .and_then(|()| self.memory.release(old_addr));
        if let Err(err) = moved {
            tracing::error!("realloc {:#x} -> {:#x}: {}", old_addr, new_addr, err);
        }
    }
}
