//! Active message handlers
//!
//! Handlers run inside `Network::poll` with the message layer held. They
//! only touch local state; replies and anything else that sends go to the
//! deferred queue.

use std::sync::atomic::Ordering;

use super::message::{ActiveMessage, GetRequest, PutChunk, WorkHeader};
use super::transport::NodeId;
use super::{Deferred, Network};
use crate::runtime::directory::{RegionKey, Version};
use crate::runtime::scheduler::WdId;

/// Events that must be applied in the sender's sequence order.
#[derive(Debug)]
pub(crate) enum Sequenced {
    PutDone(PutChunk),
    Get(GetRequest),
    WaitRequestPut {
        addr: u64,
        wd_id: WdId,
    },
    Work(WorkHeader),
    RegionMetadata {
        region: RegionKey,
        version: Version,
        holder: NodeId,
    },
}

impl Network {
    pub(super) fn handle(
        &self,
        source: NodeId,
        message: ActiveMessage,
    ) {
        match message {
            ActiveMessage::Finalize => self.defer(Deferred::Finalize(source)),
            ActiveMessage::FinalizeReply => {
                let slot = self.finalize.lock().clone();
                match slot {
                    Some(slot) => {
                        let replies = slot.value.fetch_add(1, Ordering::SeqCst) + 1;
                        if replies as usize + 1 >= self.num_nodes {
                            slot.cond.set();
                        }
                    },
                    None => tracing::warn!(%source, "finalize reply without finalize"),
                }
            },
            ActiveMessage::Work(header) => self.admit(source, header.seq, Sequenced::Work(header)),
            ActiveMessage::WorkDone { token, pe } => self.on_work_done(source, token, pe),
            ActiveMessage::Malloc { size, waiter } => self.on_malloc(source, size, waiter),
            ActiveMessage::MallocReply { addr, waiter } => match self.replies.take(waiter) {
                Some(slot) => {
                    slot.value.store(addr, Ordering::SeqCst);
                    slot.cond.set();
                },
                None => tracing::warn!(%source, token = %waiter, "malloc reply for unknown waiter"),
            },
            ActiveMessage::MasterHostname(name) => {
                tracing::debug!(node = %self.node, master = %name, "master hostname");
                *self.master_hostname.write() = Some(name);
            },
            ActiveMessage::Put(chunk) => {
                if let Some(done) = self.on_put_chunk(source, chunk) {
                    self.admit(source, done.seq, Sequenced::PutDone(done));
                }
            },
            ActiveMessage::Get(request) => self.admit(source, request.seq, Sequenced::Get(request)),
            ActiveMessage::GetReply(chunk) => self.on_get_reply(source, chunk),
            ActiveMessage::PutFill {
                addr,
                len,
                word_size,
                value,
            } => {
                if let Err(err) = self
                    .memory
                    .fill(addr, len as usize, word_size as usize, value)
                {
                    tracing::error!(%source, "put fill at {:#x}: {}", addr, err);
                }
            },
            ActiveMessage::RequestPut(request) => self.defer(Deferred::Relay(request)),
            ActiveMessage::WorkData {
                wd_id,
                index,
                total_len,
                data,
            } => self
                .work_buffers
                .store(source, wd_id, index, total_len, &data),
            ActiveMessage::Free { addr } => {
                if let Err(err) = self.memory.release(addr) {
                    tracing::warn!(%source, "free: {}", err);
                }
            },
            ActiveMessage::Realloc {
                old_addr,
                old_size,
                new_addr,
                new_size,
            } => self.on_realloc(old_addr, old_size, new_addr, new_size),
            ActiveMessage::WaitRequestPut { addr, wd_id, seq } => {
                self.admit(source, seq, Sequenced::WaitRequestPut { addr, wd_id })
            },
            ActiveMessage::FreeTmpBuffer {
                addr,
                wd_id,
                functor,
                region,
                version,
            } => {
                tracing::trace!(%source, %wd_id, %region, version, "temporary buffer returned");
                // the PUT is complete: the destination now holds the region
                self.directory.record_location(region, source, version);
                self.defer(Deferred::FreeTmpBuffer {
                    node: source,
                    addr,
                    functor,
                });
            },
            ActiveMessage::RegionMetadata {
                seq,
                version,
                holder,
                copy,
                ..
            } => self.admit(
                source,
                seq,
                Sequenced::RegionMetadata {
                    region: copy.region(),
                    version,
                    holder,
                },
            ),
            ActiveMessage::SynchronizeDirectory { token, regions } => match regions {
                None => self.defer(Deferred::SyncDirectory {
                    node: source,
                    token,
                }),
                Some(regions) => self.on_directory_reply(source, token, regions),
            },
        }
    }

    /// Pass `event` through the sequence gate and apply whatever it releases.
    fn admit(
        &self,
        source: NodeId,
        seq: u64,
        event: Sequenced,
    ) {
        for event in self.gate.admit(source, seq, event) {
            match event {
                Sequenced::PutDone(chunk) => self.complete_put(chunk),
                Sequenced::Get(request) => self.on_get(source, request),
                Sequenced::WaitRequestPut { addr, wd_id } => {
                    tracing::trace!(%source, %wd_id, addr = format_args!("{addr:#x}"), "relay announced");
                    self.expect_relay(addr);
                },
                Sequenced::Work(header) => self.on_work(source, header),
                Sequenced::RegionMetadata {
                    region,
                    version,
                    holder,
                } => self.directory.record_location(region, holder, version),
            }
        }
    }
}
