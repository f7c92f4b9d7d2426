//! Region coherence glue
//!
//! Connects tasks and transfers to the region directory: tasks bump the
//! versions of what they write, PUT completions record where data now lives,
//! and reconstructed remote tasks wait here until their input bytes arrived.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use super::handle::Token;
use super::message::ActiveMessage;
use super::transport::NodeId;
use super::{Deferred, Network, ReplySlot, TransferError};
use crate::runtime::directory::{RegionKey, Version};
use crate::runtime::scheduler::{CopyData, DimensionTable, TaskHooks, WdId, WorkDescriptor, WorkerId};

/// Task hooks that keep the directory and remote origins up to date.
pub struct CoherenceHooks {
    network: Weak<Network>,
}

impl CoherenceHooks {
    pub fn new(network: Weak<Network>) -> Self {
        Self { network }
    }
}

impl TaskHooks for CoherenceHooks {
    fn on_start(
        &self,
        wd: &Arc<WorkDescriptor>,
    ) {
        let Some(network) = self.network.upgrade() else {
            return;
        };
        for copy in wd.copies() {
            let region = copy.region();
            if copy.is_output() {
                let version = network.directory.record_write(region, network.node);
                tracing::trace!(wd = %wd.id(), %region, version, "region written");
            } else {
                network.directory.get_version_info(region);
            }
        }
    }

    fn on_done(
        &self,
        wd: &Arc<WorkDescriptor>,
        worker: WorkerId,
    ) {
        let Some(origin) = wd.origin() else {
            return;
        };
        let Some(network) = self.network.upgrade() else {
            return;
        };
        network.defer(Deferred::Send(
            origin.node,
            ActiveMessage::WorkDone {
                token: origin.token,
                pe: worker.0 as u64,
            },
        ));
    }
}

/// Input bytes received per task, and tasks still waiting for theirs.
///
/// Task ids are only unique on the node that created them, so entries are
/// keyed by that node and the id it gave the task.
#[derive(Debug, Default)]
pub struct ArrivalTracker {
    arrived: HashMap<ArrivalKey, u64>,
    waiting: HashMap<ArrivalKey, (u64, Arc<WorkDescriptor>)>,
    /// Input still to come for work that was dropped
    discarded: HashMap<ArrivalKey, u64>,
}

/// Node that created a task id, and the id.
pub type ArrivalKey = (NodeId, WdId);

impl ArrivalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `bytes` more input arrived for `key`; returns its task if it is now complete.
    pub fn arrived(
        &mut self,
        key: ArrivalKey,
        bytes: u64,
    ) -> Option<Arc<WorkDescriptor>> {
        if let Some(remaining) = self.discarded.get_mut(&key) {
            *remaining = remaining.saturating_sub(bytes);
            if *remaining == 0 {
                self.discarded.remove(&key);
            }
            return None;
        }
        let total = self.arrived.entry(key).or_insert(0);
        *total += bytes;
        let total = *total;
        match self.waiting.get(&key) {
            Some((expected, _)) if total >= *expected => {
                self.arrived.remove(&key);
                self.waiting.remove(&key).map(|(_, wd)| wd)
            },
            _ => None,
        }
    }

    /// Hold `wd` until `expected` bytes arrived for `key`; returns it if they already did.
    pub fn expect(
        &mut self,
        key: ArrivalKey,
        expected: u64,
        wd: Arc<WorkDescriptor>,
    ) -> Option<Arc<WorkDescriptor>> {
        let arrived = self.arrived.get(&key).copied().unwrap_or(0);
        if arrived >= expected {
            self.arrived.remove(&key);
            return Some(wd);
        }
        self.waiting.insert(key, (expected, wd));
        None
    }

    /// The work behind `key` was dropped: discard what arrived for it and
    /// the rest of its `expected` bytes as they come.
    pub fn discard(
        &mut self,
        key: ArrivalKey,
        expected: u64,
    ) -> u64 {
        let arrived = self.arrived.remove(&key).unwrap_or(0);
        if arrived < expected {
            self.discarded.insert(key, expected - arrived);
        }
        arrived
    }

    /// Tasks still waiting for input.
    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Tasks with input counted but no task built yet.
    pub fn unclaimed(&self) -> usize {
        self.arrived.len()
    }

    /// Dropped work whose input is still on its way.
    pub fn discarding(&self) -> usize {
        self.discarded.len()
    }
}

impl Network {
    /// Input bytes for the master's task `wd_id` landed here.
    pub(crate) fn data_arrived(
        &self,
        wd_id: WdId,
        bytes: u64,
    ) {
        let ready = self.arrivals.lock().arrived((NodeId::MASTER, wd_id), bytes);
        if let Some(wd) = ready {
            tracing::debug!(%wd_id, "input complete");
            self.scheduler.spawn(wd);
        }
    }

    /// Reconstructed tasks held back until their input arrives.
    pub fn tasks_waiting_for_data(&self) -> usize {
        self.arrivals.lock().waiting()
    }

    /// Input counted for tasks that were not built (yet), plus dropped
    /// work whose input is still expected.
    pub fn unclaimed_arrivals(&self) -> usize {
        let arrivals = self.arrivals.lock();
        arrivals.unclaimed() + arrivals.discarding()
    }

    /// Tell `dest` about `copy`'s region, its version and a node holding it.
    pub fn send_region_metadata(
        &self,
        dest: NodeId,
        copy: &CopyData,
        dims: &DimensionTable,
    ) -> Result<(), TransferError> {
        self.check_node(dest)?;
        let info = self.directory.get_version_info(copy.region());
        let holder = info.holders().next().unwrap_or(self.node);
        let seq = self.sequences.next(dest);
        self.send(
            dest,
            ActiveMessage::RegionMetadata {
                seq,
                version: info.version,
                holder,
                copy: *copy,
                dims: dims.clone(),
            },
        )?;
        Ok(())
    }

    /// Learn every region `node` holds at its latest version.
    ///
    /// `node` answers once none of its reconstructed tasks is still live.
    pub fn synchronize_directory(
        &self,
        node: NodeId,
    ) -> Result<(), TransferError> {
        self.check_node(node)?;
        let slot = Arc::new(ReplySlot::default());
        let token = self.replies.register(slot.clone());
        let sent = self.send(
            node,
            ActiveMessage::SynchronizeDirectory {
                token,
                regions: None,
            },
        );
        if let Err(err) = sent {
            self.replies.take(token);
            return Err(err.into());
        }
        self.wait(&slot.cond);
        Ok(())
    }

    pub(super) fn answer_directory_sync(
        &self,
        node: NodeId,
        token: Token,
    ) {
        if !self.remote_work_idle() {
            self.defer(Deferred::SyncDirectory { node, token });
            return;
        }
        let regions: Vec<(RegionKey, Version)> = self
            .directory
            .snapshot()
            .into_iter()
            .filter(|(_, info)| info.holders().any(|holder| holder == self.node))
            .map(|(key, info)| (key, info.version))
            .collect();
        let count = regions.len();
        let reply = ActiveMessage::SynchronizeDirectory {
            token,
            regions: Some(regions),
        };
        if self.send(node, reply).is_ok() {
            tracing::debug!(to = %node, regions = count, "directory synchronized");
        }
    }

    pub(super) fn on_directory_reply(
        &self,
        source: NodeId,
        token: Token,
        regions: Vec<(RegionKey, Version)>,
    ) {
        for (region, version) in regions {
            self.directory.record_location(region, source, version);
        }
        match self.replies.take(token) {
            Some(slot) => slot.cond.set(),
            None => tracing::warn!(%source, %token, "directory reply for unknown request"),
        }
    }
}
