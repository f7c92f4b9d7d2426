//! Data dependencies between tasks
//!
//! Tasks are ordered by the regions their copies touch. A reader waits for
//! the last writer of the region (read after write); a writer waits for the
//! last writer and every reader since (write after write, write after read).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::task::{WdId, WorkDescriptor};
use crate::runtime::directory::RegionKey;

#[derive(Debug, Default)]
pub struct DependencyTracker {
    last_writer: HashMap<RegionKey, WdId>,
    readers: HashMap<RegionKey, Vec<WdId>>,
    /// Tasks waiting for each unfinished task
    successors: HashMap<WdId, Vec<Arc<WorkDescriptor>>>,
    /// Regions each unfinished task was recorded under
    touched: HashMap<WdId, Vec<RegionKey>>,
    live: HashSet<WdId>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `wd`'s accesses and return how many unfinished tasks it waits for.
    ///
    /// The count is also stored in the task, so that `release` can tell when
    /// it becomes ready.
    pub fn register(
        &mut self,
        wd: &Arc<WorkDescriptor>,
    ) -> usize {
        let id = wd.id();
        let mut preds: Vec<WdId> = Vec::new();
        let mut regions = Vec::with_capacity(wd.copies().len());

        for copy in wd.copies() {
            let key = copy.region();
            if let Some(&writer) = self.last_writer.get(&key) {
                preds.push(writer);
            }
            if copy.is_output() {
                if let Some(readers) = self.readers.remove(&key) {
                    preds.extend(readers);
                }
                self.last_writer.insert(key, id);
            } else if copy.is_input() {
                self.readers.entry(key).or_default().push(id);
            }
            regions.push(key);
        }

        preds.sort_unstable();
        preds.dedup();
        preds.retain(|p| *p != id && self.live.contains(p));

        wd.set_pending_preds(preds.len());
        for pred in &preds {
            self.successors.entry(*pred).or_default().push(wd.clone());
        }
        self.touched.insert(id, regions);
        self.live.insert(id);
        preds.len()
    }

    /// `id` finished. Returns the tasks that have no predecessor left.
    pub fn release(
        &mut self,
        id: WdId,
    ) -> Vec<Arc<WorkDescriptor>> {
        if !self.live.remove(&id) {
            return Vec::new();
        }
        for key in self.touched.remove(&id).unwrap_or_default() {
            if self.last_writer.get(&key) == Some(&id) {
                self.last_writer.remove(&key);
            }
            if let Some(readers) = self.readers.get_mut(&key) {
                readers.retain(|r| *r != id);
                if readers.is_empty() {
                    self.readers.remove(&key);
                }
            }
        }
        self.successors
            .remove(&id)
            .unwrap_or_default()
            .into_iter()
            .filter(|succ| succ.pred_done())
            .collect()
    }

    /// Unfinished tasks known to the tracker.
    #[inline]
    pub fn live(&self) -> usize {
        self.live.len()
    }
}
