//! Region directory
//!
//! Tracks, for every region a task has touched, the latest version number and
//! which nodes hold which version. A region is identified by the host base
//! address of the data plus a region id, so that the same region can be named
//! consistently from every node.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use parking_lot::RwLock;

use crate::network::NodeId;

/// Version number of a region. `UNVERSIONED` until first touched.
pub type Version = u64;

/// Version of a region nobody has written yet.
pub const UNVERSIONED: Version = 0;

/// Identity of a region across nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionKey {
    /// Host base address of the data
    pub host_object: u64,
    /// Region id within the host object
    pub region_id: u64,
}

impl RegionKey {
    #[inline]
    pub fn new(
        host_object: u64,
        region_id: u64,
    ) -> Self {
        Self {
            host_object,
            region_id,
        }
    }
}

impl fmt::Display for RegionKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Region({:#x}:{})", self.host_object, self.region_id)
    }
}

/// A (node, version) record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub node: NodeId,
    pub version: Version,
}

/// Snapshot of a directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: Version,
    pub locations: Vec<Location>,
}

impl VersionInfo {
    /// Nodes holding the latest version.
    pub fn holders(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.locations
            .iter()
            .filter(move |loc| loc.version == self.version)
            .map(|loc| loc.node)
    }
}

#[derive(Debug)]
struct Entry {
    version: Version,
    locations: BTreeMap<NodeId, Version>,
}

impl Entry {
    fn new(home: NodeId) -> Self {
        let mut locations = BTreeMap::new();
        locations.insert(home, UNVERSIONED);
        Self {
            version: UNVERSIONED,
            locations,
        }
    }

    fn info(&self) -> VersionInfo {
        VersionInfo {
            version: self.version,
            locations: self
                .locations
                .iter()
                .map(|(&node, &version)| Location { node, version })
                .collect(),
        }
    }
}

/// Per-node view of region versions.
///
/// Entries are created on first touch with the master as the only holder
/// and live as long as the directory.
#[derive(Debug, Default)]
pub struct RegionDirectory {
    entries: RwLock<HashMap<RegionKey, Entry>>,
}

impl RegionDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Version and holders of `key`, creating the entry if needed.
    pub fn get_version_info(
        &self,
        key: RegionKey,
    ) -> VersionInfo {
        if let Some(entry) = self.entries.read().get(&key) {
            return entry.info();
        }
        self.entries
            .write()
            .entry(key)
            .or_insert_with(|| Entry::new(NodeId::MASTER))
            .info()
    }

    /// Current version of `key`, if the region was ever touched.
    pub fn version(
        &self,
        key: RegionKey,
    ) -> Option<Version> {
        self.entries.read().get(&key).map(|entry| entry.version)
    }

    /// Advance the version of `key` and return the new value.
    ///
    /// The caller records the writer with `record_location` so that the new
    /// version always has a holder.
    pub fn bump_version(
        &self,
        key: RegionKey,
    ) -> Version {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(key)
            .or_insert_with(|| Entry::new(NodeId::MASTER));
        entry.version += 1;
        entry.version
    }

    /// Record that `node` holds `version` of `key`.
    ///
    /// Learning about a version newer than the current one advances the entry.
    pub fn record_location(
        &self,
        key: RegionKey,
        node: NodeId,
        version: Version,
    ) {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(key)
            .or_insert_with(|| Entry::new(NodeId::MASTER));
        if version > entry.version {
            entry.version = version;
        }
        let held = entry.locations.entry(node).or_insert(version);
        if version > *held {
            *held = version;
        }
    }

    /// Bump the version and make `node` its holder in one step.
    pub fn record_write(
        &self,
        key: RegionKey,
        node: NodeId,
    ) -> Version {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(key)
            .or_insert_with(|| Entry::new(NodeId::MASTER));
        entry.version += 1;
        entry.locations.insert(node, entry.version);
        entry.version
    }

    /// Nodes holding the latest version of `key`.
    pub fn holders(
        &self,
        key: RegionKey,
    ) -> Vec<NodeId> {
        self.entries
            .read()
            .get(&key)
            .map(|entry| entry.info().holders().collect())
            .unwrap_or_default()
    }

    /// Every entry, ordered by key.
    pub fn snapshot(&self) -> Vec<(RegionKey, VersionInfo)> {
        let entries = self.entries.read();
        let mut all: Vec<_> = entries.iter().map(|(k, e)| (*k, e.info())).collect();
        all.sort_by_key(|(k, _)| *k);
        all
    }

    /// Number of regions known.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
