use serde::{Deserialize, Serialize};

use crate::error::Errno;
use crate::topology::types::SubvolId;

/// Size of the hash space.
pub const HASH_SPACE: u64 = 1 << 32;

/// Inclusive range `[start, stop]` of hash values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HashRange {
    pub start: u32,
    pub stop: u32,
}

impl HashRange {
    pub fn new(start: u32, stop: u32) -> Self {
        Self { start, stop }
    }

    pub fn full() -> Self {
        Self {
            start: 0,
            stop: u32::MAX,
        }
    }

    pub fn contains(&self, hash: u32) -> bool {
        self.start <= hash && hash <= self.stop
    }

    /// Number of hash values covered.
    pub fn width(&self) -> u64 {
        (self.stop as u64) - (self.start as u64) + 1
    }

    pub fn overlap(&self, other: &HashRange) -> u64 {
        let start = self.start.max(other.start) as u64;
        let stop = self.stop.min(other.stop) as u64;
        if start > stop { 0 } else { stop - start + 1 }
    }
}

/// What the layout knows about one subvolume's slice.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryStatus {
    Ok,
    /// The directory exists on the node but carries no layout xattr.
    MissingMetadata,
    /// The layout xattr exists but could not be decoded.
    Corrupt,
    /// Looking the directory up on the node failed.
    LookupFailed(Errno),
}

impl EntryStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, EntryStatus::Ok)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LayoutEntry {
    pub subvol: SubvolId,
    /// `None` is a zero-width assignment: the node owns no hash values.
    pub range: Option<HashRange>,
    pub status: EntryStatus,
}

impl LayoutEntry {
    pub fn ok(subvol: SubvolId, range: Option<HashRange>) -> Self {
        Self {
            subvol,
            range,
            status: EntryStatus::Ok,
        }
    }
}

/// Per-class anomaly counts for a layout.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Anomalies {
    pub holes: u32,
    pub overlaps: u32,
    pub missing: u32,
    pub down: u32,
    pub misc: u32,
}

impl Anomalies {
    pub fn total(&self) -> u32 {
        self.holes + self.overlaps + self.missing + self.down + self.misc
    }

    pub fn is_clean(&self) -> bool {
        self.total() == 0
    }

    /// Holes or overlaps: the range assignment itself is wrong.
    pub fn has_range_damage(&self) -> bool {
        self.holes > 0 || self.overlaps > 0
    }
}

/// Why `search` could not name a subvolume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchMiss {
    /// No entry covers the hash.
    Hole,
    /// The covering entry belongs to a node in a failed state.
    Failed { subvol: SubvolId, status: EntryStatus },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Layout {
    /// Sorted: ranged entries by (start, subvol), then zero-width/failed entries by subvol.
    pub entries: Vec<LayoutEntry>,
    /// Topology generation the layout was built under.
    pub generation: u64,
    /// Pinned to a single node rather than computed (file layouts).
    pub preset: bool,
    /// Misses on the hashed node should fall back to searching every node.
    pub search_unhashed: bool,
    pub spread_count: usize,
}
