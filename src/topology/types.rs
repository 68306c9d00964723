use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Name of a subvolume. Ordering on this id is what makes layouts reproducible.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubvolId(pub String);

impl SubvolId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubvolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubvolId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubvolState {
    Up,
    Down,
}

/// Last known free space on a subvolume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DiskUsage {
    pub avail_percent: f64,
    pub avail_bytes: u64,
}

/// One storage node participating in the volume.
///
/// `incarnation` increases on every change to this entry; the registry-wide
/// generation increases whenever liveness or membership changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subvolume {
    pub id: SubvolId,
    pub state: SubvolState,
    /// Node is being drained: it receives no new layout ranges and its files get migrated away.
    pub decommissioned: bool,
    pub disk_usage: Option<DiskUsage>,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl Subvolume {
    pub fn new(id: SubvolId) -> Self {
        Self {
            id,
            state: SubvolState::Up,
            decommissioned: false,
            disk_usage: None,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        }
    }

    pub fn is_up(&self) -> bool {
        self.state == SubvolState::Up
    }
}

/// Topology-change notifications consumed by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TopologyEvent {
    Up { id: SubvolId },
    Down { id: SubvolId },
    Added { id: SubvolId },
    Removed { id: SubvolId },
    Decommission { id: SubvolId },
    Recommission { id: SubvolId },
    DiskUsage { id: SubvolId, usage: DiskUsage },
}

impl TopologyEvent {
    pub fn subvol(&self) -> &SubvolId {
        match self {
            TopologyEvent::Up { id }
            | TopologyEvent::Down { id }
            | TopologyEvent::Added { id }
            | TopologyEvent::Removed { id }
            | TopologyEvent::Decommission { id }
            | TopologyEvent::Recommission { id }
            | TopologyEvent::DiskUsage { id, .. } => id,
        }
    }
}

/// Immutable copy of the registry taken at the start of an operation.
#[derive(Debug, Clone)]
pub struct TopologyView {
    pub generation: u64,
    /// Sorted by id.
    pub subvols: Vec<Subvolume>,
}

impl TopologyView {
    pub fn all(&self) -> Vec<SubvolId> {
        self.subvols.iter().map(|s| s.id.clone()).collect()
    }

    pub fn up(&self) -> Vec<SubvolId> {
        self.subvols
            .iter()
            .filter(|s| s.is_up())
            .map(|s| s.id.clone())
            .collect()
    }

    /// Nodes that should own a slice of a freshly computed layout.
    pub fn layout_eligible(&self) -> Vec<SubvolId> {
        self.subvols
            .iter()
            .filter(|s| s.is_up() && !s.decommissioned)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn get(&self, id: &SubvolId) -> Option<&Subvolume> {
        self.subvols.iter().find(|s| &s.id == id)
    }

    pub fn contains(&self, id: &SubvolId) -> bool {
        self.get(id).is_some()
    }

    pub fn is_up(&self, id: &SubvolId) -> bool {
        self.get(id).map(|s| s.is_up()).unwrap_or(false)
    }

    pub fn is_decommissioned(&self, id: &SubvolId) -> bool {
        self.get(id).map(|s| s.decommissioned).unwrap_or(false)
    }

    pub fn first_up(&self) -> Option<SubvolId> {
        self.subvols.iter().find(|s| s.is_up()).map(|s| s.id.clone())
    }
}
