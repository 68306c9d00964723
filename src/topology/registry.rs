use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

use super::types::{DiskUsage, SubvolId, SubvolState, Subvolume, TopologyEvent, TopologyView};

pub struct TopologyRegistry {
    pub members: Arc<DashMap<SubvolId, Subvolume>>,
    generation: AtomicU64,
    min_free_disk_percent: f64,
}

impl TopologyRegistry {
    pub fn new(min_free_disk_percent: f64) -> Arc<Self> {
        Arc::new(Self {
            members: Arc::new(DashMap::new()),
            generation: AtomicU64::new(1),
            min_free_disk_percent,
        })
    }

    /// Registry pre-populated with live subvolumes.
    pub fn with_subvolumes(ids: &[SubvolId], min_free_disk_percent: f64) -> Arc<Self> {
        let registry = Self::new(min_free_disk_percent);
        for id in ids {
            registry
                .members
                .insert(id.clone(), Subvolume::new(id.clone()));
        }
        registry
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn get_member(&self, id: &SubvolId) -> Option<Subvolume> {
        self.members.get(id).map(|entry| entry.value().clone())
    }

    pub fn is_up(&self, id: &SubvolId) -> bool {
        self.members
            .get(id)
            .map(|entry| entry.value().is_up())
            .unwrap_or(false)
    }

    pub fn get_up_members(&self) -> Vec<SubvolId> {
        self.snapshot().up()
    }

    pub fn snapshot(&self) -> TopologyView {
        // Generation first: a concurrent change makes the view look older, never newer.
        let generation = self.generation();
        let mut subvols: Vec<Subvolume> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        subvols.sort_by(|a, b| a.id.cmp(&b.id));

        TopologyView {
            generation,
            subvols,
        }
    }

    /// Applies a topology-change notification. Returns true if anything changed.
    pub fn notify(&self, event: TopologyEvent) -> bool {
        let changed = match event {
            TopologyEvent::Up { id } => self.set_state(&id, SubvolState::Up),
            TopologyEvent::Down { id } => self.set_state(&id, SubvolState::Down),
            TopologyEvent::Added { id } => {
                if self.members.contains_key(&id) {
                    false
                } else {
                    info!("Subvolume {} added", id);
                    self.members.insert(id.clone(), Subvolume::new(id));
                    true
                }
            }
            TopologyEvent::Removed { id } => {
                let removed = self.members.remove(&id).is_some();
                if removed {
                    info!("Subvolume {} removed", id);
                }
                removed
            }
            TopologyEvent::Decommission { id } => self.set_decommissioned(&id, true),
            TopologyEvent::Recommission { id } => self.set_decommissioned(&id, false),
            TopologyEvent::DiskUsage { id, usage } => {
                self.update_disk_usage(&id, usage);
                // Disk usage never changes placement of existing objects.
                return false;
            }
        };

        if changed {
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            info!(
                "Topology generation now {} ({} up of {})",
                generation,
                self.get_up_members().len(),
                self.members.len()
            );
        }

        changed
    }

    fn set_state(&self, id: &SubvolId, state: SubvolState) -> bool {
        match self.members.get_mut(id) {
            Some(mut member) => {
                member.last_seen = Some(Instant::now());
                if member.state == state {
                    return false;
                }
                match state {
                    SubvolState::Up => info!("Subvolume {} is up", id),
                    SubvolState::Down => tracing::warn!("Subvolume {} went down", id),
                }
                member.state = state;
                member.incarnation += 1;
                true
            }
            None => {
                tracing::debug!("State change for unknown subvolume {}", id);
                false
            }
        }
    }

    fn set_decommissioned(&self, id: &SubvolId, decommissioned: bool) -> bool {
        match self.members.get_mut(id) {
            Some(mut member) if member.decommissioned != decommissioned => {
                info!(
                    "Subvolume {} {}",
                    id,
                    if decommissioned {
                        "decommissioned"
                    } else {
                        "recommissioned"
                    }
                );
                member.decommissioned = decommissioned;
                member.incarnation += 1;
                true
            }
            _ => false,
        }
    }

    fn update_disk_usage(&self, id: &SubvolId, usage: DiskUsage) {
        if let Some(mut member) = self.members.get_mut(id) {
            member.disk_usage = Some(usage);
            member.last_seen = Some(Instant::now());
        }
    }

    /// A subvolume is filled when its free space drops under the configured minimum.
    /// Nodes with no disk-usage report yet are assumed to have room.
    pub fn is_filled(&self, id: &SubvolId) -> bool {
        match self.members.get(id).and_then(|m| m.disk_usage) {
            Some(usage) => {
                let filled = usage.avail_percent < self.min_free_disk_percent;
                if filled {
                    tracing::warn!(
                        "Subvolume {} has {:.1}% free, below minimum {:.1}%",
                        id,
                        usage.avail_percent,
                        self.min_free_disk_percent
                    );
                }
                filled
            }
            None => false,
        }
    }

    /// The live, non-decommissioned node with the most free space, other than `except`.
    pub fn free_disk_available(&self, except: &SubvolId) -> Option<SubvolId> {
        let view = self.snapshot();
        view.subvols
            .iter()
            .filter(|s| s.is_up() && !s.decommissioned && &s.id != except)
            .filter(|s| {
                s.disk_usage
                    .map(|u| u.avail_percent >= self.min_free_disk_percent)
                    .unwrap_or(true)
            })
            .max_by(|a, b| {
                let pa = a.disk_usage.map(|u| u.avail_percent).unwrap_or(100.0);
                let pb = b.disk_usage.map(|u| u.avail_percent).unwrap_or(100.0);
                pa.partial_cmp(&pb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|s| s.id.clone())
    }
}
