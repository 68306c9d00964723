use super::disk;
use super::types::*;
use crate::error::Errno;
use crate::topology::types::SubvolId;

impl Layout {
    /// Empty layout with room for `count` nodes.
    pub fn new(count: usize) -> Self {
        Self {
            entries: Vec::with_capacity(count),
            generation: 0,
            preset: false,
            search_unhashed: false,
            spread_count: count,
        }
    }

    /// Splits the hash space evenly over `nodes` (or the first `spread_count` of them).
    pub fn compute(nodes: &[SubvolId], spread_count: usize) -> Self {
        Self::compute_seeded(nodes, &[], spread_count, 0)
    }

    /// Full form of `compute`.
    ///
    /// `active` nodes are candidates for a slice; `idle` nodes (e.g. decommissioned) get a
    /// zero-width entry. When the spread is smaller than the node count, `seed` (normally the
    /// directory's name hash) picks which run of nodes receives slices so that different
    /// directories land on different nodes. Slices are always handed out in id order.
    pub fn compute_seeded(
        active: &[SubvolId],
        idle: &[SubvolId],
        spread_count: usize,
        seed: u32,
    ) -> Self {
        let mut active = active.to_vec();
        active.sort();
        active.dedup();

        let mut idle: Vec<SubvolId> = idle
            .iter()
            .filter(|id| !active.contains(id))
            .cloned()
            .collect();
        idle.sort();
        idle.dedup();

        let n = active.len();
        let spread = if spread_count == 0 || spread_count > n {
            n
        } else {
            spread_count
        };

        let mut layout = Layout::new(n + idle.len());
        layout.spread_count = spread;

        let first = if spread < n { seed as usize % n } else { 0 };
        let mut chosen: Vec<SubvolId> = (0..spread)
            .map(|i| active[(first + i) % n].clone())
            .collect();
        chosen.sort();

        for (i, id) in chosen.iter().enumerate() {
            let start = HASH_SPACE * i as u64 / spread as u64;
            let stop = HASH_SPACE * (i as u64 + 1) / spread as u64 - 1;
            layout.entries.push(LayoutEntry::ok(
                id.clone(),
                Some(HashRange::new(start as u32, stop as u32)),
            ));
        }

        for id in active.iter().filter(|id| !chosen.contains(id)).chain(idle.iter()) {
            layout.entries.push(LayoutEntry::ok(id.clone(), None));
        }

        layout.sort_entries();
        layout
    }

    /// Single full-range layout pinning an object to the node that holds it.
    pub fn preset(subvol: SubvolId, generation: u64) -> Self {
        Self {
            entries: vec![LayoutEntry::ok(subvol, Some(HashRange::full()))],
            generation,
            preset: true,
            search_unhashed: false,
            spread_count: 1,
        }
    }

    pub fn sort_entries(&mut self) {
        self.entries.sort_by(|a, b| {
            let key = |e: &LayoutEntry| (e.range.is_none(), e.range.map(|r| r.start).unwrap_or(0));
            key(a).cmp(&key(b)).then_with(|| a.subvol.cmp(&b.subvol))
        });
    }

    pub fn entry(&self, subvol: &SubvolId) -> Option<&LayoutEntry> {
        self.entries.iter().find(|e| &e.subvol == subvol)
    }

    pub fn range_of(&self, subvol: &SubvolId) -> Option<HashRange> {
        self.entry(subvol).and_then(|e| e.range)
    }

    pub fn subvols(&self) -> Vec<SubvolId> {
        self.entries.iter().map(|e| e.subvol.clone()).collect()
    }

    /// The node whose range holds `hash`.
    pub fn search(&self, hash: u32) -> Result<&SubvolId, SearchMiss> {
        let ranged = self.entries.iter().take_while(|e| e.range.is_some()).count();
        let ranged = &self.entries[..ranged];

        let idx = ranged.partition_point(|e| e.range.map(|r| r.start <= hash).unwrap_or(false));
        if idx > 0 {
            let candidate = &ranged[idx - 1];
            if candidate.status.is_ok() && candidate.range.map(|r| r.contains(hash)).unwrap_or(false) {
                return Ok(&candidate.subvol);
            }
        }

        // Overlapping or failed ranges: fall back to a scan.
        let covering = ranged
            .iter()
            .filter(|e| e.range.map(|r| r.contains(hash)).unwrap_or(false));
        let mut failed = None;
        for entry in covering {
            if entry.status.is_ok() {
                return Ok(&entry.subvol);
            }
            if failed.is_none() {
                failed = Some(SearchMiss::Failed {
                    subvol: entry.subvol.clone(),
                    status: entry.status,
                });
            }
        }

        Err(failed.unwrap_or(SearchMiss::Hole))
    }

    /// Folds one node's report for this directory into the layout.
    ///
    /// `report` is the node's persisted layout xattr (`None` when the directory exists
    /// without one) or the error its lookup failed with. A repeated report for the same
    /// node replaces the earlier one, so merging is order independent.
    pub fn merge(&mut self, subvol: &SubvolId, report: Result<Option<&[u8]>, Errno>) {
        let (range, status) = match report {
            Err(errno) => (None, EntryStatus::LookupFailed(errno)),
            Ok(None) => (None, EntryStatus::MissingMetadata),
            Ok(Some(raw)) => match disk::decode(raw) {
                Ok(range) => (range, EntryStatus::Ok),
                Err(e) => {
                    tracing::warn!("Corrupt layout from {}: {}", subvol, e);
                    (None, EntryStatus::Corrupt)
                }
            },
        };

        self.entries.retain(|e| &e.subvol != subvol);
        self.entries.push(LayoutEntry {
            subvol: subvol.clone(),
            range,
            status,
        });
        self.sort_entries();
    }

    pub fn anomalies(&self) -> Anomalies {
        let mut anomalies = Anomalies::default();

        for entry in &self.entries {
            match entry.status {
                EntryStatus::Ok => {}
                EntryStatus::MissingMetadata | EntryStatus::Corrupt => anomalies.missing += 1,
                EntryStatus::LookupFailed(errno) if errno.is_absent() => anomalies.missing += 1,
                EntryStatus::LookupFailed(errno) if errno.is_unreachable() => anomalies.down += 1,
                EntryStatus::LookupFailed(_) => anomalies.misc += 1,
            }
        }

        let ranges: Vec<HashRange> = self
            .entries
            .iter()
            .filter(|e| e.status.is_ok())
            .filter_map(|e| e.range)
            .collect();

        if ranges.is_empty() {
            anomalies.holes = 1;
            return anomalies;
        }

        let mut expected: u64 = 0;
        for range in ranges {
            let start = range.start as u64;
            if start > expected {
                anomalies.holes += 1;
            } else if start < expected {
                anomalies.overlaps += 1;
            }
            expected = expected.max(range.stop as u64 + 1);
        }
        if expected < HASH_SPACE {
            anomalies.holes += 1;
        }

        anomalies
    }

    /// `anomalies` plus a log line when something is off.
    pub fn normalize(&self, path: &str) -> Anomalies {
        let anomalies = self.anomalies();
        if !anomalies.is_clean() {
            tracing::info!(
                "Layout of {}: {} holes, {} overlaps, {} missing, {} down, {} misc",
                path,
                anomalies.holes,
                anomalies.overlaps,
                anomalies.missing,
                anomalies.down,
                anomalies.misc
            );
        }
        anomalies
    }

    pub fn is_healthy(&self) -> bool {
        self.anomalies().is_clean()
    }

    /// True when the range a node reports on disk disagrees with this layout.
    pub fn dir_mismatch(&self, subvol: &SubvolId, raw: Option<&[u8]>) -> bool {
        let Some(entry) = self.entry(subvol) else {
            return true;
        };
        if !entry.status.is_ok() {
            return false;
        }
        match raw.map(disk::decode) {
            Some(Ok(range)) => range != entry.range,
            Some(Err(_)) | None => true,
        }
    }

    /// Hands the slots of this (freshly computed) layout to nodes so that each node keeps
    /// the slot overlapping most with its range in `old`. Used by fix-layout to limit how
    /// much data a recomputation moves.
    pub fn rebalanced(&self, old: &Layout) -> Layout {
        let slots: Vec<HashRange> = self.entries.iter().filter_map(|e| e.range).collect();
        let mut nodes: Vec<SubvolId> = self
            .entries
            .iter()
            .filter(|e| e.range.is_some())
            .map(|e| e.subvol.clone())
            .collect();
        nodes.sort();

        let mut assigned: Vec<Option<SubvolId>> = vec![None; slots.len()];
        let mut free_nodes = nodes.clone();

        loop {
            let mut best: Option<(u64, usize, usize)> = None;
            for (slot_idx, slot) in slots.iter().enumerate() {
                if assigned[slot_idx].is_some() {
                    continue;
                }
                for (node_idx, node) in free_nodes.iter().enumerate() {
                    let overlap = old.range_of(node).map(|r| r.overlap(slot)).unwrap_or(0);
                    if overlap == 0 {
                        continue;
                    }
                    if best.map(|(o, _, _)| overlap > o).unwrap_or(true) {
                        best = Some((overlap, slot_idx, node_idx));
                    }
                }
            }
            match best {
                Some((_, slot_idx, node_idx)) => {
                    assigned[slot_idx] = Some(free_nodes.remove(node_idx));
                }
                None => break,
            }
        }

        let mut leftovers = free_nodes.into_iter();
        let mut layout = Layout::new(self.entries.len());
        layout.generation = self.generation;
        layout.spread_count = self.spread_count;

        for (slot, owner) in slots.iter().zip(assigned) {
            if let Some(node) = owner.or_else(|| leftovers.next()) {
                layout.entries.push(LayoutEntry::ok(node, Some(*slot)));
            }
        }
        for entry in self.entries.iter().filter(|e| e.range.is_none()) {
            layout.entries.push(entry.clone());
        }

        layout.sort_entries();
        layout
    }
}
