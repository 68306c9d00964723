use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::health::{HealthRegistry, IssueKind};
use crate::aggregator::{Collect, dispatch_each};
use crate::error::{Errno, FopResult};
use crate::fop::{Fop, LAYOUT_XATTR, Loc, XattrFlags, Xattrs};
use crate::hash::hash_name;
use crate::layout::{EntryStatus, HASH_SPACE, HashRange, Layout, LayoutEntry, disk};
use crate::topology::types::{SubvolId, TopologyView};
use crate::transport::Transport;

/// Identity a directory is (re)created with on nodes where it is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirTemplate {
    pub gfid: Uuid,
    pub mode: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealOutcome {
    /// Nothing to do.
    Clean,
    /// No usable range existed; a fresh layout was published.
    New,
    /// Broken portions of an existing layout were reassigned.
    Healed,
    /// Layout metadata was unreadable everywhere and has been re-derived.
    Restored,
    /// A node is down; only missing directories were created.
    Deferred,
    /// An unexplained node error blocks healing; recorded for an operator.
    Escalated,
}

/// Fresh layout for a directory over the nodes currently eligible for ranges.
pub fn fresh_layout(loc: &Loc, view: &TopologyView, spread_count: usize) -> Layout {
    let idle: Vec<SubvolId> = view
        .subvols
        .iter()
        .filter(|s| s.is_up() && s.decommissioned)
        .map(|s| s.id.clone())
        .collect();

    let mut layout =
        Layout::compute_seeded(&view.layout_eligible(), &idle, spread_count, hash_name(loc.name()));
    layout.generation = view.generation;
    layout
}

fn width(hole: (u64, u64)) -> u64 {
    hole.1 - hole.0 + 1
}

/// Repairs holes and overlaps while keeping every range that is still usable.
///
/// Ranges are scanned by start; a range overlapping one already kept is demoted. The
/// remaining gaps go to `eligible` nodes holding no range, widest gap first, splitting
/// the widest gap while there are more such nodes than gaps. Gaps nobody takes are
/// absorbed by a neighbouring range. Nodes left without a gap get a zero-width range.
pub fn repair_ranges(layout: &Layout, eligible: &[SubvolId]) -> Layout {
    let mut kept: Vec<(SubvolId, u64, u64)> = Vec::new();
    let mut next_free = 0u64;
    for entry in layout.entries.iter().filter(|e| e.status.is_ok()) {
        let Some(range) = entry.range else { continue };
        if range.start as u64 >= next_free {
            next_free = range.stop as u64 + 1;
            kept.push((entry.subvol.clone(), range.start as u64, range.stop as u64));
        } else {
            tracing::debug!("Demoting overlapping range of {}", entry.subvol);
        }
    }

    let mut holes: Vec<(u64, u64)> = Vec::new();
    let mut cursor = 0u64;
    for (_, start, stop) in &kept {
        if *start > cursor {
            holes.push((cursor, start - 1));
        }
        cursor = stop + 1;
    }
    if cursor < HASH_SPACE {
        holes.push((cursor, HASH_SPACE - 1));
    }

    let needy: Vec<SubvolId> = eligible
        .iter()
        .filter(|id| !kept.iter().any(|(k, _, _)| k == *id))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    while needy.len() > holes.len() {
        let widest = holes
            .iter()
            .enumerate()
            .filter(|(_, h)| width(**h) > 1)
            .max_by(|(_, a), (_, b)| width(**a).cmp(&width(**b)).then(b.0.cmp(&a.0)))
            .map(|(idx, _)| idx);
        let Some(idx) = widest else { break };

        let (start, stop) = holes[idx];
        let mid = start + width((start, stop)) / 2;
        holes[idx] = (start, mid - 1);
        holes.insert(idx + 1, (mid, stop));
    }

    let mut by_width: Vec<usize> = (0..holes.len()).collect();
    by_width.sort_by(|a, b| {
        width(holes[*b])
            .cmp(&width(holes[*a]))
            .then(holes[*a].0.cmp(&holes[*b].0))
    });
    let mut chosen: Vec<usize> = by_width.into_iter().take(needy.len()).collect();
    chosen.sort();

    let mut ranges = kept;
    for (idx, id) in chosen.iter().zip(needy.iter()) {
        let (start, stop) = holes[*idx];
        ranges.push((id.clone(), start, stop));
    }
    ranges.sort_by(|a, b| a.1.cmp(&b.1));

    for (idx, hole) in holes.iter().enumerate() {
        if chosen.contains(&idx) {
            continue;
        }
        if let Some(prev) = ranges.iter_mut().find(|r| r.2 + 1 == hole.0) {
            prev.2 = hole.1;
        } else if let Some(next) = ranges.iter_mut().find(|r| r.1 == hole.1 + 1) {
            next.1 = hole.0;
        }
    }

    let mut repaired = Layout::new(layout.entries.len().max(eligible.len()));
    repaired.generation = layout.generation;
    repaired.spread_count = layout.spread_count;

    for (id, start, stop) in &ranges {
        repaired.entries.push(LayoutEntry::ok(
            id.clone(),
            Some(HashRange::new(*start as u32, *stop as u32)),
        ));
    }
    for id in needy.iter().skip(chosen.len()) {
        repaired.entries.push(LayoutEntry::ok(id.clone(), None));
    }
    for entry in &layout.entries {
        if repaired.entry(&entry.subvol).is_some() {
            continue;
        }
        match entry.status {
            EntryStatus::LookupFailed(errno) if errno.is_unreachable() => {
                repaired.entries.push(entry.clone());
            }
            _ => repaired.entries.push(LayoutEntry::ok(entry.subvol.clone(), None)),
        }
    }

    repaired.sort_entries();
    repaired
}

/// Nodes that are up but do not have the directory.
fn missing_on(layout: &Layout, view: &TopologyView) -> Vec<SubvolId> {
    view.up()
        .into_iter()
        .filter(|id| match layout.entry(id) {
            None => true,
            Some(entry) => matches!(entry.status, EntryStatus::LookupFailed(e) if e.is_absent()),
        })
        .collect()
}

/// Runs the directory heal paths. One heal per directory at a time.
pub struct DirHealer {
    transport: Arc<dyn Transport>,
    health: Arc<HealthRegistry>,
    locks: DashMap<Loc, Arc<Mutex<()>>>,
}

impl DirHealer {
    pub fn new(transport: Arc<dyn Transport>, health: Arc<HealthRegistry>) -> Self {
        Self {
            transport,
            health,
            locks: DashMap::new(),
        }
    }

    pub fn lock_for(&self, loc: &Loc) -> Arc<Mutex<()>> {
        self.locks
            .entry(loc.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Examines a merged layout and repairs it when needed.
    ///
    /// Returns the layout callers should use from now on. It is only different from
    /// the input when metadata was actually rewritten.
    pub async fn heal(
        &self,
        loc: &Loc,
        layout: Layout,
        view: &TopologyView,
        template: DirTemplate,
        spread_count: usize,
    ) -> FopResult<(Layout, HealOutcome)> {
        let anomalies = layout.normalize(&loc.path);
        let missing = missing_on(&layout, view);

        if anomalies.is_clean() && missing.is_empty() {
            self.health.clear(&loc.path);
            return Ok((layout, HealOutcome::Clean));
        }

        if anomalies.misc > 0 {
            let failing: Vec<SubvolId> = layout
                .entries
                .iter()
                .filter(|e| {
                    matches!(e.status, EntryStatus::LookupFailed(err)
                        if !err.is_absent() && !err.is_unreachable())
                })
                .map(|e| e.subvol.clone())
                .collect();
            self.health.record(
                &loc.path,
                IssueKind::MiscLookupError,
                format!("lookup failed on {} live node(s); not healing", failing.len()),
                failing,
            );
            let mut layout = layout;
            layout.search_unhashed = true;
            return Ok((layout, HealOutcome::Escalated));
        }

        let lock = self.lock_for(loc);
        let _guard = lock.lock().await;

        if anomalies.down > 0 {
            if !missing.is_empty() {
                let requests = missing
                    .iter()
                    .map(|id| (id.clone(), mkdir_fop(loc, template, Xattrs::new())))
                    .collect();
                self.send(loc, requests).await?;
            }
            if anomalies.missing > 0 || anomalies.overlaps > 0 || !missing.is_empty() {
                let down: Vec<SubvolId> = layout
                    .entries
                    .iter()
                    .filter(|e| matches!(e.status, EntryStatus::LookupFailed(err) if err.is_unreachable()))
                    .map(|e| e.subvol.clone())
                    .collect();
                self.health.record(
                    &loc.path,
                    IssueKind::HealDeferred,
                    format!("{} node(s) down; ranges left unchanged", down.len()),
                    down,
                );
            }
            let mut layout = layout;
            layout.search_unhashed = true;
            return Ok((layout, HealOutcome::Deferred));
        }

        let eligible = view.layout_eligible();
        if eligible.is_empty() {
            tracing::warn!("No live node can take a range of {}", loc);
            return Err(Errno::ENOTCONN);
        }

        let usable = layout
            .entries
            .iter()
            .any(|e| e.status.is_ok() && e.range.is_some());
        let corrupt = layout
            .entries
            .iter()
            .any(|e| e.status == EntryStatus::Corrupt);

        let (repaired, outcome) = if usable {
            (repair_ranges(&layout, &eligible), HealOutcome::Healed)
        } else if corrupt {
            let mut fresh = fresh_layout(loc, view, spread_count);
            fresh.generation = layout.generation;
            (fresh, HealOutcome::Restored)
        } else {
            let mut fresh = fresh_layout(loc, view, spread_count);
            fresh.generation = layout.generation;
            (fresh, HealOutcome::New)
        };

        tracing::info!("Healing {} ({:?})", loc, outcome);
        self.publish(loc, &layout, &repaired, view, template).await?;
        self.health.clear(&loc.path);

        Ok((repaired, outcome))
    }

    /// Re-creates a directory on nodes where a partially failed `rmdir` removed it.
    pub async fn restore_removed(
        &self,
        loc: &Loc,
        layout: &Layout,
        removed_on: &[SubvolId],
        template: DirTemplate,
    ) -> FopResult<()> {
        let lock = self.lock_for(loc);
        let _guard = lock.lock().await;

        tracing::warn!("Restoring {} on {} node(s) after partial rmdir", loc, removed_on.len());
        let requests = removed_on
            .iter()
            .map(|id| {
                let xattrs = layout_xattr(layout.range_of(id));
                (id.clone(), mkdir_fop(loc, template, xattrs))
            })
            .collect();
        self.send(loc, requests).await
    }

    /// Writes every changed range, creating the directory where it is missing.
    ///
    /// Fails if any live node refused its write. The layout on disk is then partly old
    /// and partly new, so callers must not cache `new`; the next lookup re-reads it.
    pub async fn publish(
        &self,
        loc: &Loc,
        old: &Layout,
        new: &Layout,
        view: &TopologyView,
        template: DirTemplate,
    ) -> FopResult<()> {
        let missing = missing_on(old, view);
        let mut requests = Vec::new();

        for entry in &new.entries {
            if !entry.status.is_ok() || !view.is_up(&entry.subvol) {
                continue;
            }
            let xattrs = layout_xattr(entry.range);
            if missing.contains(&entry.subvol) {
                requests.push((entry.subvol.clone(), mkdir_fop(loc, template, xattrs)));
            } else if old.entry(&entry.subvol) != Some(entry) {
                requests.push((entry.subvol.clone(), setxattr_fop(loc, xattrs)));
            }
        }

        self.send(loc, requests).await
    }

    /// Sends one directory write per node. Every refusal is logged and recorded; the
    /// first one, in node order, is returned.
    async fn send(&self, loc: &Loc, requests: Vec<(SubvolId, Fop)>) -> FopResult<()> {
        if requests.is_empty() {
            return Ok(());
        }

        let pending: Vec<(SubvolId, Fop)> = requests.clone();
        let results = dispatch_each(&self.transport, requests, Collect::new())
            .wait()
            .await?;

        let mut failed: Vec<(SubvolId, Errno)> = Vec::new();
        // A directory created concurrently still needs its range.
        let mut retries = Vec::new();
        for (subvol, fop) in pending {
            match (results.get(&subvol), fop) {
                (Some(Err(Errno::EEXIST)), Fop::Mkdir { loc, xattrs, .. }) if !xattrs.is_empty() => {
                    retries.push((subvol, setxattr_fop(&loc, xattrs)));
                }
                (Some(Err(errno)), fop) if *errno != Errno::EEXIST => {
                    tracing::warn!("Heal of {}: {} on {} failed: {}", loc, fop.name(), subvol, errno);
                    failed.push((subvol, *errno));
                }
                _ => {}
            }
        }

        if !retries.is_empty() {
            let results = dispatch_each(&self.transport, retries, Collect::new())
                .wait()
                .await?;
            for (subvol, result) in results {
                if let Err(errno) = result {
                    tracing::warn!("Heal of {}: layout write on {} failed: {}", loc, subvol, errno);
                    failed.push((subvol, errno));
                }
            }
        }

        failed.sort();
        let Some((_, errno)) = failed.first().cloned() else {
            return Ok(());
        };
        self.health.record(
            &loc.path,
            IssueKind::LayoutWriteFailed,
            format!("directory write refused by {} node(s): {}", failed.len(), errno),
            failed.into_iter().map(|(subvol, _)| subvol).collect(),
        );
        Err(errno)
    }
}

/// Xattr set persisting one node's range.
pub fn layout_xattr(range: Option<HashRange>) -> Xattrs {
    Xattrs::from([(LAYOUT_XATTR.to_string(), disk::encode(range))])
}

fn mkdir_fop(loc: &Loc, template: DirTemplate, xattrs: Xattrs) -> Fop {
    Fop::Mkdir {
        loc: loc.clone(),
        mode: template.mode,
        gfid: template.gfid,
        xattrs,
    }
}

fn setxattr_fop(loc: &Loc, xattrs: Xattrs) -> Fop {
    Fop::Setxattr {
        loc: loc.clone(),
        xattrs,
        flags: XattrFlags::Any,
    }
}
