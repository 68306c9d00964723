//! Self-Heal Module Tests
//!
//! ## Test Scopes
//! - **Range repair**: Holes and overlaps are fixed while usable ranges stay in place.
//! - **Convergence**: Healing a directory with induced damage leaves no anomalies behind.
//! - **Failure policy**: Unexplained errors escalate, down nodes defer, corrupt metadata restores,
//!   and a refused directory or layout write fails the heal and is recorded.
//! - **Health registry**: Issues are recorded, counted and cleared.

#[cfg(test)]
mod tests {
    use crate::error::Errno;
    use crate::fop::*;
    use crate::layout::{EntryStatus, HASH_SPACE, HashRange, Layout, disk};
    use crate::selfheal::*;
    use crate::topology::registry::TopologyRegistry;
    use crate::topology::types::{SubvolId, TopologyEvent};
    use crate::transport::{LocalTransport, Transport};
    use std::sync::Arc;
    use uuid::Uuid;

    fn ids(n: usize) -> Vec<SubvolId> {
        (0..n).map(|i| SubvolId::new(format!("node-{}", i))).collect()
    }

    fn template() -> DirTemplate {
        DirTemplate {
            gfid: Uuid::from_u128(42),
            mode: 0o755,
        }
    }

    /// Reads the directory's layout back from every node, as a lookup would.
    async fn read_layout(transport: &Arc<LocalTransport>, nodes: &[SubvolId], loc: &Loc) -> Layout {
        let mut layout = Layout::new(nodes.len());
        for id in nodes {
            let report = match transport.submit(id, Fop::Lookup { loc: loc.clone() }).await {
                Ok(reply) => match reply.into_entry() {
                    Ok((_, xattrs)) => Ok(xattrs.get(LAYOUT_XATTR).cloned()),
                    Err(errno) => Err(errno),
                },
                Err(errno) => Err(errno),
            };
            layout.merge(id, report.as_ref().map(|raw| raw.as_deref()).map_err(|e| *e));
        }
        layout
    }

    async fn mkdir_with(transport: &Arc<LocalTransport>, id: &SubvolId, loc: &Loc, range: Option<HashRange>) {
        let mut xattrs = Xattrs::new();
        if let Some(range) = range {
            xattrs.insert(LAYOUT_XATTR.to_string(), disk::encode(Some(range)));
        }
        transport
            .submit(
                id,
                Fop::Mkdir {
                    loc: loc.clone(),
                    mode: 0o755,
                    gfid: template().gfid,
                    xattrs,
                },
            )
            .await
            .unwrap();
    }

    fn healer(transport: &Arc<LocalTransport>) -> (DirHealer, Arc<HealthRegistry>) {
        let health = Arc::new(HealthRegistry::new());
        let transport: Arc<dyn Transport> = transport.clone();
        (DirHealer::new(transport, health.clone()), health)
    }

    /// Marks the first `k` entries of a healthy layout as lost, or stretches each over
    /// half of its successor's range.
    fn damage(layout: &mut Layout, k: usize, overlaps: bool) {
        let victims: Vec<SubvolId> = layout.subvols().into_iter().take(k).collect();
        for id in &victims {
            let entry = layout.entries.iter_mut().find(|e| &e.subvol == id).unwrap();
            if overlaps {
                let range = entry.range.unwrap();
                let stretched = range.stop.saturating_add((range.width() / 2) as u32);
                entry.range = Some(HashRange::new(range.start, stretched));
            } else {
                entry.range = None;
                entry.status = EntryStatus::MissingMetadata;
            }
        }
        layout.sort_entries();
    }

    // ============================================================
    // RANGE REPAIR TESTS
    // ============================================================

    #[test]
    fn test_repair_gives_lost_slice_back() {
        let nodes = ids(4);
        let mut layout = Layout::compute(&nodes, 0);
        let lost = layout.range_of(&nodes[2]).unwrap();
        layout.merge(&nodes[2], Ok(None));

        let repaired = repair_ranges(&layout, &nodes);
        assert!(repaired.is_healthy());
        assert_eq!(repaired.range_of(&nodes[2]), Some(lost));
        for id in [&nodes[0], &nodes[1], &nodes[3]] {
            assert_eq!(repaired.range_of(id), layout.range_of(id));
        }
    }

    #[test]
    fn test_repair_demotes_overlap_and_absorbs_gap() {
        let a = SubvolId::from("a");
        let b = SubvolId::from("b");
        let mut layout = Layout::new(2);
        layout.merge(&a, Ok(Some(&disk::encode(Some(HashRange::new(0, 0x9000_0000))))));
        layout.merge(&b, Ok(Some(&disk::encode(Some(HashRange::new(0x8000_0000, u32::MAX))))));
        assert_eq!(layout.anomalies().overlaps, 1);

        let repaired = repair_ranges(&layout, &[a.clone(), b.clone()]);
        assert!(repaired.is_healthy());
        // First range by start survives untouched; the other node takes the rest.
        assert_eq!(repaired.range_of(&a), Some(HashRange::new(0, 0x9000_0000)));
        assert_eq!(repaired.range_of(&b), Some(HashRange::new(0x9000_0001, u32::MAX)));
    }

    #[test]
    fn test_repair_splits_a_hole_for_several_nodes() {
        let nodes = ids(3);
        let mut layout = Layout::new(3);
        layout.merge(&nodes[0], Ok(Some(&disk::encode(Some(HashRange::new(0, 0x7fff_ffff))))));
        layout.merge(&nodes[1], Ok(None));
        layout.merge(&nodes[2], Ok(None));

        let repaired = repair_ranges(&layout, &nodes);
        assert!(repaired.is_healthy());
        let widths: Vec<u64> = nodes[1..]
            .iter()
            .map(|id| repaired.range_of(id).unwrap().width())
            .collect();
        assert_eq!(widths.iter().sum::<u64>(), HASH_SPACE / 2);
        assert_eq!(widths[0], widths[1]);
    }

    #[test]
    fn test_repair_keeps_unreachable_entries() {
        let nodes = ids(3);
        let mut layout = Layout::compute(&nodes, 0);
        layout.merge(&nodes[1], Err(Errno::ENOTCONN));

        let repaired = repair_ranges(&layout, &[nodes[0].clone(), nodes[2].clone()]);
        assert_eq!(
            repaired.entry(&nodes[1]).unwrap().status,
            EntryStatus::LookupFailed(Errno::ENOTCONN)
        );
        assert_eq!(repaired.anomalies().holes, 0);
    }

    #[test]
    fn test_convergence_for_induced_damage() {
        let n = 6;
        let nodes = ids(n);
        for k in [1, 3, n - 1] {
            for overlaps in [false, true] {
                let mut layout = Layout::compute(&nodes, 0);
                damage(&mut layout, k, overlaps);
                assert!(!layout.is_healthy(), "k={} overlaps={}", k, overlaps);

                let repaired = repair_ranges(&layout, &nodes);
                assert_eq!(repaired.anomalies().total(), 0, "k={} overlaps={}", k, overlaps);
            }
        }
    }

    // ============================================================
    // HEAL PATH TESTS
    // ============================================================

    #[tokio::test]
    async fn test_heal_new_directory_everywhere() {
        let nodes = ids(4);
        let transport = LocalTransport::with_bricks(&nodes);
        let registry = TopologyRegistry::with_subvolumes(&nodes, 5.0);
        let (healer, _) = healer(&transport);
        let loc = Loc::new("/fresh");

        // Present on one node only, with no metadata anywhere.
        mkdir_with(&transport, &nodes[0], &loc, None).await;
        let layout = read_layout(&transport, &nodes, &loc).await;

        let (healed, outcome) = healer
            .heal(&loc, layout, &registry.snapshot(), template(), 0)
            .await
            .unwrap();
        assert_eq!(outcome, HealOutcome::New);
        assert!(healed.is_healthy());

        let reread = read_layout(&transport, &nodes, &loc).await;
        assert!(reread.is_healthy());
        assert_eq!(reread.entries, healed.entries);
    }

    #[tokio::test]
    async fn test_heal_existing_directory_converges() {
        let n = 4;
        let nodes = ids(n);
        for k in [1, 3, n - 1] {
            let transport = LocalTransport::with_bricks(&nodes);
            let registry = TopologyRegistry::with_subvolumes(&nodes, 5.0);
            let (healer, health) = healer(&transport);
            let loc = Loc::new("/d");

            let original = Layout::compute(&nodes, 0);
            for (i, id) in nodes.iter().enumerate() {
                let range = if i < k { None } else { original.range_of(id) };
                mkdir_with(&transport, id, &loc, range).await;
            }

            let layout = read_layout(&transport, &nodes, &loc).await;
            assert!(!layout.is_healthy());
            let (_, outcome) = healer
                .heal(&loc, layout, &registry.snapshot(), template(), 0)
                .await
                .unwrap();
            assert_eq!(outcome, HealOutcome::Healed);

            let reread = read_layout(&transport, &nodes, &loc).await;
            assert_eq!(reread.anomalies().total(), 0, "k={}", k);
            for id in &nodes[k..] {
                assert_eq!(reread.range_of(id), original.range_of(id));
            }
            assert!(health.is_empty());
        }
    }

    #[tokio::test]
    async fn test_heal_creates_missing_directory() {
        let nodes = ids(3);
        let transport = LocalTransport::with_bricks(&nodes);
        let registry = TopologyRegistry::with_subvolumes(&nodes, 5.0);
        let (healer, _) = healer(&transport);
        let loc = Loc::new("/partial");

        let original = Layout::compute(&nodes, 0);
        for id in &nodes[..2] {
            mkdir_with(&transport, id, &loc, original.range_of(id)).await;
        }

        let layout = read_layout(&transport, &nodes, &loc).await;
        healer
            .heal(&loc, layout, &registry.snapshot(), template(), 0)
            .await
            .unwrap();

        let created = transport.brick(&nodes[2]).unwrap().object("/partial").await.unwrap();
        assert!(created.iatt.is_dir());
        assert_eq!(created.iatt.gfid, template().gfid);
        assert!(read_layout(&transport, &nodes, &loc).await.is_healthy());
    }

    #[tokio::test]
    async fn test_heal_restores_corrupt_metadata() {
        let nodes = ids(2);
        let transport = LocalTransport::with_bricks(&nodes);
        let registry = TopologyRegistry::with_subvolumes(&nodes, 5.0);
        let (healer, _) = healer(&transport);
        let loc = Loc::new("/corrupt");

        for id in &nodes {
            mkdir_with(&transport, id, &loc, None).await;
            transport
                .submit(
                    id,
                    Fop::Setxattr {
                        loc: loc.clone(),
                        xattrs: Xattrs::from([(LAYOUT_XATTR.to_string(), vec![1, 2, 3])]),
                        flags: XattrFlags::Any,
                    },
                )
                .await
                .unwrap();
        }

        let layout = read_layout(&transport, &nodes, &loc).await;
        let (_, outcome) = healer
            .heal(&loc, layout, &registry.snapshot(), template(), 0)
            .await
            .unwrap();
        assert_eq!(outcome, HealOutcome::Restored);
        assert!(read_layout(&transport, &nodes, &loc).await.is_healthy());
    }

    #[tokio::test]
    async fn test_restore_after_partial_rmdir() {
        let nodes = ids(2);
        let transport = LocalTransport::with_bricks(&nodes);
        let (healer, _) = healer(&transport);
        let loc = Loc::new("/kept");

        let layout = Layout::compute(&nodes, 0);
        for id in &nodes {
            mkdir_with(&transport, id, &loc, layout.range_of(id)).await;
        }
        transport.submit(&nodes[0], Fop::Rmdir { loc: loc.clone() }).await.unwrap();

        healer
            .restore_removed(&loc, &layout, &nodes[..1], template())
            .await
            .unwrap();

        let reread = read_layout(&transport, &nodes, &loc).await;
        assert!(reread.is_healthy());
        assert_eq!(reread.range_of(&nodes[0]), layout.range_of(&nodes[0]));
    }

    // ============================================================
    // FAILURE POLICY TESTS
    // ============================================================

    #[tokio::test]
    async fn test_misc_error_escalates_without_writing() {
        let nodes = ids(3);
        let transport = LocalTransport::with_bricks(&nodes);
        let registry = TopologyRegistry::with_subvolumes(&nodes, 5.0);
        let (healer, health) = healer(&transport);
        let loc = Loc::new("/sick");

        for id in &nodes[..2] {
            mkdir_with(&transport, id, &loc, None).await;
        }
        transport.inject(&nodes[2], "lookup", Errno::EIO);
        let layout = read_layout(&transport, &nodes, &loc).await;
        transport.reset_calls();

        let (returned, outcome) = healer
            .heal(&loc, layout, &registry.snapshot(), template(), 0)
            .await
            .unwrap();
        assert_eq!(outcome, HealOutcome::Escalated);
        assert!(returned.search_unhashed);
        assert!(health.has("/sick", IssueKind::MiscLookupError));
        for id in &nodes {
            assert_eq!(transport.calls(id, "setxattr"), 0);
            assert_eq!(transport.calls(id, "mkdir"), 0);
        }

        let report = health.report();
        assert!(!report.healthy);
        assert_eq!(report.issues[0].subvols, vec![nodes[2].clone()]);
    }

    #[tokio::test]
    async fn test_down_node_defers_range_repair() {
        let nodes = ids(3);
        let transport = LocalTransport::with_bricks(&nodes);
        let registry = TopologyRegistry::with_subvolumes(&nodes, 5.0);
        let (healer, health) = healer(&transport);
        let loc = Loc::new("/waiting");

        let original = Layout::compute(&nodes, 0);
        mkdir_with(&transport, &nodes[0], &loc, original.range_of(&nodes[0])).await;
        mkdir_with(&transport, &nodes[2], &loc, original.range_of(&nodes[2])).await;
        transport.set_down(&nodes[2], true);
        registry.notify(TopologyEvent::Down { id: nodes[2].clone() });

        let layout = read_layout(&transport, &nodes, &loc).await;
        let (_, outcome) = healer
            .heal(&loc, layout, &registry.snapshot(), template(), 0)
            .await
            .unwrap();
        assert_eq!(outcome, HealOutcome::Deferred);
        assert!(health.has("/waiting", IssueKind::HealDeferred));

        // The directory was created on the live node, but without a range.
        let created = transport.brick(&nodes[1]).unwrap().object("/waiting").await.unwrap();
        assert!(!created.xattrs.contains_key(LAYOUT_XATTR));
        assert_eq!(transport.calls(&nodes[0], "setxattr"), 0);

        // Once the node is back a heal completes and clears the record.
        transport.set_down(&nodes[2], false);
        registry.notify(TopologyEvent::Up { id: nodes[2].clone() });
        let layout = read_layout(&transport, &nodes, &loc).await;
        let (_, outcome) = healer
            .heal(&loc, layout, &registry.snapshot(), template(), 0)
            .await
            .unwrap();
        assert_eq!(outcome, HealOutcome::Healed);
        assert!(read_layout(&transport, &nodes, &loc).await.is_healthy());
        assert!(health.is_empty());
    }

    #[tokio::test]
    async fn test_no_eligible_node_is_fatal() {
        let nodes = ids(1);
        let transport = LocalTransport::with_bricks(&nodes);
        let registry = TopologyRegistry::with_subvolumes(&nodes, 5.0);
        registry.notify(TopologyEvent::Decommission { id: nodes[0].clone() });
        let (healer, _) = healer(&transport);
        let loc = Loc::new("/nowhere");

        mkdir_with(&transport, &nodes[0], &loc, None).await;
        let layout = read_layout(&transport, &nodes, &loc).await;
        let result = healer.heal(&loc, layout, &registry.snapshot(), template(), 0).await;
        assert_eq!(result.unwrap_err(), Errno::ENOTCONN);
    }

    #[tokio::test]
    async fn test_refused_layout_write_fails_heal() {
        let nodes = ids(3);
        let transport = LocalTransport::with_bricks(&nodes);
        let registry = TopologyRegistry::with_subvolumes(&nodes, 5.0);
        let (healer, health) = healer(&transport);
        let loc = Loc::new("/d");

        let original = Layout::compute(&nodes, 0);
        mkdir_with(&transport, &nodes[0], &loc, None).await;
        for id in &nodes[1..] {
            mkdir_with(&transport, id, &loc, original.range_of(id)).await;
        }
        transport.inject(&nodes[0], "setxattr", Errno::EIO);

        let layout = read_layout(&transport, &nodes, &loc).await;
        let result = healer.heal(&loc, layout, &registry.snapshot(), template(), 0).await;
        assert_eq!(result.err(), Some(Errno::EIO));

        let issues = health.issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::LayoutWriteFailed);
        assert_eq!(issues[0].subvols, vec![nodes[0].clone()]);
        assert!(!read_layout(&transport, &nodes, &loc).await.is_healthy());
    }

    #[tokio::test]
    async fn test_refused_mkdir_fails_heal_until_retried() {
        let nodes = ids(3);
        let transport = LocalTransport::with_bricks(&nodes);
        let registry = TopologyRegistry::with_subvolumes(&nodes, 5.0);
        let (healer, health) = healer(&transport);
        let loc = Loc::new("/partial");

        let original = Layout::compute(&nodes, 0);
        for id in &nodes[..2] {
            mkdir_with(&transport, id, &loc, original.range_of(id)).await;
        }
        transport.inject(&nodes[2], "mkdir", Errno::EIO);

        let layout = read_layout(&transport, &nodes, &loc).await;
        let result = healer.heal(&loc, layout, &registry.snapshot(), template(), 0).await;
        assert_eq!(result.err(), Some(Errno::EIO));
        assert!(transport.brick(&nodes[2]).unwrap().object("/partial").await.is_none());
        assert_eq!(health.issues()[0].subvols, vec![nodes[2].clone()]);

        transport.clear_injections();
        let layout = read_layout(&transport, &nodes, &loc).await;
        healer
            .heal(&loc, layout, &registry.snapshot(), template(), 0)
            .await
            .unwrap();
        assert!(read_layout(&transport, &nodes, &loc).await.is_healthy());
        assert!(health.is_empty());
    }

    // ============================================================
    // HEALTH REGISTRY TESTS
    // ============================================================

    #[test]
    fn test_health_counts_repeats_and_clears() {
        let health = HealthRegistry::new();
        let node = SubvolId::from("n");
        health.record("/a", IssueKind::AmbiguousPlacement, "two copies".into(), vec![node.clone()]);
        health.record("/a", IssueKind::AmbiguousPlacement, "two copies".into(), vec![node]);
        health.record("/b", IssueKind::HealDeferred, "down".into(), vec![]);

        let issues = health.issues();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].path, "/a");
        assert_eq!(issues[0].count, 2);

        health.clear_kind("/b", IssueKind::HealDeferred);
        health.clear("/a");
        assert!(health.is_empty());
        assert!(health.report().healthy);
    }
}
