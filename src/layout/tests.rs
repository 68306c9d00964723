//! Layout Module Tests
//!
//! Validates range computation, searching and the folding of per-node reports.
//!
//! ## Test Scopes
//! - **Computation**: Full coverage, no overlap and reproducibility for any node count and spread.
//! - **Search**: Every hash of a healthy layout resolves to the node whose range holds it.
//! - **Merge**: Node reports fold into the same aggregate whatever order they arrive in.
//! - **Anomalies**: Each anomaly class is counted on its own.

#[cfg(test)]
mod tests {
    use crate::error::Errno;
    use crate::layout::disk;
    use crate::layout::*;
    use crate::topology::types::SubvolId;
    use proptest::prelude::*;

    fn nodes(n: usize) -> Vec<SubvolId> {
        (0..n).map(|i| SubvolId::new(format!("node-{}", i))).collect()
    }

    fn covered_width(layout: &Layout) -> u64 {
        layout
            .entries
            .iter()
            .filter_map(|e| e.range)
            .map(|r| r.width())
            .sum()
    }

    // ============================================================
    // COMPUTATION TESTS
    // ============================================================

    #[test]
    fn test_four_nodes_get_equal_quarters() {
        let ids = nodes(4);
        let layout = Layout::compute(&ids, 4);

        assert_eq!(layout.entries.len(), 4);
        for (i, entry) in layout.entries.iter().enumerate() {
            let range = entry.range.unwrap();
            assert_eq!(entry.subvol, ids[i]);
            assert_eq!(range.width(), 1 << 30);
            assert_eq!(range.start as u64, (i as u64) << 30);
        }
        assert!(layout.anomalies().is_clean());

        // 0x40000001 lives in the second quarter.
        assert_eq!(layout.search(0x4000_0001), Ok(&ids[1]));
    }

    #[test]
    fn test_order_of_input_nodes_does_not_matter() {
        let ids = nodes(5);
        let mut reversed = ids.clone();
        reversed.reverse();

        assert_eq!(Layout::compute(&ids, 0), Layout::compute(&reversed, 0));
    }

    #[test]
    fn test_spread_smaller_than_node_count() {
        let ids = nodes(8);
        let layout = Layout::compute_seeded(&ids, &[], 3, 0xdead_beef);

        let ranged: Vec<_> = layout.entries.iter().filter(|e| e.range.is_some()).collect();
        assert_eq!(ranged.len(), 3);
        assert_eq!(layout.entries.len(), 8);
        assert_eq!(covered_width(&layout), HASH_SPACE);
        assert!(layout.anomalies().is_clean());

        // A different seed picks a different run of nodes.
        let other = Layout::compute_seeded(&ids, &[], 3, 0xdead_beef + 1);
        assert_ne!(layout.subvols()[..3], other.subvols()[..3]);
    }

    #[test]
    fn test_idle_nodes_get_zero_width() {
        let active = nodes(2);
        let idle = vec![SubvolId::from("retired")];
        let layout = Layout::compute_seeded(&active, &idle, 0, 0);

        assert_eq!(layout.entries.len(), 3);
        assert_eq!(layout.range_of(&SubvolId::from("retired")), None);
        assert!(layout.entry(&SubvolId::from("retired")).unwrap().status.is_ok());
        assert!(layout.anomalies().is_clean());
    }

    #[test]
    fn test_no_nodes_is_one_hole() {
        let layout = Layout::compute(&[], 0);
        assert_eq!(layout.anomalies().holes, 1);
        assert_eq!(layout.search(42), Err(SearchMiss::Hole));
    }

    #[test]
    fn test_preset_covers_everything() {
        let layout = Layout::preset(SubvolId::from("only"), 7);
        assert!(layout.preset);
        assert_eq!(layout.generation, 7);
        assert_eq!(layout.search(0), Ok(&SubvolId::from("only")));
        assert_eq!(layout.search(u32::MAX), Ok(&SubvolId::from("only")));
    }

    // ============================================================
    // MERGE & ANOMALY TESTS
    // ============================================================

    fn merged_from(layout: &Layout) -> Layout {
        let mut merged = Layout::new(layout.entries.len());
        for entry in &layout.entries {
            let raw = disk::encode(entry.range);
            merged.merge(&entry.subvol, Ok(Some(&raw)));
        }
        merged
    }

    #[test]
    fn test_merge_rebuilds_persisted_layout() {
        let layout = Layout::compute(&nodes(3), 0);
        let merged = merged_from(&layout);
        assert_eq!(merged.entries, layout.entries);
    }

    #[test]
    fn test_missing_metadata_leaves_hole() {
        let ids = nodes(3);
        let layout = Layout::compute(&ids, 0);
        let mut merged = merged_from(&layout);
        merged.merge(&ids[1], Ok(None));

        let anomalies = merged.anomalies();
        assert_eq!(anomalies.missing, 1);
        assert_eq!(anomalies.holes, 1);
        assert_eq!(anomalies.overlaps, 0);

        let mid = layout.range_of(&ids[1]).unwrap().start + 5;
        assert_eq!(merged.search(mid), Err(SearchMiss::Hole));
        // Other nodes' ranges survive.
        assert_eq!(merged.search(0), Ok(&ids[0]));
    }

    #[test]
    fn test_error_classes() {
        let ids = nodes(4);
        let mut merged = merged_from(&Layout::compute(&ids, 0));
        merged.merge(&ids[0], Err(Errno::ENOTCONN));
        merged.merge(&ids[1], Err(Errno::ENOENT));
        merged.merge(&ids[2], Err(Errno::EIO));
        merged.merge(&ids[3], Ok(Some(b"garbage")));

        let anomalies = merged.anomalies();
        assert_eq!(anomalies.down, 1);
        assert_eq!(anomalies.missing, 2);
        assert_eq!(anomalies.misc, 1);
        assert_eq!(anomalies.holes, 1);
        assert_eq!(merged.entry(&ids[3]).unwrap().status, EntryStatus::Corrupt);
    }

    #[test]
    fn test_overlap_is_counted_and_still_searchable() {
        let a = SubvolId::from("a");
        let b = SubvolId::from("b");
        let mut layout = Layout::new(2);
        layout.merge(&a, Ok(Some(&disk::encode(Some(HashRange::new(0, 0x9fff_ffff))))));
        layout.merge(&b, Ok(Some(&disk::encode(Some(HashRange::new(0x8000_0000, u32::MAX))))));

        let anomalies = layout.anomalies();
        assert_eq!(anomalies.overlaps, 1);
        assert_eq!(anomalies.holes, 0);
        assert!(layout.search(0x9000_0000).is_ok());
        assert_eq!(layout.search(0xf000_0000), Ok(&b));
    }

    #[test]
    fn test_failed_range_reports_the_failure() {
        let mut layout = Layout::compute(&nodes(2), 0);
        layout.entries[1].status = EntryStatus::LookupFailed(Errno::ENOTCONN);

        match layout.search(u32::MAX) {
            Err(SearchMiss::Failed { subvol, status }) => {
                assert_eq!(subvol, SubvolId::from("node-1"));
                assert_eq!(status, EntryStatus::LookupFailed(Errno::ENOTCONN));
            }
            other => panic!("unexpected search result {:?}", other),
        }
    }

    #[test]
    fn test_dir_mismatch() {
        let ids = nodes(2);
        let layout = Layout::compute(&ids, 0);
        let same = disk::encode(layout.range_of(&ids[0]));
        let other = disk::encode(layout.range_of(&ids[1]));

        assert!(!layout.dir_mismatch(&ids[0], Some(&same)));
        assert!(layout.dir_mismatch(&ids[0], Some(&other)));
        assert!(layout.dir_mismatch(&ids[0], None));
        assert!(layout.dir_mismatch(&SubvolId::from("stranger"), Some(&same)));
    }

    // ============================================================
    // REBALANCED ASSIGNMENT TESTS
    // ============================================================

    #[test]
    fn test_rebalanced_keeps_most_overlapping_slots() {
        let old_ids: Vec<SubvolId> = ["a", "b", "c"].iter().map(|s| SubvolId::from(*s)).collect();
        let new_ids: Vec<SubvolId> = ["a", "b", "c", "d"].iter().map(|s| SubvolId::from(*s)).collect();

        let old = Layout::compute(&old_ids, 0);
        let fresh = Layout::compute(&new_ids, 0);
        let rebalanced = fresh.rebalanced(&old);

        assert!(rebalanced.anomalies().is_clean());
        assert_eq!(rebalanced.range_of(&SubvolId::from("a")).unwrap().start, 0);
        assert_eq!(
            rebalanced.range_of(&SubvolId::from("c")).unwrap().start as u64,
            3 * (HASH_SPACE / 4)
        );
        assert!(rebalanced.range_of(&SubvolId::from("d")).is_some());

        let kept = |l: &Layout| -> u64 {
            old_ids
                .iter()
                .map(|id| match (l.range_of(id), old.range_of(id)) {
                    (Some(n), Some(o)) => n.overlap(&o),
                    _ => 0,
                })
                .sum()
        };
        assert!(kept(&rebalanced) >= kept(&fresh));
    }

    // ============================================================
    // PROPERTIES
    // ============================================================

    proptest! {
        #[test]
        fn prop_compute_covers_space_exactly(n in 1usize..16, spread in 0usize..20, seed in any::<u32>()) {
            let ids = nodes(n);
            let layout = Layout::compute_seeded(&ids, &[], spread, seed);

            prop_assert!(layout.anomalies().is_clean());
            prop_assert_eq!(covered_width(&layout), HASH_SPACE);
            prop_assert_eq!(layout.entries.len(), n);

            let again = Layout::compute_seeded(&ids, &[], spread, seed);
            prop_assert_eq!(&layout, &again);
            let raw: Vec<Vec<u8>> = layout.entries.iter().map(|e| disk::encode(e.range)).collect();
            let raw_again: Vec<Vec<u8>> = again.entries.iter().map(|e| disk::encode(e.range)).collect();
            prop_assert_eq!(raw, raw_again);
        }

        #[test]
        fn prop_search_finds_owning_range(n in 1usize..16, hash in any::<u32>()) {
            let layout = Layout::compute(&nodes(n), 0);
            let owner = layout.search(hash).unwrap();
            let range = layout.range_of(owner).unwrap();
            prop_assert!(range.contains(hash));

            let owners = layout.entries.iter().filter(|e| e.range.map(|r| r.contains(hash)).unwrap_or(false)).count();
            prop_assert_eq!(owners, 1);
        }

        #[test]
        fn prop_merge_is_order_independent(
            n in 1usize..10,
            failures in proptest::collection::vec(0u8..4, 10),
            order in Just((0usize..10).collect::<Vec<_>>()).prop_shuffle(),
        ) {
            let ids = nodes(n);
            let layout = Layout::compute(&ids, 0);
            let reports: Vec<(SubvolId, Result<Option<Vec<u8>>, Errno>)> = layout
                .entries
                .iter()
                .enumerate()
                .map(|(i, e)| {
                    let report = match failures[i] {
                        0 => Err(Errno::ENOTCONN),
                        1 => Ok(None),
                        _ => Ok(Some(disk::encode(e.range))),
                    };
                    (e.subvol.clone(), report)
                })
                .collect();

            let mut forward = Layout::new(n);
            for (id, report) in &reports {
                forward.merge(id, report.as_ref().map(|r| r.as_deref()).map_err(|e| *e));
            }

            let mut shuffled = Layout::new(n);
            for idx in order.iter().filter(|i| **i < n) {
                let (id, report) = &reports[*idx];
                shuffled.merge(id, report.as_ref().map(|r| r.as_deref()).map_err(|e| *e));
            }

            prop_assert_eq!(forward, shuffled);
        }
    }
}
