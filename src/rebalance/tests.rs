//! Rebalance Module Tests
//!
//! ## Test Scopes
//! - **Queue**: Deduplication, exclusive claims, lease expiry, retry back-off and the attempt cap.
//! - **Migration**: A file ends up on its hashed node with data, attributes and user xattrs;
//!   a failed or raced copy, or a write just before the switch, leaves the source
//!   authoritative and a retry finishes the job.
//! - **Crawl**: Fixing layouts after a topology change queues exactly the misplaced files.
//! - **Mover**: Workers drain rebalance work until every file sits where its name hashes.

#[cfg(test)]
mod tests {
    use crate::config::DistributeConfig;
    use crate::error::{Errno, FopResult};
    use crate::fop::*;
    use crate::migration::linkto_target;
    use crate::rebalance::queue::MAX_TASK_ATTEMPTS;
    use crate::rebalance::*;
    use crate::router::Distribute;
    use crate::topology::registry::TopologyRegistry;
    use crate::topology::types::{DiskUsage, SubvolId, TopologyEvent};
    use crate::transport::{LocalTransport, Transport};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn ids(n: usize) -> Vec<SubvolId> {
        (0..n).map(|i| SubvolId::new(format!("node-{}", i))).collect()
    }

    fn migrate(path: &str) -> Task {
        Task::MigrateFile {
            path: path.to_string(),
        }
    }

    async fn volume_over(
        transport: Arc<dyn Transport>,
        registry: Arc<TopologyRegistry>,
    ) -> Arc<Distribute> {
        let volume = Distribute::new(transport, registry, DistributeConfig::for_tests());
        volume.lookup(&Loc::root()).await.unwrap();
        volume
    }

    /// `bricks` exist on the transport; only the first `registered` are part of the volume.
    async fn setup_with(bricks: usize, registered: usize) -> (Arc<LocalTransport>, Arc<Distribute>) {
        let all = ids(bricks);
        let transport = LocalTransport::with_bricks(&all);
        let registry = TopologyRegistry::with_subvolumes(&all[..registered], 10.0);
        let volume = volume_over(transport.clone(), registry).await;
        (transport, volume)
    }

    async fn setup(n: usize) -> (Arc<LocalTransport>, Arc<Distribute>) {
        setup_with(n, n).await
    }

    fn set_free(volume: &Distribute, id: &SubvolId, percent: f64) {
        volume.notify(TopologyEvent::DiskUsage {
            id: id.clone(),
            usage: DiskUsage {
                avail_percent: percent,
                avail_bytes: 1 << 20,
            },
        });
    }

    async fn hashed_of(volume: &Distribute, loc: &Loc) -> SubvolId {
        let layout = volume.dir_layout(&loc.parent().unwrap()).await.unwrap();
        volume.hashed_subvol(loc, &layout).unwrap()
    }

    async fn write_file(volume: &Distribute, path: &str, data: &[u8]) {
        let (_, fh) = volume.create(&Loc::new(path), 0o640, 0).await.unwrap();
        volume.writev(&fh, 0, data.to_vec()).await.unwrap();
    }

    async fn read_file(volume: &Distribute, path: &str) -> Vec<u8> {
        let fh = volume.open(&Loc::new(path), 0).await.unwrap();
        volume.readv(&fh, 0, 1 << 16).await.unwrap().0
    }

    async fn object(transport: &LocalTransport, id: &SubvolId, path: &str) -> Option<crate::brick::Object> {
        transport.brick(id).unwrap().object(path).await
    }

    /// Creates `path` away from its hashed node, which is left holding a link file.
    /// Returns (hashed, cached).
    async fn misplaced_file(volume: &Distribute, path: &str, data: &[u8]) -> (SubvolId, SubvolId) {
        let loc = Loc::new(path);
        let hashed = hashed_of(volume, &loc).await;
        set_free(volume, &hashed, 1.0);
        write_file(volume, path, data).await;
        set_free(volume, &hashed, 90.0);
        let cached = volume.inode(&loc).unwrap().cached;
        assert_ne!(hashed, cached);
        (hashed, cached)
    }

    /// Writes to the source the first time the copy writes to the target.
    struct RacingWriter {
        inner: Arc<LocalTransport>,
        source: SubvolId,
        target: SubvolId,
        fired: AtomicBool,
    }

    #[async_trait]
    impl Transport for RacingWriter {
        async fn submit(&self, id: &SubvolId, fop: Fop) -> FopResult<Reply> {
            if id == &self.target
                && matches!(fop, Fop::Writev { .. })
                && !self.fired.swap(true, Ordering::SeqCst)
            {
                let late = Fop::Writev {
                    loc: fop.loc().clone(),
                    offset: 100,
                    data: b"late".to_vec(),
                };
                self.inner.submit(&self.source, late).await?;
            }
            self.inner.submit(id, fop).await
        }
    }

    /// Overwrites the start of the source just before the mover's Phase 2 switch reaches it.
    struct LateWriter {
        inner: Arc<LocalTransport>,
        source: SubvolId,
        acked: AtomicBool,
    }

    #[async_trait]
    impl Transport for LateWriter {
        async fn submit(&self, id: &SubvolId, fop: Fop) -> FopResult<Reply> {
            if let Fop::Setattr { loc, attr } = &fop
                && id == &self.source
                && attr.expect.is_some()
                && !self.acked.load(Ordering::SeqCst)
            {
                let late = Fop::Writev {
                    loc: loc.clone(),
                    offset: 0,
                    data: b"LATE!".to_vec(),
                };
                self.inner.submit(&self.source, late).await?;
                self.acked.store(true, Ordering::SeqCst);
            }
            self.inner.submit(id, fop).await
        }
    }

    // ============================================================
    // QUEUE TESTS
    // ============================================================

    #[test]
    fn test_submit_deduplicates_unfinished_tasks() {
        let queue = TaskQueue::new(1_000, 0);

        let first = queue.submit(migrate("/f"));
        assert_eq!(queue.submit(migrate("/f")), first);
        assert_ne!(queue.submit(migrate("/g")), first);
        assert_eq!(queue.task_count(), 2);

        assert!(queue.try_claim_task(&first));
        assert_eq!(queue.submit(migrate("/f")), first);

        queue.complete_task(&first, TaskOutcome::Done).unwrap();
        assert_ne!(queue.submit(migrate("/f")), first);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let queue = TaskQueue::new(60_000, 0);
        let id = queue.submit(migrate("/f"));

        assert!(queue.try_claim_task(&id));
        assert!(!queue.try_claim_task(&id));
        assert!(queue.available_tasks().is_empty());
        assert_eq!(queue.get_task(&id).unwrap().status, TaskStatus::Running);
        assert!(!queue.try_claim_task(&TaskId::new()));
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let queue = TaskQueue::new(10, 0);
        let id = queue.submit(migrate("/f"));
        assert!(queue.try_claim_task(&id));

        tokio::time::sleep(Duration::from_millis(30)).await;

        let available = queue.available_tasks();
        assert_eq!(available.len(), 1);
        assert!(queue.try_claim_task(&id));
        assert_eq!(queue.get_task(&id).unwrap().attempts, 2);
    }

    #[test]
    fn test_renew_lease_needs_running_task() {
        let queue = TaskQueue::new(1_000, 0);
        let id = queue.submit(migrate("/f"));

        assert!(queue.renew_lease(&id).is_err());
        assert!(queue.try_claim_task(&id));
        assert!(queue.renew_lease(&id).is_ok());
        queue.complete_task(&id, TaskOutcome::Done).unwrap();
        assert!(queue.renew_lease(&id).is_err());
        assert!(queue.renew_lease(&TaskId::new()).is_err());
    }

    #[test]
    fn test_retry_backs_off() {
        let queue = TaskQueue::new(1_000, 60_000);
        let id = queue.submit(migrate("/f"));
        assert!(queue.try_claim_task(&id));

        queue
            .complete_task(&id, TaskOutcome::Retry("busy".to_string()))
            .unwrap();

        assert_eq!(queue.get_task(&id).unwrap().status, TaskStatus::Pending);
        assert!(queue.available_tasks().is_empty());
        assert!(!queue.try_claim_task(&id));
        assert!(!queue.is_idle());
    }

    #[test]
    fn test_retry_gives_up_after_attempt_cap() {
        let queue = TaskQueue::new(1_000, 0);
        let id = queue.submit(migrate("/f"));

        for _ in 0..MAX_TASK_ATTEMPTS {
            assert!(queue.try_claim_task(&id));
            queue
                .complete_task(&id, TaskOutcome::Retry("still busy".to_string()))
                .unwrap();
        }

        assert!(matches!(
            queue.get_task(&id).unwrap().status,
            TaskStatus::Failed { .. }
        ));
        assert!(queue.is_idle());
        assert_eq!(queue.status().failed, 1);
    }

    #[test]
    fn test_status_counts_outcomes() {
        let queue = TaskQueue::new(1_000, 0);
        let done = queue.submit(migrate("/a"));
        let skipped = queue.submit(migrate("/b"));
        let failed = queue.submit(migrate("/c"));
        queue.submit(migrate("/d"));

        for id in [&done, &skipped, &failed] {
            assert!(queue.try_claim_task(id));
        }
        queue.complete_task(&done, TaskOutcome::Done).unwrap();
        queue
            .complete_task(&skipped, TaskOutcome::Skipped("in place".to_string()))
            .unwrap();
        queue
            .complete_task(&failed, TaskOutcome::Failed("broken".to_string()))
            .unwrap();

        let status = queue.status();
        assert_eq!(status.pending, 1);
        assert_eq!(status.running, 0);
        assert_eq!(status.completed, 2);
        assert_eq!(status.failed, 1);
        assert_eq!(status.files_skipped, 1);
    }

    // ============================================================
    // MIGRATION TESTS
    // ============================================================

    #[tokio::test]
    async fn test_migrate_moves_file_to_hashed_node() {
        let (transport, volume) = setup(3).await;
        let loc = Loc::new("/f");
        let (hashed, source) = misplaced_file(&volume, "/f", b"some file contents").await;
        let tag = Xattrs::from([("user.origin".to_string(), b"test".to_vec())]);
        volume.setxattr(&loc, tag, XattrFlags::Any).await.unwrap();

        assert_eq!(migrate_file(&volume, &loc).await, TaskOutcome::Done);

        let moved = object(&transport, &hashed, "/f").await.unwrap();
        assert_eq!(moved.data, b"some file contents".to_vec());
        assert_eq!(moved.iatt.mode & PERM_MASK, 0o640);
        assert!(!moved.xattrs.contains_key(LINKTO_XATTR));
        assert_eq!(moved.xattrs["user.origin"], b"test".to_vec());
        assert!(object(&transport, &source, "/f").await.is_none());

        assert_eq!(read_file(&volume, "/f").await, b"some file contents".to_vec());
        let ctx = volume.inode(&loc).unwrap();
        assert_eq!(ctx.cached, hashed);

        let status = volume.rebalance_status();
        assert_eq!(status.files_migrated, 1);
        assert_eq!(status.bytes_moved, 18);
    }

    #[tokio::test]
    async fn test_migrate_skips_file_already_in_place() {
        let (_, volume) = setup(3).await;
        write_file(&volume, "/f", b"x").await;

        assert!(matches!(
            migrate_file(&volume, &Loc::new("/f")).await,
            TaskOutcome::Skipped(_)
        ));
        assert!(matches!(
            migrate_file(&volume, &Loc::new("/missing")).await,
            TaskOutcome::Skipped(_)
        ));
        assert_eq!(volume.rebalance_status().files_migrated, 0);
    }

    #[tokio::test]
    async fn test_failed_copy_keeps_source_authoritative() {
        let (transport, volume) = setup(3).await;
        let loc = Loc::new("/f");
        let (hashed, source) = misplaced_file(&volume, "/f", b"0123456789").await;
        transport.inject(&hashed, "writev", Errno::ENOSPC);

        assert!(matches!(migrate_file(&volume, &loc).await, TaskOutcome::Retry(_)));

        // The hashed node is a link file again and the data never left the source.
        let link = object(&transport, &hashed, "/f").await.unwrap();
        assert!(link.iatt.has_linkfile_mode());
        assert_eq!(link.iatt.size, 0);
        assert_eq!(linkto_target(&link.xattrs), Some(source.clone()));
        assert_eq!(object(&transport, &source, "/f").await.unwrap().data, b"0123456789".to_vec());

        volume.forget(&loc);
        let iatt = volume.lookup(&loc).await.unwrap();
        assert_eq!(iatt.mode & (S_ISVTX | S_ISGID), 0);
        assert_eq!(read_file(&volume, "/f").await, b"0123456789".to_vec());

        transport.clear_injections();
        assert_eq!(migrate_file(&volume, &loc).await, TaskOutcome::Done);
        let moved = object(&transport, &hashed, "/f").await.unwrap();
        assert_eq!(moved.data, b"0123456789".to_vec());
        assert_eq!(moved.iatt.mode & PERM_MASK, 0o640);
    }

    #[tokio::test]
    async fn test_write_during_copy_aborts_switch() {
        let all = ids(3);
        let local = LocalTransport::with_bricks(&all);
        let registry = TopologyRegistry::with_subvolumes(&all, 10.0);
        let setup_volume = volume_over(local.clone(), registry.clone()).await;
        let (hashed, source) = misplaced_file(&setup_volume, "/f", b"original").await;

        let racing = Arc::new(RacingWriter {
            inner: local.clone(),
            source: source.clone(),
            target: hashed.clone(),
            fired: AtomicBool::new(false),
        });
        let volume = volume_over(racing, registry).await;
        let loc = Loc::new("/f");

        let outcome = migrate_file(&volume, &loc).await;
        assert!(matches!(outcome, TaskOutcome::Retry(ref reason) if reason.contains("changed")));

        let kept = object(&local, &source, "/f").await.unwrap();
        assert_eq!(kept.iatt.size, 104);
        assert!(!kept.iatt.has_linkfile_mode());
        assert!(object(&local, &hashed, "/f").await.unwrap().iatt.has_linkfile_mode());

        // The retry copies the late write too.
        assert_eq!(migrate_file(&volume, &loc).await, TaskOutcome::Done);
        let moved = object(&local, &hashed, "/f").await.unwrap();
        assert_eq!(moved.iatt.size, 104);
        assert_eq!(&moved.data[100..], b"late");
        assert!(object(&local, &source, "/f").await.is_none());
    }

    #[tokio::test]
    async fn test_write_before_switch_is_not_lost() {
        let all = ids(3);
        let local = LocalTransport::with_bricks(&all);
        let registry = TopologyRegistry::with_subvolumes(&all, 10.0);
        let setup_volume = volume_over(local.clone(), registry.clone()).await;
        let (hashed, source) = misplaced_file(&setup_volume, "/f", b"original").await;

        let late = Arc::new(LateWriter {
            inner: local.clone(),
            source: source.clone(),
            acked: AtomicBool::new(false),
        });
        let volume = volume_over(late.clone(), registry).await;
        let loc = Loc::new("/f");

        let outcome = migrate_file(&volume, &loc).await;
        assert!(late.acked.load(Ordering::SeqCst));
        assert!(matches!(outcome, TaskOutcome::Retry(ref reason) if reason.contains("changed")));

        // The source refused the switch and still holds the acknowledged write.
        let kept = object(&local, &source, "/f").await.unwrap();
        assert!(!kept.iatt.has_linkfile_mode());
        assert_eq!(kept.data, b"LATE!nal".to_vec());
        let link = object(&local, &hashed, "/f").await.unwrap();
        assert!(link.iatt.has_linkfile_mode());
        assert_eq!(linkto_target(&link.xattrs), Some(source.clone()));
        assert_eq!(read_file(&volume, "/f").await, b"LATE!nal".to_vec());

        assert_eq!(migrate_file(&volume, &loc).await, TaskOutcome::Done);
        assert_eq!(object(&local, &hashed, "/f").await.unwrap().data, b"LATE!nal".to_vec());
        assert!(object(&local, &source, "/f").await.is_none());
        assert_eq!(read_file(&volume, "/f").await, b"LATE!nal".to_vec());
    }

    #[tokio::test]
    async fn test_migrate_from_unhashed_node_repoints_link() {
        let (transport, volume) = setup(3).await;
        let loc = Loc::new("/f");
        let (hashed, source) = misplaced_file(&volume, "/f", b"abc").await;
        let third = ids(3)
            .into_iter()
            .find(|id| id != &hashed && id != &source)
            .unwrap();

        // Hashed node full again: the data goes to the roomiest other node.
        set_free(&volume, &hashed, 1.0);
        set_free(&volume, &source, 20.0);
        set_free(&volume, &third, 80.0);

        assert_eq!(migrate_file(&volume, &loc).await, TaskOutcome::Done);

        assert_eq!(object(&transport, &third, "/f").await.unwrap().data, b"abc".to_vec());
        let link = object(&transport, &hashed, "/f").await.unwrap();
        assert_eq!(linkto_target(&link.xattrs), Some(third));
        assert!(object(&transport, &source, "/f").await.is_none());
        assert_eq!(read_file(&volume, "/f").await, b"abc".to_vec());
    }

    // ============================================================
    // CRAWL AND MOVER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_crawl_queues_misplaced_files_after_node_added() {
        let (transport, volume) = setup_with(4, 3).await;
        volume.mkdir(&Loc::new("/dir"), 0o755).await.unwrap();
        let paths: Vec<String> = (0..24)
            .map(|i| if i % 2 == 0 { format!("/file-{}", i) } else { format!("/dir/file-{}", i) })
            .collect();
        for path in &paths {
            write_file(&volume, path, path.as_bytes()).await;
        }

        let added = SubvolId::new("node-3");
        volume.notify(TopologyEvent::Added { id: added.clone() });

        let dry = crawl(&volume, &Loc::root(), false).await.unwrap();
        assert_eq!(dry.dirs_fixed, 2);
        assert_eq!(dry.files_queued, 0);

        let summary = crawl(&volume, &Loc::root(), true).await.unwrap();
        assert_eq!(summary.dirs_fixed, 2);
        assert_eq!(volume.rebalance_status().pending as u64, summary.files_queued);
        assert!(object(&transport, &added, "/dir").await.is_some());

        let mover = Rebalancer::new(volume.clone(), 2);
        assert_eq!(mover.run_pending().await as u64, summary.files_queued);

        let status = volume.rebalance_status();
        assert_eq!(status.files_migrated, summary.files_queued);
        assert_eq!(status.failed, 0);
        for path in &paths {
            let loc = Loc::new(path);
            volume.forget(&loc);
            volume.lookup(&loc).await.unwrap();
            let ctx = volume.inode(&loc).unwrap();
            assert_eq!(ctx.hashed.as_ref(), Some(&ctx.cached), "{} misplaced", path);
            assert_eq!(read_file(&volume, path).await, path.as_bytes().to_vec());
        }
    }

    #[tokio::test]
    async fn test_rebalance_drains_decommissioned_node() {
        let (transport, volume) = setup(3).await;
        volume.mkdir(&Loc::new("/d"), 0o755).await.unwrap();
        let paths: Vec<String> = (0..12).map(|i| format!("/d/f{}", i)).collect();
        for path in &paths {
            write_file(&volume, path, path.as_bytes()).await;
        }

        let drained = SubvolId::new("node-0");
        volume.notify(TopologyEvent::Decommission { id: drained.clone() });
        volume.rebalance(&Loc::root()).await.unwrap();

        let mover = Rebalancer::new(volume.clone(), 1);
        assert!(mover.run_pending().await >= 1);
        assert!(volume.queue().is_idle());
        assert_eq!(volume.rebalance_status().failed, 0);

        let layout = volume.cached_layout(&Loc::new("/d")).unwrap();
        assert_eq!(layout.range_of(&drained), None);
        for path in &paths {
            assert!(object(&transport, &drained, path).await.is_none(), "{} left behind", path);
            assert_eq!(read_file(&volume, path).await, path.as_bytes().to_vec());
        }
    }

    #[tokio::test]
    async fn test_fix_layout_task_on_file_fails() {
        let (_, volume) = setup(2).await;
        write_file(&volume, "/f", b"1").await;
        volume.queue().submit(Task::FixLayout {
            path: "/f".to_string(),
            migrate_data: false,
        });

        let mover = Rebalancer::new(volume.clone(), 1);
        assert_eq!(mover.run_pending().await, 1);
        assert_eq!(volume.rebalance_status().failed, 1);
    }

    #[tokio::test]
    async fn test_started_workers_drain_queue() {
        let (_, volume) = setup(3).await;
        let (hashed, _) = misplaced_file(&volume, "/f", b"background").await;
        volume.queue().submit(migrate("/f"));

        Rebalancer::new(volume.clone(), 2).start().await;

        let mut waited = 0;
        while !volume.queue().is_idle() && waited < 50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += 1;
        }
        assert!(volume.queue().is_idle());
        assert_eq!(volume.rebalance_status().files_migrated, 1);
        assert!(volume.inode(&Loc::new("/f")).is_none());
        volume.lookup(&Loc::new("/f")).await.unwrap();
        assert_eq!(volume.inode(&Loc::new("/f")).unwrap().cached, hashed);
    }
}
