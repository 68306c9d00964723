use super::types::Task;
use crate::error::{Errno, FopResult};
use crate::fop::Loc;
use crate::router::Distribute;

/// What one crawl did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlSummary {
    /// Directories whose layout was rewritten.
    pub dirs_fixed: u64,
    /// Files handed to the migration queue.
    pub files_queued: u64,
}

/// Walks the tree below `root` depth first, fixing the layout of every directory.
///
/// With `migrate_data`, every file whose data is not on its hashed node, or sits on a
/// decommissioned node, is queued for migration once its directory's layout is final.
pub async fn crawl(volume: &Distribute, root: &Loc, migrate_data: bool) -> FopResult<CrawlSummary> {
    let mut summary = CrawlSummary::default();
    let mut stack = vec![root.clone()];

    while let Some(dir) = stack.pop() {
        let layout = match volume.fix_layout(&dir).await {
            Ok(layout) => layout,
            // Removed since it was listed.
            Err(Errno::ENOENT) if dir != *root => continue,
            Err(errno) => return Err(errno),
        };
        summary.dirs_fixed += 1;

        let entries = match volume.readdir(&dir).await {
            Ok(entries) => entries,
            Err(Errno::ENOENT) if dir != *root => continue,
            Err(errno) => return Err(errno),
        };

        for entry in entries {
            let child = dir.child(&entry.name);
            if entry.iatt.is_dir() {
                stack.push(child);
                continue;
            }
            if !migrate_data || !entry.iatt.is_regular() {
                continue;
            }

            volume.forget(&child);
            let found = match volume.lookup(&child).await {
                Ok(_) => true,
                Err(errno) if errno.is_absent() => {
                    let hashed = volume.hashed_subvol(&child, &layout);
                    volume.lookup_everywhere(&child, hashed.as_ref()).await.is_ok()
                }
                Err(errno) => {
                    tracing::debug!("Skipping {}: {}", child, errno);
                    false
                }
            };
            let Some(ctx) = volume.inode(&child).filter(|_| found) else {
                continue;
            };

            let view = volume.view();
            if ctx.hashed.as_ref() != Some(&ctx.cached) || view.is_decommissioned(&ctx.cached) {
                tracing::debug!("Queueing {} (on {}, hashed {:?})", child, ctx.cached, ctx.hashed);
                volume.queue.submit(Task::MigrateFile {
                    path: child.path.clone(),
                });
                summary.files_queued += 1;
            }
        }
    }

    tracing::info!(
        "Crawl of {} fixed {} layout(s), queued {} file(s)",
        root,
        summary.dirs_fixed,
        summary.files_queued
    );
    Ok(summary)
}
