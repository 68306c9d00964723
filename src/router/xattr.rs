use std::sync::Arc;
use std::sync::atomic::Ordering;

use super::distribute::Distribute;
use crate::aggregator::{AttrMerge, AttrMode, dispatch};
use crate::error::{Errno, FopResult};
use crate::fop::{
    FIX_LAYOUT_KEY, Fop, IaType, Loc, MIGRATE_DATA_KEY, PATHINFO_HEADER, PATHINFO_KEY, XattrFlags,
    Xattrs, is_internal_xattr,
};
use crate::layout::Layout;
use crate::rebalance::types::{Task, TaskId};
use crate::selfheal::{DirTemplate, fresh_layout};

impl Distribute {
    /// Reads extended attributes. The layout's own keys are never exposed; the path-info
    /// key is answered by the volume itself.
    pub async fn getxattr(&self, loc: &Loc, name: Option<&str>) -> FopResult<Xattrs> {
        let ctx = self.resolve(loc).await?;

        if name == Some(PATHINFO_KEY) {
            let holders = match ctx.ia_type {
                IaType::Directory => self
                    .view()
                    .up()
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
                _ => ctx.cached.to_string(),
            };
            let value = format!("{}{}", PATHINFO_HEADER, holders);
            return Ok(Xattrs::from([(PATHINFO_KEY.to_string(), value.into_bytes())]));
        }
        if let Some(name) = name
            && is_internal_xattr(name)
        {
            return Err(Errno::ENODATA);
        }

        let fop = Fop::Getxattr {
            loc: loc.clone(),
            name: name.map(str::to_string),
        };
        let reply = match ctx.ia_type {
            IaType::Directory => self.transport.submit(&ctx.cached, fop).await?,
            _ => self.data_op(loc, None, fop).await?,
        };

        let mut xattrs = reply.into_xattrs()?;
        xattrs.retain(|key, _| !is_internal_xattr(key));
        Ok(xattrs)
    }

    /// Writes extended attributes, or triggers a layout fix or a migration when one of
    /// the volume's control keys is set.
    pub async fn setxattr(&self, loc: &Loc, xattrs: Xattrs, flags: XattrFlags) -> FopResult<()> {
        if xattrs.contains_key(FIX_LAYOUT_KEY) {
            return self.fix_layout(loc).await.map(|_| ());
        }
        if xattrs.contains_key(MIGRATE_DATA_KEY) {
            let ctx = self.resolve(loc).await?;
            let task = match ctx.ia_type {
                IaType::Directory => Task::FixLayout {
                    path: loc.path.clone(),
                    migrate_data: true,
                },
                _ => Task::MigrateFile {
                    path: loc.path.clone(),
                },
            };
            self.queue.submit(task);
            return Ok(());
        }
        if xattrs.keys().any(|key| is_internal_xattr(key)) {
            return Err(Errno::EPERM);
        }

        let ctx = self.resolve(loc).await?;
        let fop = Fop::Setxattr {
            loc: loc.clone(),
            xattrs,
            flags,
        };
        match ctx.ia_type {
            IaType::Directory => self.on_every_node(&fop).await,
            _ => self.data_op(loc, None, fop).await.map(|_| ()),
        }
    }

    pub async fn removexattr(&self, loc: &Loc, name: &str) -> FopResult<()> {
        if is_internal_xattr(name) {
            return Err(Errno::EPERM);
        }

        let ctx = self.resolve(loc).await?;
        let fop = Fop::Removexattr {
            loc: loc.clone(),
            name: name.to_string(),
        };
        match ctx.ia_type {
            IaType::Directory => self.on_every_node(&fop).await,
            _ => self.data_op(loc, None, fop).await.map(|_| ()),
        }
    }

    async fn on_every_node(&self, fop: &Fop) -> FopResult<()> {
        let up = self.view().up();
        dispatch(&self.transport, &up, fop, AttrMerge::new(AttrMode::Directory))
            .wait()
            .await?
            .map(|_| ())
    }

    /// Recomputes a directory's layout over the current nodes and publishes it.
    ///
    /// Each node keeps the slice closest to its old range, which limits how many files the
    /// new layout misplaces. Refused while any node is down.
    pub async fn fix_layout(&self, loc: &Loc) -> FopResult<Arc<Layout>> {
        let ctx = self.resolve(loc).await?;
        if ctx.ia_type != IaType::Directory {
            return Err(Errno::ENOTDIR);
        }
        let (iatt, current) = self.lookup_dir(loc).await?;

        let view = self.view();
        if current.anomalies().down > 0 || view.up().len() != view.subvols.len() {
            tracing::warn!("Not fixing layout of {} while a node is down", loc);
            return Err(Errno::ENOTCONN);
        }

        let fixed = fresh_layout(loc, &view, self.config.dir_spread_count).rebalanced(&current);
        if fixed.entries != current.entries {
            let template = DirTemplate {
                gfid: iatt.gfid,
                mode: iatt.mode,
            };
            let lock = self.healer.lock_for(loc);
            let _guard = lock.lock().await;
            if let Err(errno) = self.healer.publish(loc, &current, &fixed, &view, template).await {
                tracing::warn!("Fix-layout of {} failed: {}", loc, errno);
                self.layouts.remove(loc);
                return Err(errno);
            }
            tracing::info!("Fixed layout of {}", loc);
        }

        let fixed = Arc::new(fixed);
        self.layouts.insert(loc.clone(), fixed.clone());
        self.queue.stats.layouts_fixed.fetch_add(1, Ordering::Relaxed);
        Ok(fixed)
    }

    /// Queues a fix-layout of `loc` and everything below it, migrating misplaced files.
    pub async fn rebalance(&self, loc: &Loc) -> FopResult<TaskId> {
        let ctx = self.resolve(loc).await?;
        if ctx.ia_type != IaType::Directory {
            return Err(Errno::ENOTDIR);
        }
        tracing::info!("Rebalance of {} requested", loc);
        Ok(self.queue.submit(Task::FixLayout {
            path: loc.path.clone(),
            migrate_data: true,
        }))
    }
}
