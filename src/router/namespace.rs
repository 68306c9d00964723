use uuid::Uuid;

use super::distribute::{Distribute, FileHandle};
use crate::aggregator::{AttrMerge, AttrMode, Collect, ReaddirMerge, dispatch, dispatch_each};
use crate::error::{Errno, FopResult};
use crate::fop::{DirEntry, Fop, IaType, Iatt, LINKFILE_MODE, Loc, Reply, Xattrs};
use crate::migration::{linkto_xattr, strip_phase1};
use crate::selfheal::{DirTemplate, fresh_layout, layout_xattr};
use crate::topology::types::SubvolId;

impl Distribute {
    /// Creates a directory on its hashed node, then on every other live node, each
    /// copy carrying its slice of a freshly computed layout.
    pub async fn mkdir(&self, loc: &Loc, mode: u32) -> FopResult<Iatt> {
        let parent = loc.parent().ok_or(Errno::EEXIST)?;
        let parent_layout = self.dir_layout(&parent).await?;
        let hashed = self.hashed_for_create(loc, &parent_layout)?;

        let view = self.view();
        let layout = fresh_layout(loc, &view, self.config.dir_spread_count);
        let gfid = Uuid::new_v4();
        let mkdir_on = |subvol: &SubvolId| Fop::Mkdir {
            loc: loc.clone(),
            mode,
            gfid,
            xattrs: layout_xattr(layout.range_of(subvol)),
        };

        let (first, _) = self.transport.submit(&hashed, mkdir_on(&hashed)).await?.into_entry()?;

        let requests: Vec<(SubvolId, Fop)> = view
            .up()
            .into_iter()
            .filter(|id| id != &hashed)
            .map(|id| {
                let fop = mkdir_on(&id);
                (id, fop)
            })
            .collect();
        let results = dispatch_each(&self.transport, requests, Collect::new()).wait().await?;

        let mut attrs = AttrMerge::new(AttrMode::Directory);
        attrs.merge_iatt(&hashed, &first);
        let mut complete = view.up().len() == view.subvols.len();
        for (id, result) in results {
            match result {
                Ok(reply) => {
                    if let Some(iatt) = reply.iatt() {
                        attrs.merge_iatt(&id, iatt);
                    }
                }
                Err(errno) => {
                    tracing::warn!("mkdir {} on {} failed: {}", loc, id, errno);
                    complete = false;
                }
            }
        }

        self.remember(loc, &first, Some(hashed.clone()), hashed);
        if complete {
            self.layouts.insert(loc.clone(), std::sync::Arc::new(layout));
        } else {
            // The next lookup merges what was written and heals the rest.
            self.layouts.remove(loc);
        }

        tracing::debug!("Created directory {}", loc);
        attrs.result()
    }

    /// Creates a regular file on its hashed node.
    ///
    /// When the hashed node is below the free-space minimum, the data goes to the node
    /// with the most room and the hashed node gets a link file pointing at it.
    pub async fn create(&self, loc: &Loc, mode: u32, flags: u32) -> FopResult<(Iatt, FileHandle)> {
        let parent = loc.parent().ok_or(Errno::EEXIST)?;
        match self.lookup(loc).await {
            Ok(_) => return Err(Errno::EEXIST),
            Err(errno) if errno.is_absent() => {}
            Err(errno) => return Err(errno),
        }

        let layout = self.dir_layout(&parent).await?;
        let hashed = self.hashed_for_create(loc, &layout)?;
        let cached = if self.registry.is_filled(&hashed) {
            self.registry
                .free_disk_available(&hashed)
                .unwrap_or_else(|| hashed.clone())
        } else {
            hashed.clone()
        };
        let gfid = Uuid::new_v4();

        if cached != hashed {
            tracing::info!("{} is short of space; placing {} on {}", hashed, loc, cached);
            let link = Fop::Create {
                loc: loc.clone(),
                mode: LINKFILE_MODE,
                gfid,
                xattrs: linkto_xattr(&cached),
            };
            self.transport.submit(&hashed, link).await?;
        }

        let fop = Fop::Create {
            loc: loc.clone(),
            mode,
            gfid,
            xattrs: Xattrs::new(),
        };
        let reply = match self.transport.submit(&cached, fop).await {
            Ok(reply) => reply,
            Err(errno) => {
                if cached != hashed
                    && let Err(cleanup) = self.transport.submit(&hashed, Fop::Unlink { loc: loc.clone() }).await
                {
                    tracing::warn!("Could not remove link file {} on {}: {}", loc, hashed, cleanup);
                }
                return Err(errno);
            }
        };

        let (iatt, _) = reply.into_entry()?;
        self.remember(loc, &iatt, Some(hashed), cached.clone());
        let fh = FileHandle::new(loc.clone(), iatt.gfid, flags, cached);
        Ok((iatt, fh))
    }

    /// Removes a file's data on its cached node and its link file on the hashed node.
    pub async fn unlink(&self, loc: &Loc) -> FopResult<()> {
        let mut attempt = 0;
        let ctx = loop {
            attempt += 1;
            let ctx = self.resolve(loc).await?;
            if ctx.ia_type == IaType::Directory {
                return Err(Errno::EISDIR);
            }
            match self.transport.submit(&ctx.cached, Fop::Unlink { loc: loc.clone() }).await {
                Ok(_) => break ctx,
                // Moved since we last looked; look again once.
                Err(errno) if errno.is_absent() && attempt < 2 => self.forget(loc),
                Err(errno) => {
                    self.forget(loc);
                    return Err(errno);
                }
            }
        };

        if let Some(hashed) = &ctx.hashed
            && hashed != &ctx.cached
        {
            match self.transport.submit(hashed, Fop::Unlink { loc: loc.clone() }).await {
                Ok(_) => {}
                Err(errno) if errno.is_absent() => {}
                Err(errno) => tracing::warn!("Could not remove link file {} on {}: {}", loc, hashed, errno),
            }
        }

        self.forget(loc);
        Ok(())
    }

    /// Removes a directory from every node.
    ///
    /// Link files are the only entries a removable directory may still hold; they are
    /// removed first. If some node refuses, the directory is restored where it was
    /// already removed, with its layout.
    pub async fn rmdir(&self, loc: &Loc) -> FopResult<()> {
        if loc.is_root() {
            return Err(Errno::EPERM);
        }
        let ctx = self.resolve(loc).await?;
        if ctx.ia_type != IaType::Directory {
            return Err(Errno::ENOTDIR);
        }
        let (iatt, layout) = self.lookup_dir(loc).await?;

        let view = self.view();
        let up = view.up();
        if up.len() != view.subvols.len() {
            tracing::warn!("Refusing to remove {} while a node is down", loc);
            return Err(Errno::ENOTCONN);
        }

        let listings = dispatch(&self.transport, &up, &Fop::Readdir { loc: loc.clone() }, Collect::new())
            .wait()
            .await?;
        let mut stale = Vec::new();
        for (id, result) in listings {
            match result.and_then(Reply::into_entries) {
                Ok(entries) => {
                    for entry in entries {
                        if !entry.iatt.has_linkfile_mode() {
                            return Err(Errno::ENOTEMPTY);
                        }
                        stale.push((id.clone(), Fop::Unlink { loc: loc.child(&entry.name) }));
                    }
                }
                Err(errno) if errno.is_absent() => {}
                Err(errno) => return Err(errno),
            }
        }
        if !stale.is_empty() {
            tracing::info!("Removing {} stale link file(s) under {}", stale.len(), loc);
            dispatch_each(&self.transport, stale, Collect::new()).wait().await?;
        }

        let results = dispatch(&self.transport, &up, &Fop::Rmdir { loc: loc.clone() }, Collect::new())
            .wait()
            .await?;
        let removed: Vec<SubvolId> = results
            .iter()
            .filter(|(_, result)| result.is_ok())
            .map(|(id, _)| id.clone())
            .collect();
        let refused = results
            .values()
            .filter_map(|result| result.as_ref().err())
            .filter(|errno| !errno.is_absent())
            .min()
            .copied();

        if let Some(errno) = refused {
            if !removed.is_empty() {
                let template = DirTemplate {
                    gfid: iatt.gfid,
                    mode: iatt.mode,
                };
                if let Err(restore) = self.healer.restore_removed(loc, &layout, &removed, template).await {
                    tracing::warn!("Could not fully restore {} after a refused rmdir: {}", loc, restore);
                }
            }
            self.layouts.remove(loc);
            return Err(errno);
        }
        if removed.is_empty() {
            self.forget_tree(loc);
            return Err(Errno::ENOENT);
        }

        self.forget_tree(loc);
        Ok(())
    }

    /// Renames a file or directory.
    pub async fn rename(&self, old: &Loc, new: &Loc) -> FopResult<Iatt> {
        if old.is_root() || new.is_root() {
            return Err(Errno::EINVAL);
        }
        let src = self.resolve(old).await?;
        if src.ia_type == IaType::Directory {
            return self.rename_dir(old, new).await;
        }

        let new_parent = new.parent().ok_or(Errno::EINVAL)?;
        let dst_layout = self.dir_layout(&new_parent).await?;
        let dst_hashed = self.hashed_for_create(new, &dst_layout)?;
        let dst = match self.resolve(new).await {
            Ok(ctx) => Some(ctx),
            Err(errno) if errno.is_absent() => None,
            Err(errno) => return Err(errno),
        };
        if let Some(dst) = &dst
            && dst.ia_type == IaType::Directory
        {
            return Err(Errno::EISDIR);
        }

        let mut reply = self
            .transport
            .submit(
                &src.cached,
                Fop::Rename {
                    old: old.clone(),
                    new: new.clone(),
                },
            )
            .await?;
        strip_phase1(&mut reply);
        let iatt = reply.into_attr()?;

        // The overwritten file's data lived elsewhere.
        if let Some(dst) = &dst
            && dst.cached != src.cached
        {
            match self.transport.submit(&dst.cached, Fop::Unlink { loc: new.clone() }).await {
                Ok(_) => {}
                Err(errno) if errno.is_absent() => {}
                Err(errno) => tracing::warn!("Could not remove replaced {} on {}: {}", new, dst.cached, errno),
            }
        }

        if dst_hashed != src.cached
            && let Err(errno) = self.ensure_linkfile(new, &dst_hashed, &src.cached, &iatt).await
        {
            tracing::warn!("Could not link {} on {} to {}: {}", new, dst_hashed, src.cached, errno);
        }

        if let Some(src_hashed) = &src.hashed
            && src_hashed != &src.cached
        {
            match self.transport.submit(src_hashed, Fop::Unlink { loc: old.clone() }).await {
                Ok(_) => {}
                Err(errno) if errno.is_absent() => {}
                Err(errno) => tracing::warn!("Could not remove link file {} on {}: {}", old, src_hashed, errno),
            }
        }

        self.forget(old);
        self.remember(new, &iatt, Some(dst_hashed), src.cached);
        Ok(iatt)
    }

    /// Directories exist everywhere: rename on the hashed node first, then the rest.
    async fn rename_dir(&self, old: &Loc, new: &Loc) -> FopResult<Iatt> {
        let view = self.view();
        let up = view.up();
        if up.len() != view.subvols.len() {
            tracing::warn!("Refusing to rename {} while a node is down", old);
            return Err(Errno::ENOTCONN);
        }

        let parent = old.parent().ok_or(Errno::EINVAL)?;
        let layout = self.dir_layout(&parent).await?;
        let hashed = self.hashed_for_create(old, &layout)?;
        let fop = Fop::Rename {
            old: old.clone(),
            new: new.clone(),
        };

        let first = self.transport.submit(&hashed, fop.clone()).await?.into_attr()?;

        let others: Vec<SubvolId> = up.into_iter().filter(|id| id != &hashed).collect();
        let results = dispatch(&self.transport, &others, &fop, Collect::new()).wait().await?;

        self.forget_tree(old);
        self.forget_tree(new);

        let mut attrs = AttrMerge::new(AttrMode::Directory);
        attrs.merge_iatt(&hashed, &first);
        for (id, result) in results {
            match result {
                Ok(reply) => {
                    if let Some(iatt) = reply.iatt() {
                        attrs.merge_iatt(&id, iatt);
                    }
                }
                Err(errno) if errno.is_absent() => {}
                Err(errno) => {
                    tracing::warn!("rename {} -> {} on {} failed: {}", old, new, id, errno);
                    return Err(errno);
                }
            }
        }
        attrs.result()
    }

    /// Lists a directory across every node; link files are hidden and directories
    /// reported once.
    pub async fn readdir(&self, loc: &Loc) -> FopResult<Vec<DirEntry>> {
        let ctx = self.resolve(loc).await?;
        if ctx.ia_type != IaType::Directory {
            return Err(Errno::ENOTDIR);
        }

        let up = self.view().up();
        let entries = dispatch(&self.transport, &up, &Fop::Readdir { loc: loc.clone() }, ReaddirMerge::new())
            .wait()
            .await??;

        let mut reply = Reply::Entries(entries);
        strip_phase1(&mut reply);
        reply.into_entries()
    }
}
