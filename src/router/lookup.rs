use std::sync::Arc;

use super::distribute::{Distribute, InodeCtx};
use crate::aggregator::{AttrMerge, AttrMode, Collect, dispatch};
use crate::config::LookupUnhashed;
use crate::error::{Errno, FopResult};
use crate::fop::{Fop, IaType, Iatt, LAYOUT_XATTR, LINKFILE_MODE, Loc, Reply, XattrFlags, Xattrs};
use crate::layout::Layout;
use crate::migration::{linkto_target, linkto_xattr, strip_phase1};
use crate::selfheal::{DirTemplate, HealOutcome, IssueKind};
use crate::topology::types::SubvolId;

impl Distribute {
    /// Resolves `loc` to its attributes, learning its hashed and cached nodes.
    ///
    /// Files are looked up on the hashed node first. A link file there is followed to
    /// the node it names; a miss falls back to searching every node, as the
    /// `lookup_unhashed` policy allows.
    pub async fn lookup(&self, loc: &Loc) -> FopResult<Iatt> {
        if loc.is_root() {
            return self.lookup_dir(loc).await.map(|(iatt, _)| iatt);
        }

        let parent = loc.parent().ok_or(Errno::EINVAL)?;
        let layout = self.dir_layout(&parent).await?;

        let Some(hashed) = self.hashed_subvol(loc, &layout) else {
            tracing::debug!("No usable hashed node for {}; searching every node", loc);
            return self.lookup_everywhere(loc, None).await;
        };

        match self.transport.submit(&hashed, Fop::Lookup { loc: loc.clone() }).await {
            Ok(mut reply) => {
                strip_phase1(&mut reply);
                let (iatt, xattrs) = reply.into_entry()?;
                if iatt.is_dir() {
                    return self.lookup_dir(loc).await.map(|(iatt, _)| iatt);
                }
                if iatt.has_linkfile_mode() {
                    return self.follow_linkfile(loc, &hashed, &iatt, &xattrs, &layout).await;
                }
                self.remember(loc, &iatt, Some(hashed.clone()), hashed);
                Ok(iatt)
            }
            Err(errno) if errno.is_absent() => {
                if self.searches_unhashed(&layout) {
                    self.lookup_everywhere(loc, Some(&hashed)).await
                } else {
                    self.forget(loc);
                    Err(Errno::ENOENT)
                }
            }
            Err(errno) => Err(errno),
        }
    }

    /// In `auto` mode a miss is searched when the parent layout is healthy, or when a
    /// deferred or escalated heal left placement uncertain and flagged the layout.
    fn searches_unhashed(&self, layout: &Layout) -> bool {
        match self.config.lookup_unhashed {
            LookupUnhashed::On => true,
            LookupUnhashed::Off => false,
            LookupUnhashed::Auto => layout.is_healthy() || layout.search_unhashed,
        }
    }

    /// A link file on the hashed node is trusted only if its target holds a data file
    /// with the same identity; otherwise it is stale and removed.
    async fn follow_linkfile(
        &self,
        loc: &Loc,
        hashed: &SubvolId,
        link: &Iatt,
        xattrs: &Xattrs,
        layout: &Layout,
    ) -> FopResult<Iatt> {
        if let Some(target) = linkto_target(xattrs) {
            match self.transport.submit(&target, Fop::Lookup { loc: loc.clone() }).await {
                Ok(mut reply) => {
                    strip_phase1(&mut reply);
                    let (iatt, _) = reply.into_entry()?;
                    if iatt.is_regular() && !iatt.has_linkfile_mode() && iatt.gfid == link.gfid {
                        self.remember(loc, &iatt, Some(hashed.clone()), target);
                        return Ok(iatt);
                    }
                    tracing::info!("Link file {} on {} names a different object on {}", loc, hashed, target);
                }
                Err(errno) if errno.is_unreachable() => return Err(errno),
                Err(errno) => {
                    tracing::info!("Link file {} on {} is stale: {} on {}", loc, hashed, errno, target);
                }
            }
        }

        match self.transport.submit(hashed, Fop::Unlink { loc: loc.clone() }).await {
            Ok(_) => tracing::info!("Removed stale link file {} on {}", loc, hashed),
            Err(errno) => tracing::warn!("Could not remove stale link file {} on {}: {}", loc, hashed, errno),
        }

        if self.searches_unhashed(layout) {
            self.lookup_everywhere(loc, Some(hashed)).await
        } else {
            self.forget(loc);
            Err(Errno::ENOENT)
        }
    }

    /// Looks `loc` up on every live node.
    ///
    /// A single data copy becomes the cached node and gets a link file on the hashed node.
    /// Several data copies are an ambiguous placement: unless exactly one of them is a
    /// migration source, the lookup fails and the paths are reported, never guessed.
    pub(crate) async fn lookup_everywhere(&self, loc: &Loc, hashed: Option<&SubvolId>) -> FopResult<Iatt> {
        let up = self.view().up();
        let results = dispatch(&self.transport, &up, &Fop::Lookup { loc: loc.clone() }, Collect::new())
            .wait()
            .await?;

        let mut copies: Vec<(SubvolId, Iatt)> = Vec::new();
        let mut failure = None;
        for (id, result) in results {
            match result.and_then(Reply::into_entry) {
                Ok((iatt, _)) if iatt.is_dir() => {
                    return self.lookup_dir(loc).await.map(|(iatt, _)| iatt);
                }
                Ok((iatt, _)) if !iatt.has_linkfile_mode() => copies.push((id, iatt)),
                Ok(_) => {}
                Err(errno) if errno.is_absent() => {}
                Err(errno) => {
                    tracing::debug!("Lookup of {} on {} failed: {}", loc, id, errno);
                    failure.get_or_insert(errno);
                }
            }
        }

        let (cached, iatt) = match copies.len() {
            0 => {
                self.forget(loc);
                return Err(failure.unwrap_or(Errno::ENOENT));
            }
            1 => copies.remove(0),
            _ => {
                let sources: Vec<usize> = copies
                    .iter()
                    .enumerate()
                    .filter(|(_, (_, iatt))| iatt.has_migration_bits())
                    .map(|(idx, _)| idx)
                    .collect();
                if let [source] = sources[..] {
                    copies.swap_remove(source)
                } else {
                    let nodes: Vec<SubvolId> = copies.into_iter().map(|(id, _)| id).collect();
                    tracing::warn!("{} has data files on {} nodes: {:?}", loc, nodes.len(), nodes);
                    self.health.record(
                        &loc.path,
                        IssueKind::AmbiguousPlacement,
                        format!("data file present on {} nodes", nodes.len()),
                        nodes,
                    );
                    return Err(Errno::EIO);
                }
            }
        };

        let mut reply = Reply::Attr(iatt);
        strip_phase1(&mut reply);
        let iatt = reply.into_attr()?;

        if let Some(hashed) = hashed
            && hashed != &cached
            && let Err(errno) = self.ensure_linkfile(loc, hashed, &cached, &iatt).await
        {
            tracing::warn!("Could not link {} on {} to {}: {}", loc, hashed, cached, errno);
        }

        tracing::debug!("Found {} on {} (hashed {:?})", loc, cached, hashed);
        self.remember(loc, &iatt, hashed.cloned(), cached);
        Ok(iatt)
    }

    /// Makes the hashed node carry a link file pointing at `target`.
    ///
    /// An existing link file is repointed if needed; an existing data file is left alone.
    pub(crate) async fn ensure_linkfile(
        &self,
        loc: &Loc,
        hashed: &SubvolId,
        target: &SubvolId,
        iatt: &Iatt,
    ) -> FopResult<()> {
        let create = Fop::Create {
            loc: loc.clone(),
            mode: LINKFILE_MODE,
            gfid: iatt.gfid,
            xattrs: linkto_xattr(target),
        };
        match self.transport.submit(hashed, create).await {
            Ok(_) => {
                tracing::debug!("Created link file {} on {} -> {}", loc, hashed, target);
                Ok(())
            }
            Err(Errno::EEXIST) => {
                let (existing, xattrs) = self
                    .transport
                    .submit(hashed, Fop::Lookup { loc: loc.clone() })
                    .await?
                    .into_entry()?;
                if !existing.has_linkfile_mode() {
                    return Err(Errno::EEXIST);
                }
                if linkto_target(&xattrs).as_ref() != Some(target) {
                    tracing::info!("Repointing link file {} on {} to {}", loc, hashed, target);
                    let fop = Fop::Setxattr {
                        loc: loc.clone(),
                        xattrs: linkto_xattr(target),
                        flags: XattrFlags::Any,
                    };
                    self.transport.submit(hashed, fop).await?;
                }
                Ok(())
            }
            Err(errno) => Err(errno),
        }
    }

    /// Looks a directory up on every node, merges its layout and heals it.
    ///
    /// The healed layout replaces whatever was cached for the directory.
    pub(crate) async fn lookup_dir(&self, loc: &Loc) -> FopResult<(Iatt, Arc<Layout>)> {
        let view = self.view();
        let results = dispatch(&self.transport, &view.up(), &Fop::Lookup { loc: loc.clone() }, Collect::new())
            .wait()
            .await?;

        let mut layout = Layout::new(view.subvols.len());
        layout.generation = view.generation;
        layout.spread_count = self.config.dir_spread_count;
        // A down node keeps the range it was last known to hold, so names hashing there
        // are reported as unreachable rather than unowned.
        let previous = self.cached_layout(loc);
        for subvol in view.subvols.iter().filter(|s| !s.is_up()) {
            layout.merge(&subvol.id, Err(Errno::ENOTCONN));
            let known = previous.as_ref().and_then(|p| p.range_of(&subvol.id));
            if let Some(entry) = layout.entries.iter_mut().find(|e| e.subvol == subvol.id) {
                entry.range = known;
            }
        }
        layout.sort_entries();

        let mut attrs = AttrMerge::new(AttrMode::Directory);
        let mut first: Option<SubvolId> = None;
        for (id, result) in results {
            match result.and_then(Reply::into_entry) {
                Ok((iatt, xattrs)) if iatt.is_dir() => {
                    attrs.merge_iatt(&id, &iatt);
                    layout.merge(&id, Ok(xattrs.get(LAYOUT_XATTR).map(Vec::as_slice)));
                    first.get_or_insert(id);
                }
                Ok(_) => {
                    tracing::warn!("{} is not a directory on {}", loc, id);
                    layout.merge(&id, Err(Errno::ENOTDIR));
                }
                Err(errno) => {
                    if errno.is_absent() {
                        attrs.errors.record_err(errno);
                    }
                    layout.merge(&id, Err(errno));
                }
            }
        }

        let iatt = match (attrs.result(), first) {
            (Ok(iatt), Some(first)) => {
                self.inodes.insert(
                    loc.clone(),
                    InodeCtx {
                        gfid: iatt.gfid,
                        ia_type: IaType::Directory,
                        hashed: None,
                        cached: first,
                    },
                );
                iatt
            }
            (result, _) => {
                self.forget(loc);
                return Err(result.err().unwrap_or(Errno::ENOENT));
            }
        };

        let template = DirTemplate {
            gfid: iatt.gfid,
            mode: iatt.mode,
        };
        let (layout, outcome) = match self
            .healer
            .heal(loc, layout, &view, template, self.config.dir_spread_count)
            .await
        {
            Ok(healed) => healed,
            Err(errno) => {
                self.layouts.remove(loc);
                return Err(errno);
            }
        };
        if outcome != HealOutcome::Clean {
            tracing::debug!("Lookup of {} healed: {:?}", loc, outcome);
        }

        let layout = Arc::new(layout);
        self.layouts.insert(loc.clone(), layout.clone());
        Ok((iatt, layout))
    }
}
