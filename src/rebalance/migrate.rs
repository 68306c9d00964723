//! Moving one file to another node.
//!
//! The source stays authoritative until the very last step: it is marked as being copied
//! (Phase 1), its data and xattrs are copied to a target that looks like a link file until
//! the copy is complete, and only then does a single `setattr`, guarded on the source's
//! size and timestamps, turn it into a link file (Phase 2). A write acknowledged after the
//! copy began fails the guard, so it is either copied on the retry or lands on the target.

use std::sync::atomic::Ordering;
use thiserror::Error;

use super::types::TaskOutcome;
use crate::error::Errno;
use crate::fop::{
    AttrGuard, Fop, Iatt, LINKFILE_MODE, LINKTO_XATTR, Loc, Reply, S_ISGID, S_ISVTX, SetAttr, XattrFlags,
    Xattrs, is_internal_xattr,
};
use crate::migration::linkto_xattr;
use crate::router::Distribute;
use crate::topology::types::SubvolId;

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("nothing to migrate: {0}")]
    Nothing(String),
    #[error("{0} changed while it was being copied")]
    SourceChanged(Loc),
    #[error("{target} has {avail} bytes available, {needed} needed")]
    NoSpace {
        target: SubvolId,
        avail: u64,
        needed: u64,
    },
    #[error("{step} failed: {errno}")]
    Step { step: &'static str, errno: Errno },
}

impl MigrateError {
    fn outcome(self) -> TaskOutcome {
        match self {
            MigrateError::Nothing(reason) => TaskOutcome::Skipped(reason),
            other => TaskOutcome::Retry(other.to_string()),
        }
    }
}

fn at(step: &'static str) -> impl FnOnce(Errno) -> MigrateError {
    move |errno| MigrateError::Step { step, errno }
}

/// Where a file is and where it should go.
#[derive(Debug, Clone)]
struct Move {
    source: SubvolId,
    target: SubvolId,
    hashed: SubvolId,
}

/// Migrates `loc` to the node it belongs on, if it is not there already.
pub async fn migrate_file(volume: &Distribute, loc: &Loc) -> TaskOutcome {
    let plan = match plan(volume, loc).await {
        Ok(plan) => plan,
        Err(e) => return e.outcome(),
    };

    match copy_and_switch(volume, loc, &plan).await {
        Ok(bytes) => {
            volume.forget(loc);
            volume.queue.stats.files_migrated.fetch_add(1, Ordering::Relaxed);
            volume.queue.stats.bytes_moved.fetch_add(bytes, Ordering::Relaxed);
            tracing::info!("Migrated {} from {} to {} ({} bytes)", loc, plan.source, plan.target, bytes);
            TaskOutcome::Done
        }
        Err(e) => {
            tracing::warn!("Migration of {} from {} to {} failed: {}", loc, plan.source, plan.target, e);
            e.outcome()
        }
    }
}

async fn plan(volume: &Distribute, loc: &Loc) -> Result<Move, MigrateError> {
    volume.forget(loc);
    let iatt = match volume.lookup(loc).await {
        Ok(iatt) => iatt,
        Err(errno) if errno.is_absent() => return Err(MigrateError::Nothing(format!("{} vanished", loc))),
        Err(errno) => return Err(at("lookup")(errno)),
    };
    if !iatt.is_regular() {
        return Err(MigrateError::Nothing(format!("{} is not a regular file", loc)));
    }

    let ctx = volume.inode(loc).ok_or_else(|| at("lookup")(Errno::ENOENT))?;
    let hashed = ctx.hashed.ok_or_else(|| at("lookup")(Errno::EINVAL))?;
    let source = ctx.cached;

    let view = volume.view();
    let target = if view.is_decommissioned(&hashed) || volume.registry.is_filled(&hashed) {
        volume
            .registry
            .free_disk_available(&source)
            .ok_or_else(|| MigrateError::Nothing(format!("no node has room for {}", loc)))?
    } else {
        hashed.clone()
    };

    if target == source {
        return Err(MigrateError::Nothing(format!("{} already on {}", loc, source)));
    }
    Ok(Move {
        source,
        target,
        hashed,
    })
}

async fn submit(
    volume: &Distribute,
    subvol: &SubvolId,
    fop: Fop,
    step: &'static str,
) -> Result<Reply, MigrateError> {
    volume.transport.submit(subvol, fop).await.map_err(at(step))
}

async fn copy_and_switch(volume: &Distribute, loc: &Loc, plan: &Move) -> Result<u64, MigrateError> {
    let Move { source, target, hashed } = plan;

    let (src, _) = submit(volume, source, Fop::Lookup { loc: loc.clone() }, "source lookup")
        .await?
        .into_entry()
        .map_err(at("source lookup"))?;
    if src.has_linkfile_mode() {
        return Err(MigrateError::Nothing(format!("{} on {} is already a link file", loc, source)));
    }

    let space = submit(volume, target, Fop::Statfs { loc: loc.clone() }, "target statfs")
        .await?
        .into_statfs()
        .map_err(at("target statfs"))?;
    if space.avail_bytes < src.size {
        return Err(MigrateError::NoSpace {
            target: target.clone(),
            avail: space.avail_bytes,
            needed: src.size,
        });
    }

    // A previous attempt may have left the markers behind.
    let orig_mode = if src.has_migration_bits() {
        src.mode & !(S_ISVTX | S_ISGID)
    } else {
        src.mode
    };

    create_target(volume, loc, source, target, &src).await?;

    let snapshot = match mark_copying(volume, loc, source, target, orig_mode).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            revert_target(volume, loc, plan).await;
            return Err(e);
        }
    };

    if let Err(e) = copy_data(volume, loc, plan, &snapshot, orig_mode).await {
        revert_target(volume, loc, plan).await;
        return Err(e);
    }

    // The switch: from here on readers of the source are redirected. The source node
    // refuses it if anything was written after the snapshot the copy was taken from.
    let flip = Fop::Setattr {
        loc: loc.clone(),
        attr: SetAttr::mode(LINKFILE_MODE).guarded(AttrGuard::of(&snapshot)),
    };
    match volume.transport.submit(source, flip).await {
        Ok(_) => {}
        Err(Errno::EAGAIN) => {
            revert_target(volume, loc, plan).await;
            return Err(MigrateError::SourceChanged(loc.clone()));
        }
        Err(errno) => {
            revert_target(volume, loc, plan).await;
            return Err(at("phase 2 switch")(errno));
        }
    }

    if let Err(e) = submit(volume, source, Fop::Truncate { loc: loc.clone(), size: 0 }, "source truncate").await {
        tracing::warn!("{}", e);
    }

    if target == hashed {
        remove_source(volume, loc, source).await;
    } else if source != hashed {
        let mut iatt = src.clone();
        iatt.mode = orig_mode;
        match volume.ensure_linkfile(loc, hashed, target, &iatt).await {
            Ok(()) => remove_source(volume, loc, source).await,
            Err(errno) => tracing::warn!(
                "Could not repoint link file {} on {} to {}: {}; keeping {} as a link file",
                loc,
                hashed,
                target,
                errno,
                source
            ),
        }
    }

    Ok(snapshot.size)
}

/// Creates the target in link-file form, so lookups ignore it while it fills up.
async fn create_target(
    volume: &Distribute,
    loc: &Loc,
    source: &SubvolId,
    target: &SubvolId,
    src: &Iatt,
) -> Result<(), MigrateError> {
    let create = Fop::Create {
        loc: loc.clone(),
        mode: LINKFILE_MODE,
        gfid: src.gfid,
        xattrs: linkto_xattr(source),
    };
    match volume.transport.submit(target, create).await {
        Ok(_) => Ok(()),
        Err(Errno::EEXIST) => {
            let (existing, _) = submit(volume, target, Fop::Lookup { loc: loc.clone() }, "target lookup")
                .await?
                .into_entry()
                .map_err(at("target lookup"))?;
            if !existing.has_linkfile_mode() || existing.gfid != src.gfid {
                return Err(at("create target")(Errno::EEXIST));
            }
            submit(volume, target, Fop::Truncate { loc: loc.clone(), size: 0 }, "target truncate").await?;
            let relink = Fop::Setxattr {
                loc: loc.clone(),
                xattrs: linkto_xattr(source),
                flags: XattrFlags::Any,
            };
            submit(volume, target, relink, "target relink").await?;
            Ok(())
        }
        Err(errno) => Err(at("create target")(errno)),
    }
}

/// Phase 1: markers plus the link-target xattr on the source. Returns the source
/// attributes that guard the Phase 2 switch.
async fn mark_copying(
    volume: &Distribute,
    loc: &Loc,
    source: &SubvolId,
    target: &SubvolId,
    orig_mode: u32,
) -> Result<Iatt, MigrateError> {
    let mark = Fop::Setxattr {
        loc: loc.clone(),
        xattrs: linkto_xattr(target),
        flags: XattrFlags::Any,
    };
    submit(volume, source, mark, "phase 1 linkto").await?;

    let bits = Fop::Setattr {
        loc: loc.clone(),
        attr: SetAttr::mode(orig_mode | S_ISVTX | S_ISGID),
    };
    let (_, post) = submit(volume, source, bits, "phase 1 mode")
        .await?
        .into_prepost()
        .map_err(at("phase 1 mode"))?;
    Ok(post)
}

async fn copy_data(
    volume: &Distribute,
    loc: &Loc,
    plan: &Move,
    snapshot: &Iatt,
    orig_mode: u32,
) -> Result<(), MigrateError> {
    let chunk = volume.config.migration_chunk_size;
    let mut offset = 0;
    while offset < snapshot.size {
        let read = Fop::Readv {
            loc: loc.clone(),
            offset,
            size: chunk.min(snapshot.size - offset),
        };
        let (data, _) = submit(volume, &plan.source, read, "read")
            .await?
            .into_read()
            .map_err(at("read"))?;
        if data.is_empty() {
            break;
        }
        let len = data.len() as u64;
        let write = Fop::Writev {
            loc: loc.clone(),
            offset,
            data,
        };
        submit(volume, &plan.target, write, "write").await?;
        offset += len;
    }

    // Read after Phase 1, so any later change moves ctime and fails the switch.
    let getxattr = Fop::Getxattr {
        loc: loc.clone(),
        name: None,
    };
    let (_, xattrs) = submit(volume, &plan.source, getxattr, "xattr read")
        .await?
        .into_entry()
        .map_err(at("xattr read"))?;
    let user: Xattrs = xattrs
        .iter()
        .filter(|(key, _)| !is_internal_xattr(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    if !user.is_empty() {
        let fop = Fop::Setxattr {
            loc: loc.clone(),
            xattrs: user,
            flags: XattrFlags::Any,
        };
        submit(volume, &plan.target, fop, "xattr copy").await?;
    }

    let attr = SetAttr {
        mode: Some(orig_mode),
        uid: Some(snapshot.uid),
        gid: Some(snapshot.gid),
        atime: Some(snapshot.atime),
        mtime: Some(snapshot.mtime),
        expect: None,
    };
    submit(volume, &plan.target, Fop::Setattr { loc: loc.clone(), attr }, "target setattr").await?;

    let unlink = Fop::Removexattr {
        loc: loc.clone(),
        name: LINKTO_XATTR.to_string(),
    };
    match volume.transport.submit(&plan.target, unlink).await {
        Ok(_) | Err(Errno::ENODATA) => Ok(()),
        Err(errno) => Err(at("target linkto removal")(errno)),
    }
}

/// Undoes the target after a failed attempt. On the hashed node it goes back to being
/// the link file pointing at the source; anywhere else it is removed.
async fn revert_target(volume: &Distribute, loc: &Loc, plan: &Move) {
    let result = if plan.target == plan.hashed {
        let steps = [
            Fop::Setattr {
                loc: loc.clone(),
                attr: SetAttr::mode(LINKFILE_MODE),
            },
            Fop::Truncate {
                loc: loc.clone(),
                size: 0,
            },
            Fop::Setxattr {
                loc: loc.clone(),
                xattrs: linkto_xattr(&plan.source),
                flags: XattrFlags::Any,
            },
        ];
        let mut result = Ok(());
        for fop in steps {
            if let Err(errno) = volume.transport.submit(&plan.target, fop).await {
                result = Err(errno);
                break;
            }
        }
        result
    } else {
        volume
            .transport
            .submit(&plan.target, Fop::Unlink { loc: loc.clone() })
            .await
            .map(|_| ())
    };

    if let Err(errno) = result {
        tracing::warn!("Could not revert {} on {}: {}", loc, plan.target, errno);
    }
}

async fn remove_source(volume: &Distribute, loc: &Loc, source: &SubvolId) {
    if let Err(errno) = volume.transport.submit(source, Fop::Unlink { loc: loc.clone() }).await {
        tracing::warn!("Could not remove migrated {} on {}: {}", loc, source, errno);
    }
}
