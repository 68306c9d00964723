use super::distribute::{Distribute, FileHandle};
use crate::aggregator::{AttrMerge, AttrMode, PrePostMerge, dispatch};
use crate::error::{Errno, FopResult};
use crate::fop::{Flock, Fop, IaType, Iatt, Loc, SetAttr};

impl Distribute {
    pub async fn stat(&self, loc: &Loc) -> FopResult<Iatt> {
        let ctx = self.resolve(loc).await?;
        if ctx.ia_type == IaType::Directory {
            let up = self.view().up();
            return dispatch(&self.transport, &up, &Fop::Stat { loc: loc.clone() }, AttrMerge::new(AttrMode::Directory))
                .wait()
                .await?;
        }
        self.data_op(loc, None, Fop::Stat { loc: loc.clone() }).await?.into_attr()
    }

    pub async fn fstat(&self, fh: &FileHandle) -> FopResult<Iatt> {
        self.data_op(&fh.loc, Some(fh), Fop::Stat { loc: fh.loc.clone() })
            .await?
            .into_attr()
    }

    pub async fn open(&self, loc: &Loc, flags: u32) -> FopResult<FileHandle> {
        let ctx = self.resolve(loc).await?;
        let fh = FileHandle::new(loc.clone(), ctx.gfid, flags, ctx.cached);
        if ctx.ia_type != IaType::Directory {
            self.data_op(loc, Some(&fh), Fop::Open { loc: loc.clone(), flags })
                .await?;
        }
        Ok(fh)
    }

    pub async fn readv(&self, fh: &FileHandle, offset: u64, size: u64) -> FopResult<(Vec<u8>, Iatt)> {
        let fop = Fop::Readv {
            loc: fh.loc.clone(),
            offset,
            size,
        };
        self.data_op(&fh.loc, Some(fh), fop).await?.into_read()
    }

    pub async fn writev(&self, fh: &FileHandle, offset: u64, data: Vec<u8>) -> FopResult<(Iatt, Iatt)> {
        let fop = Fop::Writev {
            loc: fh.loc.clone(),
            offset,
            data,
        };
        self.data_op(&fh.loc, Some(fh), fop).await?.into_prepost()
    }

    pub async fn flush(&self, fh: &FileHandle) -> FopResult<()> {
        self.data_op(&fh.loc, Some(fh), Fop::Flush { loc: fh.loc.clone() })
            .await
            .map(|_| ())
    }

    /// During a copy the pre/post attributes of both nodes are merged.
    pub async fn fsync(&self, fh: &FileHandle, datasync: bool) -> FopResult<(Iatt, Iatt)> {
        let fop = Fop::Fsync {
            loc: fh.loc.clone(),
            datasync,
        };
        self.data_op(&fh.loc, Some(fh), fop).await?.into_prepost()
    }

    pub async fn lk(&self, fh: &FileHandle, lock: Flock) -> FopResult<Flock> {
        let fop = Fop::Lk {
            loc: fh.loc.clone(),
            lock,
        };
        self.data_op(&fh.loc, Some(fh), fop).await?.into_lock()
    }

    pub async fn access(&self, loc: &Loc, mask: u32) -> FopResult<()> {
        let ctx = self.resolve(loc).await?;
        let fop = Fop::Access { loc: loc.clone(), mask };
        if ctx.ia_type == IaType::Directory {
            return self.transport.submit(&ctx.cached, fop).await.map(|_| ());
        }
        self.data_op(loc, None, fop).await.map(|_| ())
    }

    pub async fn truncate(&self, loc: &Loc, size: u64) -> FopResult<(Iatt, Iatt)> {
        let ctx = self.resolve(loc).await?;
        if ctx.ia_type == IaType::Directory {
            return Err(Errno::EISDIR);
        }
        self.data_op(loc, None, Fop::Truncate { loc: loc.clone(), size })
            .await?
            .into_prepost()
    }

    /// Files follow a migration like any data operation; directories are changed on
    /// every live node.
    pub async fn setattr(&self, loc: &Loc, attr: SetAttr) -> FopResult<(Iatt, Iatt)> {
        let ctx = self.resolve(loc).await?;
        let fop = Fop::Setattr { loc: loc.clone(), attr };
        if ctx.ia_type == IaType::Directory {
            let up = self.view().up();
            return dispatch(&self.transport, &up, &fop, PrePostMerge::new(AttrMode::Directory))
                .wait()
                .await?;
        }
        self.data_op(loc, None, fop).await?.into_prepost()
    }
}
