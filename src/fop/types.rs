use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::iatt::{Iatt, Timespec};
use crate::error::{Errno, FopResult};

pub type Xattrs = BTreeMap<String, Vec<u8>>;

/// Absolute, normalised path of an object (`/`, `/d`, `/d/f`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Loc {
    pub path: String,
}

impl Loc {
    pub fn new(path: &str) -> Self {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        Self {
            path: format!("/{}", parts.join("/")),
        }
    }

    pub fn root() -> Self {
        Self {
            path: "/".to_string(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    /// Last path component; empty for the root.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or("")
    }

    pub fn parent(&self) -> Option<Loc> {
        if self.is_root() {
            return None;
        }
        match self.path.rfind('/') {
            Some(0) => Some(Loc::root()),
            Some(idx) => Some(Loc {
                path: self.path[..idx].to_string(),
            }),
            None => None,
        }
    }

    pub fn child(&self, name: &str) -> Loc {
        if self.is_root() {
            Loc::new(&format!("/{}", name))
        } else {
            Loc::new(&format!("{}/{}", self.path, name))
        }
    }
}

impl std::fmt::Display for Loc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path)
    }
}

/// Attribute changes requested by `setattr`; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<Timespec>,
    pub mtime: Option<Timespec>,
    /// When set, the node applies the change only if the object still matches,
    /// and fails with `EAGAIN` otherwise. Checked and applied in one step.
    pub expect: Option<AttrGuard>,
}

/// The attributes an object must still have for a guarded `setattr` to apply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttrGuard {
    pub size: u64,
    pub mtime: Timespec,
    pub ctime: Timespec,
}

impl AttrGuard {
    pub fn of(iatt: &Iatt) -> Self {
        Self {
            size: iatt.size,
            mtime: iatt.mtime,
            ctime: iatt.ctime,
        }
    }

    pub fn matches(&self, iatt: &Iatt) -> bool {
        self.size == iatt.size && self.mtime == iatt.mtime && self.ctime == iatt.ctime
    }
}

impl SetAttr {
    pub fn mode(mode: u32) -> Self {
        Self {
            mode: Some(mode),
            ..Default::default()
        }
    }

    pub fn guarded(mut self, expect: AttrGuard) -> Self {
        self.expect = Some(expect);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
    Unlock,
}

/// POSIX byte-range lock request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Flock {
    pub kind: LockKind,
    pub start: u64,
    pub len: u64,
    pub owner: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum XattrFlags {
    #[default]
    Any,
    Create,
    Replace,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub iatt: Iatt,
}

/// Capacity figures, in bytes and inodes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Statvfs {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub avail_bytes: u64,
    pub files: u64,
    pub files_free: u64,
}

impl Statvfs {
    pub fn avail_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.avail_bytes as f64 / self.total_bytes as f64) * 100.0
    }
}

/// One filesystem operation as sent to a single subvolume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Fop {
    Lookup { loc: Loc },
    Stat { loc: Loc },
    Readv { loc: Loc, offset: u64, size: u64 },
    Writev { loc: Loc, offset: u64, data: Vec<u8> },
    Open { loc: Loc, flags: u32 },
    Flush { loc: Loc },
    Fsync { loc: Loc, datasync: bool },
    Access { loc: Loc, mask: u32 },
    Lk { loc: Loc, lock: Flock },
    Truncate { loc: Loc, size: u64 },
    Setattr { loc: Loc, attr: SetAttr },
    Getxattr { loc: Loc, name: Option<String> },
    Setxattr { loc: Loc, xattrs: Xattrs, flags: XattrFlags },
    Removexattr { loc: Loc, name: String },
    Mkdir { loc: Loc, mode: u32, gfid: Uuid, xattrs: Xattrs },
    Create { loc: Loc, mode: u32, gfid: Uuid, xattrs: Xattrs },
    Unlink { loc: Loc },
    Rmdir { loc: Loc },
    Rename { old: Loc, new: Loc },
    Readdir { loc: Loc },
    Statfs { loc: Loc },
}

impl Fop {
    pub fn loc(&self) -> &Loc {
        match self {
            Fop::Lookup { loc }
            | Fop::Stat { loc }
            | Fop::Readv { loc, .. }
            | Fop::Writev { loc, .. }
            | Fop::Open { loc, .. }
            | Fop::Flush { loc }
            | Fop::Fsync { loc, .. }
            | Fop::Access { loc, .. }
            | Fop::Lk { loc, .. }
            | Fop::Truncate { loc, .. }
            | Fop::Setattr { loc, .. }
            | Fop::Getxattr { loc, .. }
            | Fop::Setxattr { loc, .. }
            | Fop::Removexattr { loc, .. }
            | Fop::Mkdir { loc, .. }
            | Fop::Create { loc, .. }
            | Fop::Unlink { loc }
            | Fop::Rmdir { loc }
            | Fop::Readdir { loc }
            | Fop::Statfs { loc } => loc,
            Fop::Rename { old, .. } => old,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Fop::Lookup { .. } => "lookup",
            Fop::Stat { .. } => "stat",
            Fop::Readv { .. } => "readv",
            Fop::Writev { .. } => "writev",
            Fop::Open { .. } => "open",
            Fop::Flush { .. } => "flush",
            Fop::Fsync { .. } => "fsync",
            Fop::Access { .. } => "access",
            Fop::Lk { .. } => "lk",
            Fop::Truncate { .. } => "truncate",
            Fop::Setattr { .. } => "setattr",
            Fop::Getxattr { .. } => "getxattr",
            Fop::Setxattr { .. } => "setxattr",
            Fop::Removexattr { .. } => "removexattr",
            Fop::Mkdir { .. } => "mkdir",
            Fop::Create { .. } => "create",
            Fop::Unlink { .. } => "unlink",
            Fop::Rmdir { .. } => "rmdir",
            Fop::Rename { .. } => "rename",
            Fop::Readdir { .. } => "readdir",
            Fop::Statfs { .. } => "statfs",
        }
    }
}

/// A single subvolume's answer to a `Fop`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Reply {
    Empty,
    Entry { iatt: Iatt, xattrs: Xattrs },
    Attr(Iatt),
    PrePost { pre: Iatt, post: Iatt },
    Read { data: Vec<u8>, iatt: Iatt },
    Lock { lock: Flock, iatt: Iatt },
    Entries(Vec<DirEntry>),
    Statfs(Statvfs),
}

impl Reply {
    /// The attributes describing the object after the operation, if the reply carries any.
    pub fn iatt(&self) -> Option<&Iatt> {
        match self {
            Reply::Entry { iatt, .. }
            | Reply::Attr(iatt)
            | Reply::Read { iatt, .. }
            | Reply::Lock { iatt, .. } => Some(iatt),
            Reply::PrePost { post, .. } => Some(post),
            _ => None,
        }
    }

    /// Mutable access to every attribute block in the reply.
    pub fn iatts_mut(&mut self) -> Vec<&mut Iatt> {
        match self {
            Reply::Entry { iatt, .. }
            | Reply::Attr(iatt)
            | Reply::Read { iatt, .. }
            | Reply::Lock { iatt, .. } => vec![iatt],
            Reply::PrePost { pre, post } => vec![pre, post],
            Reply::Entries(entries) => entries.iter_mut().map(|e| &mut e.iatt).collect(),
            _ => vec![],
        }
    }

    pub fn into_entry(self) -> FopResult<(Iatt, Xattrs)> {
        match self {
            Reply::Entry { iatt, xattrs } => Ok((iatt, xattrs)),
            _ => Err(Errno::EIO),
        }
    }

    pub fn into_attr(self) -> FopResult<Iatt> {
        match self {
            Reply::Attr(iatt) | Reply::Entry { iatt, .. } => Ok(iatt),
            Reply::PrePost { post, .. } => Ok(post),
            _ => Err(Errno::EIO),
        }
    }

    pub fn into_prepost(self) -> FopResult<(Iatt, Iatt)> {
        match self {
            Reply::PrePost { pre, post } => Ok((pre, post)),
            _ => Err(Errno::EIO),
        }
    }

    pub fn into_read(self) -> FopResult<(Vec<u8>, Iatt)> {
        match self {
            Reply::Read { data, iatt } => Ok((data, iatt)),
            _ => Err(Errno::EIO),
        }
    }

    pub fn into_xattrs(self) -> FopResult<Xattrs> {
        match self {
            Reply::Entry { xattrs, .. } => Ok(xattrs),
            _ => Err(Errno::EIO),
        }
    }

    pub fn into_entries(self) -> FopResult<Vec<DirEntry>> {
        match self {
            Reply::Entries(entries) => Ok(entries),
            _ => Err(Errno::EIO),
        }
    }

    pub fn into_statfs(self) -> FopResult<Statvfs> {
        match self {
            Reply::Statfs(statfs) => Ok(statfs),
            _ => Err(Errno::EIO),
        }
    }

    pub fn into_lock(self) -> FopResult<Flock> {
        match self {
            Reply::Lock { lock, .. } => Ok(lock),
            _ => Err(Errno::EIO),
        }
    }
}
