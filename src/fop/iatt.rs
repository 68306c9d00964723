use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{LINKFILE_MODE, PERM_MASK, S_ISGID, S_ISVTX};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IaType {
    Regular,
    Directory,
    Symlink,
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

impl Timespec {
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: now.as_secs() as i64,
            nsec: now.subsec_nanos(),
        }
    }
}

/// Attributes of an object as returned by a subvolume.
///
/// `mode` holds permission and special bits only (`PERM_MASK`); the object type
/// lives in `ia_type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Iatt {
    pub gfid: Uuid,
    pub ia_type: IaType,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blocks: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
}

impl Iatt {
    pub fn new(gfid: Uuid, ia_type: IaType, mode: u32) -> Self {
        let now = Timespec::now();
        Self {
            gfid,
            ia_type,
            mode: mode & PERM_MASK,
            nlink: if ia_type == IaType::Directory { 2 } else { 1 },
            uid: 0,
            gid: 0,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    pub fn is_regular(&self) -> bool {
        self.ia_type == IaType::Regular
    }

    pub fn is_dir(&self) -> bool {
        self.ia_type == IaType::Directory
    }

    /// Regular file whose permission bits are exactly the link-file mode.
    pub fn has_linkfile_mode(&self) -> bool {
        self.is_regular() && (self.mode & PERM_MASK) == LINKFILE_MODE
    }

    /// Sticky plus set-gid on a regular file: data is being copied away.
    pub fn has_migration_bits(&self) -> bool {
        self.is_regular() && (self.mode & S_ISVTX) != 0 && (self.mode & S_ISGID) != 0
    }
}
