use crate::fop::{Fop, Iatt};
use crate::topology::types::SubvolId;

/// An operation is tried on the cached node and then, at most, once on the target.
pub const MAX_ATTEMPTS: u8 = 2;

/// Migration state of a file as seen in the attributes a node returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    /// Not being migrated.
    Idle,
    /// Data is being copied away; the source still serves every operation.
    Copying,
    /// The source is a link file naming the node that now holds the data.
    Moved,
}

impl MigrationPhase {
    pub fn detect(iatt: &Iatt) -> Self {
        if iatt.has_linkfile_mode() {
            MigrationPhase::Moved
        } else if iatt.has_migration_bits() {
            MigrationPhase::Copying
        } else {
            MigrationPhase::Idle
        }
    }
}

/// Names the retry path an operation resumes on after a redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    Stat,
    Read,
    Write,
    Open,
    Flush,
    /// Also replays on the target during a copy and merges both pre/post pairs.
    Fsync,
    Lock,
    Access,
    Truncate,
    Setattr,
    Getxattr,
    Setxattr,
    Removexattr,
}

impl Continuation {
    /// Continuation for a data-path operation; `None` for namespace operations,
    /// which are never redirected.
    pub fn of(fop: &Fop) -> Option<Self> {
        Some(match fop {
            Fop::Lookup { .. } | Fop::Stat { .. } => Continuation::Stat,
            Fop::Readv { .. } => Continuation::Read,
            Fop::Writev { .. } => Continuation::Write,
            Fop::Open { .. } => Continuation::Open,
            Fop::Flush { .. } => Continuation::Flush,
            Fop::Fsync { .. } => Continuation::Fsync,
            Fop::Lk { .. } => Continuation::Lock,
            Fop::Access { .. } => Continuation::Access,
            Fop::Truncate { .. } => Continuation::Truncate,
            Fop::Setattr { .. } => Continuation::Setattr,
            Fop::Getxattr { .. } => Continuation::Getxattr,
            Fop::Setxattr { .. } => Continuation::Setxattr,
            Fop::Removexattr { .. } => Continuation::Removexattr,
            Fop::Mkdir { .. }
            | Fop::Create { .. }
            | Fop::Unlink { .. }
            | Fop::Rmdir { .. }
            | Fop::Rename { .. }
            | Fop::Readdir { .. }
            | Fop::Statfs { .. } => return None,
        })
    }
}

/// Everything needed to replay one data operation on the node a file moved to.
#[derive(Debug, Clone)]
pub struct MigrationDescriptor {
    /// Node the operation was first sent to.
    pub from: SubvolId,
    /// Target learned from an open-file hint or from resolving the link file.
    pub to: Option<SubvolId>,
    /// 1 for the first submission, bumped once per replay; never exceeds `MAX_ATTEMPTS`.
    pub attempt: u8,
    /// How the replayed reply is handled once it arrives.
    pub continuation: Continuation,
    /// The original request, replayed unchanged (offsets, lengths and flags included).
    pub fop: Fop,
}

impl MigrationDescriptor {
    pub fn new(from: SubvolId, fop: Fop, hint: Option<SubvolId>) -> Option<Self> {
        let continuation = Continuation::of(&fop)?;
        Some(Self {
            from,
            to: hint,
            attempt: 1,
            continuation,
            fop,
        })
    }

    pub fn can_retry(&self) -> bool {
        self.attempt < MAX_ATTEMPTS
    }
}

/// Result of a migration-aware submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Handoff<T> {
    pub result: T,
    /// The node whose answer is being returned.
    pub served_by: SubvolId,
    /// Attempts made, 1 or 2.
    pub attempts: u8,
    /// Node the data is moving or has moved to, when it was learned.
    pub target: Option<SubvolId>,
}
