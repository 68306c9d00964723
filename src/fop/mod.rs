//! Filesystem Operation Vocabulary
//!
//! The request and reply types every layer speaks: the router builds `Fop`s, the
//! aggregator fans them out, the transport carries them to a subvolume, and the
//! subvolume answers with a `Reply`.
//!
//! Also defines the reserved extended-attribute keys and the mode bits the
//! distribution layer uses to persist its own metadata on objects.

pub mod iatt;
pub mod types;

pub use iatt::*;
pub use types::*;

use uuid::Uuid;

/// Identity of the volume root, the same on every subvolume.
pub const ROOT_GFID: Uuid = Uuid::from_u128(1);

/// Persisted hash range of a directory on one subvolume.
pub const LAYOUT_XATTR: &str = "trusted.dht.layout";
/// Name of the subvolume holding the real data for a link file.
pub const LINKTO_XATTR: &str = "trusted.dht.linkto";
/// Setting this key on a directory recomputes its layout over the current topology.
pub const FIX_LAYOUT_KEY: &str = "trusted.distribute.fix.layout";
/// Setting this key on a file queues it for migration to its hashed subvolume.
pub const MIGRATE_DATA_KEY: &str = "distribute.migrate-data";
/// Virtual key reporting which subvolume(s) hold an object.
pub const PATHINFO_KEY: &str = "trusted.dht.pathinfo";
pub const PATHINFO_HEADER: &str = "DISTRIBUTE:";

pub const S_ISUID: u32 = 0o4000;
pub const S_ISGID: u32 = 0o2000;
pub const S_ISVTX: u32 = 0o1000;
pub const PERM_MASK: u32 = 0o7777;

/// Mode of a link file: sticky bit and nothing else.
pub const LINKFILE_MODE: u32 = S_ISVTX;

/// Keys internal to the distribution layer, never copied between objects by the mover.
pub fn is_internal_xattr(key: &str) -> bool {
    key == LAYOUT_XATTR || key == LINKTO_XATTR
}
