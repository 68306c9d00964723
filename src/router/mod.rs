//! Operation Router
//!
//! `Distribute` is the volume: every filesystem entry point picks its target nodes from
//! directory layouts, fans out through the aggregator when more than one node is
//! involved, and sends data operations through the migration handoff.
//!
//! ## Placement
//! - **Hashed node**: the node whose slice of the parent's layout holds the hash of the name.
//! - **Cached node**: the node actually holding the data. It differs from the hashed node
//!   after a migration, a rename, or a create on a full node; the hashed node then carries
//!   a link file naming the cached node.
//!
//! ## Entry Points
//! - **Namespace** (`namespace.rs`): mkdir, create, unlink, rmdir, rename, readdir.
//! - **Lookup** (`lookup.rs`): hashed-node lookup, link-file following, lookup-everywhere
//!   and directory lookup with self-heal.
//! - **Data** (`data.rs`): stat, open, read, write, flush, fsync, lk, access, truncate, setattr.
//! - **Xattrs** (`xattr.rs`): extended attributes plus the virtual keys for path info,
//!   fix-layout and migration.
//! - **Admin** (`admin.rs`): HTTP endpoints for fix-layout, rebalance, health and topology.

pub mod admin;
pub mod data;
pub mod distribute;
pub mod lookup;
pub mod namespace;
pub mod xattr;

pub use admin::admin_router;
pub use distribute::{Distribute, FileHandle, InodeCtx};
