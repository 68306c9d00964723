//! Migration Module
//!
//! Makes file migration invisible to data operations. The background mover (see
//! `rebalance`) marks a file it is moving in two steps, and every data operation checks
//! the attributes it gets back for those marks.
//!
//! ## Phases
//! - **Copying (Phase 1)**: sticky and set-gid bits on a regular file. The source still
//!   serves everything; the bits are stripped before results reach the caller.
//! - **Moved (Phase 2)**: the source has become a link file, mode exactly sticky, whose
//!   `trusted.dht.linkto` xattr names the node holding the data.
//!
//! ## Retry Rule
//! An operation answered with `ENOENT` or a link file is replayed, unchanged, on the
//! resolved target. It is replayed at most once: the attempt counter lives in the
//! `MigrationDescriptor` and a second redirect signal is returned to the caller as is.

pub mod check;
pub mod retry;
pub mod types;

pub use check::{is_copying, linkto_target, linkto_xattr, needs_redirect, strip_phase1};
pub use retry::{TargetResolver, submit};
pub use types::*;
