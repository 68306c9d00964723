//! Self-Heal Module
//!
//! Repairs the placement metadata of directories. A directory lookup merges every node's
//! persisted range into a `Layout`; when that layout shows anomalies, or the directory is
//! missing on a live node, the healer decides what to do:
//!
//! ## Heal Paths
//! - **New**: No node carries a usable range yet. A fresh layout is computed over the live,
//!   non-decommissioned nodes and published, creating the directory where it is absent.
//! - **Existing**: Some ranges are usable. Non-overlapping ranges are kept as they are; only
//!   holes and demoted overlaps are reassigned, so already-placed entries stay put.
//! - **Restore**: Metadata is unreadable everywhere (corrupt), or an `rmdir` removed the
//!   directory from only some nodes. The directory and its ranges are re-published.
//!
//! ## Failure Policy
//! - Down nodes are skipped. Their slices are repaired once they come back and report.
//! - An up node failing lookup with an unexplained error blocks healing of that directory.
//!   The failure is recorded in the `HealthRegistry` for an operator instead of being masked.

pub mod directory;
pub mod health;

pub use directory::{DirHealer, DirTemplate, HealOutcome, fresh_layout, layout_xattr, repair_ranges};
pub use health::{HealthIssue, HealthRegistry, HealthReport, IssueKind};

#[cfg(test)]
mod tests;
