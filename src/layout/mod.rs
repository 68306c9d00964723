//! Layout Model
//!
//! A layout assigns contiguous ranges of the 32-bit hash space to subvolumes for one
//! directory. The name of every entry in the directory is hashed and the range holding
//! that hash names the entry's *hashed* subvolume.
//!
//! ## Core Concepts
//! - **Computation**: Fresh layouts split the space evenly over the eligible nodes, ordered by id.
//! - **Merging**: Directory lookups fold each node's persisted range into one aggregate, keeping
//!   partial knowledge when some nodes fail.
//! - **Anomalies**: Holes, overlaps, missing metadata, down nodes and unexplained errors are
//!   counted; any non-zero count makes the directory a self-heal candidate.
//! - **Persistence**: Each node stores its own range in the `trusted.dht.layout` xattr (see `disk`).
//!
//! Layouts are immutable once published: readers share an `Arc<Layout>` and healing
//! builds a replacement instead of mutating in place.

pub mod disk;
pub mod layout;
pub mod types;

pub use layout::*;
pub use types::*;

#[cfg(test)]
mod tests;
