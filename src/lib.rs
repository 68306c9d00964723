//! Distributed Volume Library
//!
//! The distribution layer of a scale-out filesystem: it decides which storage node
//! (subvolume) owns every file and directory of a shared namespace, relocates data
//! between nodes without interrupting access, and keeps per-directory placement
//! metadata consistent as nodes come and go.
//!
//! ## Architecture Modules
//!
//! - **`hash`** / **`layout`**: Name hashing and per-directory hash-range layouts.
//! - **`topology`**: The set of subvolumes, their liveness and free space.
//! - **`fop`** / **`transport`** / **`brick`**: The operation vocabulary, how it reaches a
//!   subvolume, and an in-memory subvolume to serve it.
//! - **`aggregator`**: Scatter/gather of one operation over many subvolumes.
//! - **`selfheal`**: Layout repair and the health registry for problems needing an operator.
//! - **`migration`**: Transparent redirection of data operations around file migrations.
//! - **`rebalance`**: The background mover and its task queue.
//! - **`router`**: `Distribute`, the volume every filesystem operation enters through.

pub mod aggregator;
pub mod brick;
pub mod config;
pub mod error;
pub mod fop;
pub mod hash;
pub mod layout;
pub mod migration;
pub mod rebalance;
pub mod router;
pub mod selfheal;
pub mod topology;
pub mod transport;
