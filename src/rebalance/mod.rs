//! Rebalance Module
//!
//! Background relocation of files to the nodes a recomputed layout assigns them to.
//!
//! ## Components
//! - **`queue`**: Lease-based task queue with retry back-off and mover counters.
//! - **`crawler`**: Depth-first walk that fixes directory layouts and queues misplaced files.
//! - **`migrate`**: The per-file copy and Phase 1 to Phase 2 switch.
//! - **`mover`**: Bounded pool of workers draining the queue.
//!
//! Foreground operations never wait on the mover. The only shared state it touches is the
//! per-directory heal lock, held for the single layout write of a fix-layout.

pub mod crawler;
pub mod migrate;
pub mod mover;
pub mod queue;
pub mod types;

pub use crawler::{CrawlSummary, crawl};
pub use migrate::{MigrateError, migrate_file};
pub use mover::Rebalancer;
pub use queue::TaskQueue;
pub use types::*;

#[cfg(test)]
mod tests;
