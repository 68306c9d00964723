//! Aggregator Module
//!
//! Scatter/gather execution of one logical operation over one or many subvolumes.
//!
//! ## Core Mechanisms
//! - **Dispatch**: One task per target is spawned; sub-requests are independent and may complete
//!   in any order, on any worker thread.
//! - **Rendezvous**: Each completion takes the `OpContext` lock, folds its result into the
//!   accumulator and decrements the outstanding counter. The completion that brings the counter
//!   to zero takes the one-shot sender and delivers the final result, so it fires exactly once.
//! - **Merge rules**: Implementations of `Merge` decide how partial results combine. Every rule is
//!   commutative and associative, which makes the aggregate independent of completion order.
//! - **No cancellation**: Once dispatched, every sub-request runs to completion (or transport
//!   timeout) before the final result exists.

pub mod context;
pub mod merge;

pub use context::{DispatchHandle, OpContext, dispatch, dispatch_each};
pub use merge::*;
