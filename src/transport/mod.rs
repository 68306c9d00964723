//! Transport Module
//!
//! The request/response primitive the distribution layer uses to reach a subvolume.
//! Every `submit` delivers exactly one result: the subvolume's `Reply` or an `Errno`.
//! Unreachable nodes surface as `ENOTCONN` and timeouts as `ETIMEDOUT`, so callers
//! treat transport trouble as an ordinary sub-request failure.
//!
//! ## Implementations
//! - **`LocalTransport`**: In-process bricks, with down-node, error and latency injection.
//! - **`HttpTransport`**: `bincode` frames posted to a brick's `/fop` endpoint with retry and backoff.

pub mod http;
pub mod local;
pub mod protocol;

use async_trait::async_trait;

use crate::error::FopResult;
use crate::fop::{Fop, Reply};
use crate::topology::types::SubvolId;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one operation to one subvolume and waits for its answer.
    async fn submit(&self, target: &SubvolId, fop: Fop) -> FopResult<Reply>;
}

pub use http::HttpTransport;
pub use local::LocalTransport;
