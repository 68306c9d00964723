//! Brick Wire Protocol
//!
//! A single endpoint carries every filesystem operation. Request and response bodies
//! are `bincode` frames; the HTTP status is always 200 when a frame was decoded, and
//! the operation's own outcome travels inside `FopResponse`.

use serde::{Deserialize, Serialize};

use crate::error::Errno;
use crate::fop::{Fop, Reply};

/// Endpoint every brick serves.
pub const ENDPOINT_FOP: &str = "/fop";

#[derive(Debug, Serialize, Deserialize)]
pub struct FopRequest {
    /// Correlates the request with server-side log lines.
    pub op_id: String,
    pub fop: Fop,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FopResponse {
    pub result: Result<Reply, Errno>,
}

pub fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>, Errno> {
    bincode::serialize(frame).map_err(|e| {
        tracing::error!("Failed to encode frame: {}", e);
        Errno::EIO
    })
}

pub fn decode<T: serde::de::DeserializeOwned>(raw: &[u8]) -> Result<T, Errno> {
    bincode::deserialize(raw).map_err(|e| {
        tracing::error!("Failed to decode frame: {}", e);
        Errno::EIO
    })
}
