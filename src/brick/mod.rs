//! Brick Module
//!
//! An in-memory storage subvolume. It stands in for the storage collaborator the
//! distribution layer consumes: objects with attributes, extended attributes and
//! contents, addressed by path. Bricks know nothing about layouts or link files;
//! those are plain xattrs and mode bits to them.
//!
//! ## Core Mechanisms
//! - **Namespace**: A path-ordered map so directory listings and renames are range scans.
//! - **Serving**: `brick_router` exposes a brick over HTTP at `POST /fop` (bincode frames).

pub mod handlers;
pub mod store;

pub use handlers::brick_router;
pub use store::{MemoryBrick, Object};
