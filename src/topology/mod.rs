//! Topology Registry Module
//!
//! Tracks the set of configured subvolumes (storage nodes) that make up the volume,
//! their liveness, and the disk-usage figures used when placing new files.
//!
//! ## Core Mechanisms
//! - **Notifications**: Every change arrives as a `TopologyEvent` through `TopologyRegistry::notify`.
//! - **Generations**: Membership and liveness changes bump a generation counter. Cached directory
//!   layouts built under an older generation are revalidated on their next lookup.
//! - **Snapshots**: Operations read a `TopologyView` taken when they start, so a change is visible
//!   to new operations immediately but never to one already in flight.
//! - **Monitor**: A background prober refreshes disk usage and detects nodes going up or down.

pub mod monitor;
pub mod registry;
pub mod types;
