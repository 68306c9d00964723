//! Volume configuration, loaded from JSON with per-field defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// When a file missing on its hashed node is searched for on every node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LookupUnhashed {
    /// Always.
    #[default]
    On,
    /// Never; the miss is final.
    Off,
    /// Only when the parent directory's layout is healthy.
    Auto,
}

impl std::str::FromStr for LookupUnhashed {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "on" => Ok(LookupUnhashed::On),
            "off" => Ok(LookupUnhashed::Off),
            "auto" => Ok(LookupUnhashed::Auto),
            other => Err(anyhow::anyhow!("Invalid lookup_unhashed value: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DistributeConfig {
    /// Nodes each directory is spread over; 0 means all of them.
    pub dir_spread_count: usize,
    /// Whether a miss on the hashed node is followed by a lookup on every node.
    pub lookup_unhashed: LookupUnhashed,
    /// Below this much free space (percent) a node gets no new files.
    pub min_free_disk_percent: f64,
    /// How often the topology monitor polls disk usage.
    pub du_refresh_interval_ms: u64,
    /// Per-request timeout of the HTTP transport.
    pub rpc_timeout_ms: u64,
    /// Attempts per HTTP request before the node is reported unreachable.
    pub rpc_attempts: u32,
    /// Concurrent migration workers.
    pub rebalance_workers: usize,
    /// Bytes copied per read/write round during a migration.
    pub migration_chunk_size: u64,
    /// How long a worker owns a task before another may reclaim it.
    pub task_lease_ms: u64,
    /// Back-off before a task that asked for a retry is handed out again.
    pub task_retry_delay_ms: u64,
}

impl Default for DistributeConfig {
    fn default() -> Self {
        Self {
            dir_spread_count: 0,
            lookup_unhashed: LookupUnhashed::On,
            min_free_disk_percent: 10.0,
            du_refresh_interval_ms: 5_000,
            rpc_timeout_ms: 2_000,
            rpc_attempts: 3,
            rebalance_workers: 2,
            migration_chunk_size: 128 * 1024,
            task_lease_ms: 30_000,
            task_retry_delay_ms: 1_000,
        }
    }
}

impl DistributeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..100.0).contains(&self.min_free_disk_percent) {
            anyhow::bail!(
                "min_free_disk_percent must be in [0, 100), got {}",
                self.min_free_disk_percent
            );
        }
        if self.migration_chunk_size == 0 {
            anyhow::bail!("migration_chunk_size must be positive");
        }
        if self.rpc_attempts == 0 {
            anyhow::bail!("rpc_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn du_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.du_refresh_interval_ms)
    }

    /// Timing for tests: short leases and no retry back-off.
    pub fn for_tests() -> Self {
        Self {
            task_lease_ms: 2_000,
            task_retry_delay_ms: 0,
            migration_chunk_size: 4,
            ..Default::default()
        }
    }
}
