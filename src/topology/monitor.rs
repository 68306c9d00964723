use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use super::registry::TopologyRegistry;
use super::types::{DiskUsage, SubvolId, TopologyEvent};
use crate::error::Errno;
use crate::fop::{Fop, Loc};
use crate::transport::Transport;

/// Consecutive failed probes before a subvolume is declared down.
pub const DOWN_AFTER_FAILURES: u32 = 2;

/// Periodic `statfs` prober.
///
/// Each round refreshes disk usage of every configured subvolume. A node answering
/// again after being marked down is brought back up; a node missing
/// `DOWN_AFTER_FAILURES` rounds in a row is marked down.
pub struct TopologyMonitor {
    registry: Arc<TopologyRegistry>,
    transport: Arc<dyn Transport>,
    interval: Duration,
    probe_timeout: Duration,
    failures: DashMap<SubvolId, u32>,
}

impl TopologyMonitor {
    pub fn new(
        registry: Arc<TopologyRegistry>,
        transport: Arc<dyn Transport>,
        interval: Duration,
        probe_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            transport,
            interval,
            probe_timeout,
            failures: DashMap::new(),
        })
    }

    /// Spawns the probing loop and returns immediately.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tracing::info!("Starting topology monitor (every {:?})", self.interval);
        tokio::spawn(async move {
            self.monitor_loop().await;
        })
    }

    async fn monitor_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            interval.tick().await;
            self.clone().probe_all().await;
        }
    }

    /// Probes every subvolume concurrently and applies the outcomes.
    pub async fn probe_all(self: Arc<Self>) {
        let mut probes = JoinSet::new();
        for id in self.registry.snapshot().all() {
            let monitor = self.clone();
            probes.spawn(async move { monitor.probe(&id).await });
        }
        while probes.join_next().await.is_some() {}
    }

    /// Probes one subvolume. Returns whether it answered.
    pub async fn probe(&self, id: &SubvolId) -> bool {
        let fop = Fop::Statfs { loc: Loc::root() };
        let outcome = tokio::time::timeout(self.probe_timeout, self.transport.submit(id, fop))
            .await
            .unwrap_or(Err(Errno::ETIMEDOUT))
            .and_then(|reply| reply.into_statfs());

        match outcome {
            Ok(statfs) => {
                self.failures.remove(id);
                tracing::trace!("{} has {:.1}% free", id, statfs.avail_percent());
                self.registry.notify(TopologyEvent::DiskUsage {
                    id: id.clone(),
                    usage: DiskUsage {
                        avail_percent: statfs.avail_percent(),
                        avail_bytes: statfs.avail_bytes,
                    },
                });
                if !self.registry.is_up(id) {
                    self.registry.notify(TopologyEvent::Up { id: id.clone() });
                }
                true
            }
            Err(errno) => {
                let failures = {
                    let mut count = self.failures.entry(id.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                tracing::debug!("Probe of {} failed ({}), {} in a row", id, errno, failures);

                if failures >= DOWN_AFTER_FAILURES && self.registry.is_up(id) {
                    tracing::warn!("{} missed {} probes, marking down", id, failures);
                    self.registry.notify(TopologyEvent::Down { id: id.clone() });
                }
                false
            }
        }
    }
}
