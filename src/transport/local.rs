use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::Transport;
use crate::brick::MemoryBrick;
use crate::error::{Errno, FopResult};
use crate::fop::{Fop, Reply};
use crate::topology::types::SubvolId;

/// In-process transport over `MemoryBrick`s.
///
/// Used by tests and single-process setups. Faults are injected per subvolume:
/// a node marked down answers `ENOTCONN`, an injected error is returned for every
/// operation of the given name, and `max_latency_ms` adds a random delay per call.
pub struct LocalTransport {
    pub bricks: DashMap<SubvolId, Arc<MemoryBrick>>,
    down: DashSet<SubvolId>,
    injected: DashMap<(SubvolId, &'static str), Errno>,
    calls: DashMap<(SubvolId, &'static str), usize>,
    max_latency_ms: AtomicU64,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bricks: DashMap::new(),
            down: DashSet::new(),
            injected: DashMap::new(),
            calls: DashMap::new(),
            max_latency_ms: AtomicU64::new(0),
        })
    }

    /// Transport with one empty brick per id.
    pub fn with_bricks(ids: &[SubvolId]) -> Arc<Self> {
        let transport = Self::new();
        for id in ids {
            transport.add_brick(id.clone());
        }
        transport
    }

    pub fn add_brick(&self, id: SubvolId) -> Arc<MemoryBrick> {
        let brick = Arc::new(MemoryBrick::new(id.clone()));
        self.bricks.insert(id, brick.clone());
        brick
    }

    pub fn brick(&self, id: &SubvolId) -> Option<Arc<MemoryBrick>> {
        self.bricks.get(id).map(|b| b.value().clone())
    }

    pub fn set_down(&self, id: &SubvolId, down: bool) {
        if down {
            self.down.insert(id.clone());
        } else {
            self.down.remove(id);
        }
    }

    /// Makes every `fop` (by name, e.g. "lookup") sent to `id` fail with `errno`.
    pub fn inject(&self, id: &SubvolId, fop: &'static str, errno: Errno) {
        self.injected.insert((id.clone(), fop), errno);
    }

    pub fn clear_injections(&self) {
        self.injected.clear();
    }

    pub fn set_max_latency(&self, ms: u64) {
        self.max_latency_ms.store(ms, Ordering::Relaxed);
    }

    /// Number of `fop`s of the given name delivered to (or refused by) `id`.
    pub fn calls(&self, id: &SubvolId, fop: &'static str) -> usize {
        self.calls
            .get(&(id.clone(), fop))
            .map(|c| *c.value())
            .unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        self.calls.clear();
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn submit(&self, target: &SubvolId, fop: Fop) -> FopResult<Reply> {
        let name = fop.name();
        *self.calls.entry((target.clone(), name)).or_insert(0) += 1;

        let max_latency = self.max_latency_ms.load(Ordering::Relaxed);
        if max_latency > 0 {
            let delay = rand::random::<u64>() % (max_latency + 1);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.down.contains(target) {
            return Err(Errno::ENOTCONN);
        }
        if let Some(errno) = self.injected.get(&(target.clone(), name)) {
            return Err(*errno.value());
        }

        let brick = self.brick(target).ok_or(Errno::ENOTCONN)?;
        brick.handle(fop).await
    }
}
