use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::aggregator::{Collect, StatfsMerge, dispatch};
use crate::config::DistributeConfig;
use crate::error::{Errno, FopResult};
use crate::fop::{Fop, IaType, Iatt, LINKTO_XATTR, Loc, Reply, Statvfs};
use crate::hash::hash_name;
use crate::layout::{Layout, SearchMiss};
use crate::migration::{self, MigrationDescriptor, TargetResolver, linkto_target};
use crate::rebalance::queue::TaskQueue;
use crate::rebalance::types::RebalanceStatus;
use crate::selfheal::{DirHealer, HealthRegistry, HealthReport};
use crate::topology::registry::TopologyRegistry;
use crate::topology::types::{SubvolId, TopologyEvent, TopologyView};
use crate::transport::Transport;

/// What the volume remembers about an object between operations.
#[derive(Debug, Clone, PartialEq)]
pub struct InodeCtx {
    /// Identity shared by every copy of the object.
    pub gfid: Uuid,
    pub ia_type: IaType,
    /// Node the name hashes to in the parent's layout; `None` for the root.
    pub hashed: Option<SubvolId>,
    /// Node holding the data. For directories, the lowest node that answered.
    pub cached: SubvolId,
}

/// Open-file context.
///
/// Pins the file to the node that held it at open time. A migration learned during an
/// operation on this handle is remembered, so later operations skip the resolution.
#[derive(Debug)]
pub struct FileHandle {
    pub loc: Loc,
    pub gfid: Uuid,
    /// Open flags, replayed when the file is reopened on a migration target.
    pub flags: u32,
    /// Node operations on this handle go to first.
    cached: RwLock<SubvolId>,
    /// Migration target learned from an earlier operation.
    hint: RwLock<Option<SubvolId>>,
}

impl FileHandle {
    pub(crate) fn new(loc: Loc, gfid: Uuid, flags: u32, cached: SubvolId) -> Self {
        Self {
            loc,
            gfid,
            flags,
            cached: RwLock::new(cached),
            hint: RwLock::new(None),
        }
    }

    pub async fn cached(&self) -> SubvolId {
        self.cached.read().await.clone()
    }

    /// Node the file is known to be moving to.
    pub async fn hint(&self) -> Option<SubvolId> {
        self.hint.read().await.clone()
    }
}

/// The distributed volume: every filesystem entry point lives on this type.
///
/// Directory layouts are shared read-only (`Arc<Layout>`); a heal builds a new layout
/// and swaps it into the cache rather than mutating the one readers hold.
pub struct Distribute {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) registry: Arc<TopologyRegistry>,
    pub(crate) config: DistributeConfig,
    pub(crate) health: Arc<HealthRegistry>,
    pub(crate) healer: DirHealer,
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) inodes: DashMap<Loc, InodeCtx>,
    pub(crate) layouts: DashMap<Loc, Arc<Layout>>,
}

impl Distribute {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<TopologyRegistry>,
        config: DistributeConfig,
    ) -> Arc<Self> {
        let health = Arc::new(HealthRegistry::new());
        let queue = Arc::new(TaskQueue::new(config.task_lease_ms, config.task_retry_delay_ms));

        Arc::new(Self {
            healer: DirHealer::new(transport.clone(), health.clone()),
            transport,
            registry,
            config,
            health,
            queue,
            inodes: DashMap::new(),
            layouts: DashMap::new(),
        })
    }

    pub fn config(&self) -> &DistributeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TopologyRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn view(&self) -> TopologyView {
        self.registry.snapshot()
    }

    /// Topology-change hook. Operations already running keep the view they started with.
    pub fn notify(&self, event: TopologyEvent) -> bool {
        self.registry.notify(event)
    }

    pub fn health(&self) -> HealthReport {
        self.health.report()
    }

    pub fn rebalance_status(&self) -> RebalanceStatus {
        self.queue.status()
    }

    /// Cached knowledge about `loc`, if any.
    pub fn inode(&self, loc: &Loc) -> Option<InodeCtx> {
        self.inodes.get(loc).map(|ctx| ctx.value().clone())
    }

    /// Cached layout of directory `loc`, if any.
    pub fn cached_layout(&self, loc: &Loc) -> Option<Arc<Layout>> {
        self.layouts.get(loc).map(|layout| layout.value().clone())
    }

    // --- Placement helpers ---

    /// Layout of directory `loc`, revalidated when the topology moved on since it was cached.
    pub(crate) async fn dir_layout(&self, loc: &Loc) -> FopResult<Arc<Layout>> {
        if let Some(layout) = self.cached_layout(loc)
            && layout.generation == self.registry.generation()
        {
            return Ok(layout);
        }
        let (_, layout) = self.lookup_dir(loc).await?;
        Ok(layout)
    }

    /// Node `loc`'s name hashes to in its parent's layout.
    pub(crate) fn hashed_subvol(&self, loc: &Loc, layout: &Layout) -> Option<SubvolId> {
        layout.search(hash_name(loc.name())).ok().cloned()
    }

    /// Like `hashed_subvol`, for operations that cannot proceed without a hashed node.
    pub(crate) fn hashed_for_create(&self, loc: &Loc, layout: &Layout) -> FopResult<SubvolId> {
        match layout.search(hash_name(loc.name())) {
            Ok(subvol) => Ok(subvol.clone()),
            Err(SearchMiss::Failed { subvol, status }) => {
                tracing::warn!("Hashed node {} of {} is unusable ({:?})", subvol, loc, status);
                Err(Errno::ENOTCONN)
            }
            Err(SearchMiss::Hole) => {
                tracing::warn!("No node owns the hash of {}", loc);
                Err(Errno::EIO)
            }
        }
    }

    pub(crate) fn remember(&self, loc: &Loc, iatt: &Iatt, hashed: Option<SubvolId>, cached: SubvolId) {
        self.inodes.insert(
            loc.clone(),
            InodeCtx {
                gfid: iatt.gfid,
                ia_type: iatt.ia_type,
                hashed,
                cached,
            },
        );
    }

    pub(crate) fn forget(&self, loc: &Loc) {
        self.inodes.remove(loc);
        self.layouts.remove(loc);
    }

    /// Forgets `loc` and everything below it.
    pub(crate) fn forget_tree(&self, loc: &Loc) {
        let prefix = format!("{}/", loc.path);
        let below = |path: &Loc| path == loc || path.path.starts_with(&prefix);
        self.inodes.retain(|path, _| !below(path));
        self.layouts.retain(|path, _| !below(path));
    }

    /// Cached context for `loc`, looking it up when unknown.
    pub(crate) async fn resolve(&self, loc: &Loc) -> FopResult<InodeCtx> {
        if let Some(ctx) = self.inode(loc) {
            return Ok(ctx);
        }
        self.lookup(loc).await?;
        self.inode(loc).ok_or(Errno::ENOENT)
    }

    // --- Data path ---

    /// Sends a data operation to the node holding the file, following a migration once.
    ///
    /// The inode context and the open-file handle learn where the data went, so the next
    /// operation goes there directly.
    pub(crate) async fn data_op(&self, loc: &Loc, fh: Option<&FileHandle>, fop: Fop) -> FopResult<Reply> {
        let (cached, hint) = match fh {
            Some(fh) => (fh.cached().await, fh.hint().await),
            None => (self.resolve(loc).await?.cached, None),
        };

        let Some(desc) = MigrationDescriptor::new(cached.clone(), fop.clone(), hint) else {
            return self.transport.submit(&cached, fop).await;
        };

        let handoff = migration::submit(&self.transport, self, desc).await;

        if handoff.served_by != cached {
            tracing::debug!("{} is now served by {}", loc, handoff.served_by);
            if let Some(mut ctx) = self.inodes.get_mut(loc) {
                ctx.cached = handoff.served_by.clone();
            }
            if let Some(fh) = fh {
                *fh.cached.write().await = handoff.served_by.clone();
                *fh.hint.write().await = None;
            }
        } else if let (Some(fh), Some(target)) = (fh, handoff.target) {
            *fh.hint.write().await = Some(target);
        }

        if handoff.result == Err(Errno::ENOENT) {
            self.inodes.remove(loc);
        }
        handoff.result
    }

    /// Sums capacity over every live node.
    pub async fn statfs(&self, loc: &Loc) -> FopResult<Statvfs> {
        let up = self.view().up();
        if up.is_empty() {
            return Err(Errno::ENOTCONN);
        }
        dispatch(&self.transport, &up, &Fop::Statfs { loc: loc.clone() }, StatfsMerge::new())
            .wait()
            .await?
    }
}

#[async_trait]
impl TargetResolver for Distribute {
    /// Asks the source for its link-target xattr; when the source no longer has the
    /// file, the other live nodes are searched for its data.
    async fn resolve_target(&self, loc: &Loc, source: &SubvolId) -> FopResult<SubvolId> {
        let fop = Fop::Getxattr {
            loc: loc.clone(),
            name: Some(LINKTO_XATTR.to_string()),
        };
        if let Ok(reply) = self.transport.submit(source, fop).await
            && let Ok(xattrs) = reply.into_xattrs()
            && let Some(target) = linkto_target(&xattrs)
            && &target != source
        {
            return Ok(target);
        }

        let others: Vec<SubvolId> = self
            .view()
            .up()
            .into_iter()
            .filter(|id| id != source)
            .collect();
        let results = dispatch(&self.transport, &others, &Fop::Lookup { loc: loc.clone() }, Collect::new())
            .wait()
            .await?;

        results
            .into_iter()
            .find_map(|(id, result)| match result {
                Ok(reply) => reply
                    .iatt()
                    .filter(|iatt| iatt.is_regular() && !iatt.has_linkfile_mode())
                    .map(|_| id),
                Err(_) => None,
            })
            .ok_or(Errno::ENOENT)
    }
}
