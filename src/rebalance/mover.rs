//! Rebalance Worker Pool
//!
//! Spawns background workers that poll the `TaskQueue` and run fix-layout crawls and
//! file migrations, one task per worker at a time.
//!
//! ## Responsibilities
//! - **Polling**: checking for claimable tasks, sleeping when there are none.
//! - **Lease Management**: a sidecar task renews the lease while a migration runs.
//! - **Execution**: crawling for `FixLayout`, copying for `MigrateFile`.

use std::sync::Arc;
use std::time::Duration;

use super::crawler::crawl;
use super::migrate::migrate_file;
use super::types::*;
use crate::error::Errno;
use crate::fop::Loc;
use crate::router::Distribute;

pub struct Rebalancer {
    volume: Arc<Distribute>,
    /// Number of concurrent workers; bounds how many files move at once.
    worker_count: usize,
}

impl Rebalancer {
    pub fn new(volume: Arc<Distribute>, worker_count: usize) -> Arc<Self> {
        Arc::new(Self {
            volume,
            worker_count: worker_count.max(1),
        })
    }

    /// Spawns the workers and returns immediately.
    pub async fn start(self: Arc<Self>) {
        for worker_id in 0..self.worker_count {
            let mover = self.clone();
            tokio::spawn(async move {
                mover.worker_loop(worker_id).await;
            });
        }

        tracing::info!("Rebalancer started with {} workers", self.worker_count);
    }

    async fn worker_loop(&self, worker_id: usize) {
        tracing::debug!("Rebalance worker {} started", worker_id);

        loop {
            if !self.run_next(worker_id).await {
                // Nothing claimable
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    /// Claims and runs one task. Returns false when no task could be claimed.
    async fn run_next(&self, worker_id: usize) -> bool {
        let queue = self.volume.queue();
        let tasks = queue.available_tasks();
        tracing::trace!("Worker {} sees {} available tasks", worker_id, tasks.len());

        for (task_id, entry) in tasks {
            if queue.try_claim_task(&task_id) {
                tracing::debug!(
                    "Worker {} claimed {} task {} for {}",
                    worker_id,
                    entry.task.kind(),
                    task_id.0,
                    entry.task.path()
                );
                self.execute_with_lease(&task_id, entry.task).await;
                return true;
            }
        }
        false
    }

    /// Runs queued tasks on the calling task until none is left to claim.
    /// Returns the number of task executions.
    pub async fn run_pending(&self) -> usize {
        let mut executed = 0;
        while self.run_next(usize::MAX).await {
            executed += 1;
        }
        executed
    }

    async fn execute_with_lease(&self, task_id: &TaskId, task: Task) {
        let renewal_handle = self.spawn_lease_renewal(task_id);
        let outcome = self.execute_task(&task).await;
        renewal_handle.abort();

        if let Err(e) = self.volume.queue().complete_task(task_id, outcome) {
            tracing::error!("Failed to complete task {}: {}", task_id.0, e);
        }
    }

    fn spawn_lease_renewal(&self, task_id: &TaskId) -> tokio::task::JoinHandle<()> {
        let queue = self.volume.queue().clone();
        let task_id = task_id.clone();
        let every = Duration::from_millis((self.volume.config().task_lease_ms / 3).max(1));

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                if queue.renew_lease(&task_id).is_err() {
                    tracing::trace!("Task {} no longer needs lease renewal", task_id.0);
                    break;
                }
            }
        })
    }

    async fn execute_task(&self, task: &Task) -> TaskOutcome {
        let loc = Loc::new(task.path());
        match task {
            Task::FixLayout { migrate_data, .. } => {
                match crawl(&self.volume, &loc, *migrate_data).await {
                    Ok(_) => TaskOutcome::Done,
                    Err(errno) if errno.is_absent() => TaskOutcome::Skipped(format!("{} vanished", loc)),
                    Err(errno @ (Errno::ENOTCONN | Errno::ETIMEDOUT)) => {
                        TaskOutcome::Retry(format!("crawl of {}: {}", loc, errno))
                    }
                    Err(errno) => TaskOutcome::Failed(format!("crawl of {}: {}", loc, errno)),
                }
            }
            Task::MigrateFile { .. } => migrate_file(&self.volume, &loc).await,
        }
    }
}
