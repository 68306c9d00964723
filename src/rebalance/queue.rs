//! Rebalance Task Queue
//!
//! Holds fix-layout and file-migration tasks for the local worker pool.
//!
//! ## Responsibilities
//! - **Submission**: New tasks start `Pending`; a path already queued is not queued twice.
//! - **Leasing**: A worker claims a task by moving it to `Running` with a lease. A task whose
//!   lease expired (worker died or hung) becomes claimable again.
//! - **Retry**: Transient failures return the task to `Pending` with a back-off delay, up to
//!   `MAX_TASK_ATTEMPTS` pickups.
//! - **Accounting**: Status counts and mover counters for the admin API.

use super::types::*;

use anyhow::Result;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Pickups after which a task that keeps asking for a retry is marked failed.
pub const MAX_TASK_ATTEMPTS: u32 = 5;

/// Counters shared by the workers; folded into [`RebalanceStatus`] on demand.
#[derive(Debug, Default)]
pub struct MoverStats {
    pub files_migrated: AtomicU64,
    pub bytes_moved: AtomicU64,
    pub files_skipped: AtomicU64,
    pub layouts_fixed: AtomicU64,
}

pub struct TaskQueue {
    tasks: DashMap<TaskId, TaskEntry>,
    lease_ms: u64,
    retry_delay_ms: u64,
    pub stats: MoverStats,
}

impl TaskQueue {
    pub fn new(lease_ms: u64, retry_delay_ms: u64) -> Self {
        Self {
            tasks: DashMap::new(),
            lease_ms,
            retry_delay_ms,
            stats: MoverStats::default(),
        }
    }

    /// Queues a task. If an unfinished task for the same work exists, its id is returned instead.
    pub fn submit(&self, task: Task) -> TaskId {
        if let Some(existing) = self.tasks.iter().find(|e| {
            e.task == task && matches!(e.status, TaskStatus::Pending | TaskStatus::Running)
        }) {
            tracing::debug!("Task {} for {} already queued", existing.key().0, task.path());
            return existing.key().clone();
        }

        let task_id = TaskId::new();
        let now = now_ms();
        tracing::debug!("Queued {} task {} for {}", task.kind(), task_id.0, task.path());
        self.tasks.insert(
            task_id.clone(),
            TaskEntry {
                task,
                status: TaskStatus::Pending,
                attempts: 0,
                created_at: now,
                not_before: now,
                lease_expires: None,
            },
        );
        task_id
    }

    /// Tasks a worker may claim right now, oldest first.
    ///
    /// Eligible tasks are `Pending` ones whose back-off has elapsed and `Running` ones
    /// whose lease has expired.
    pub fn available_tasks(&self) -> Vec<(TaskId, TaskEntry)> {
        let now = now_ms();
        let mut tasks: Vec<(TaskId, TaskEntry)> = self
            .tasks
            .iter()
            .filter(|entry| match entry.status {
                TaskStatus::Pending => entry.not_before <= now,
                TaskStatus::Running => entry.lease_expires.map(|l| now > l).unwrap_or(false),
                _ => false,
            })
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        tasks.sort_by_key(|(_, entry)| entry.created_at);
        tasks
    }

    /// Atomically moves an available task to `Running` under a fresh lease.
    pub fn try_claim_task(&self, task_id: &TaskId) -> bool {
        let Some(mut entry) = self.tasks.get_mut(task_id) else {
            return false;
        };

        let now = now_ms();
        let claimable = match entry.status {
            TaskStatus::Pending => entry.not_before <= now,
            TaskStatus::Running => entry.lease_expires.map(|l| now > l).unwrap_or(false),
            _ => false,
        };
        if !claimable {
            return false;
        }

        entry.status = TaskStatus::Running;
        entry.attempts += 1;
        entry.lease_expires = Some(now + self.lease_ms);
        tracing::debug!("Claimed task {} (attempt {})", task_id.0, entry.attempts);
        true
    }

    /// Extends the lease of a running task.
    pub fn renew_lease(&self, task_id: &TaskId) -> Result<()> {
        let mut entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| anyhow::anyhow!("Task not found"))?;

        if entry.status != TaskStatus::Running {
            return Err(anyhow::anyhow!("Task not running (status: {:?})", entry.status));
        }
        entry.lease_expires = Some(now_ms() + self.lease_ms);
        tracing::trace!("Renewed lease for task {}", task_id.0);
        Ok(())
    }

    /// Records how an execution ended and clears the lease.
    pub fn complete_task(&self, task_id: &TaskId, outcome: TaskOutcome) -> Result<()> {
        let mut entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| anyhow::anyhow!("Task not found"))?;
        entry.lease_expires = None;

        match outcome {
            TaskOutcome::Done => {
                entry.status = TaskStatus::Completed;
                tracing::info!("Task {} ({}) completed", task_id.0, entry.task.path());
            }
            TaskOutcome::Skipped(reason) => {
                entry.status = TaskStatus::Completed;
                self.stats.files_skipped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Task {} skipped: {}", task_id.0, reason);
            }
            TaskOutcome::Retry(reason) if entry.attempts < MAX_TASK_ATTEMPTS => {
                entry.status = TaskStatus::Pending;
                entry.not_before = now_ms() + self.retry_delay_ms;
                tracing::warn!(
                    "Task {} ({}) will be retried in {}ms: {}",
                    task_id.0,
                    entry.task.path(),
                    self.retry_delay_ms,
                    reason
                );
            }
            TaskOutcome::Retry(error) | TaskOutcome::Failed(error) => {
                tracing::error!("Task {} ({}) failed: {}", task_id.0, entry.task.path(), error);
                entry.status = TaskStatus::Failed { error };
            }
        }
        Ok(())
    }

    pub fn get_task(&self, task_id: &TaskId) -> Option<TaskEntry> {
        self.tasks.get(task_id).map(|e| e.value().clone())
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn task_status_counts(&self) -> (usize, usize, usize, usize) {
        let mut pending = 0;
        let mut running = 0;
        let mut completed = 0;
        let mut failed = 0;

        for entry in self.tasks.iter() {
            match entry.status {
                TaskStatus::Pending => pending += 1,
                TaskStatus::Running => running += 1,
                TaskStatus::Completed => completed += 1,
                TaskStatus::Failed { .. } => failed += 1,
            }
        }

        (pending, running, completed, failed)
    }

    /// No task is waiting or running.
    pub fn is_idle(&self) -> bool {
        let (pending, running, _, _) = self.task_status_counts();
        pending == 0 && running == 0
    }

    pub fn status(&self) -> RebalanceStatus {
        let (pending, running, completed, failed) = self.task_status_counts();
        RebalanceStatus {
            pending,
            running,
            completed,
            failed,
            files_migrated: self.stats.files_migrated.load(Ordering::Relaxed),
            bytes_moved: self.stats.bytes_moved.load(Ordering::Relaxed),
            files_skipped: self.stats.files_skipped.load(Ordering::Relaxed),
            layouts_fixed: self.stats.layouts_fixed.load(Ordering::Relaxed),
        }
    }
}
