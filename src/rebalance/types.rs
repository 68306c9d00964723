use serde::{Deserialize, Serialize};

/// Unique identifier for a rebalance task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generates a new random UUID v4-based TaskId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle state of a task in the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TaskStatus {
    /// Waiting for a worker (possibly until `not_before`).
    Pending,
    /// Claimed by a worker; accompanied by a `lease_expires` timestamp in `TaskEntry`.
    Running,
    Completed,
    Failed { error: String },
}

/// A unit of rebalance work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    /// Recompute and publish the layout of every directory below `path`, optionally
    /// queueing the files that end up on the wrong node.
    FixLayout { path: String, migrate_data: bool },
    /// Move one file to the node its name hashes to.
    MigrateFile { path: String },
}

impl Task {
    pub fn path(&self) -> &str {
        match self {
            Task::FixLayout { path, .. } | Task::MigrateFile { path } => path,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Task::FixLayout { .. } => "fix_layout",
            Task::MigrateFile { .. } => "migrate_file",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEntry {
    /// The file migration to perform.
    pub task: Task,
    pub status: TaskStatus,
    /// Number of times a worker has picked the task up.
    pub attempts: u32,
    /// Timestamp (ms) when the task was submitted.
    pub created_at: u64,
    /// The task is not handed out before this timestamp (ms); used for retry back-off.
    pub not_before: u64,
    /// Timestamp (ms) when the current execution lease expires.
    /// If `now > lease_expires`, the task is considered abandoned and can be reclaimed.
    pub lease_expires: Option<u64>,
}

/// How a task execution ended, as reported by the mover to the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Done,
    /// Nothing to do for this object (already in place, vanished, ...).
    Skipped(String),
    /// Transient failure; try again after the retry delay.
    Retry(String),
    Failed(String),
}

/// Counters exposed on the admin API.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RebalanceStatus {
    /// Tasks waiting for a worker, including those backing off after a retry.
    pub pending: usize,
    /// Tasks currently leased by a worker.
    pub running: usize,
    /// Tasks that ended as done or skipped.
    pub completed: usize,
    /// Tasks that failed or ran out of attempts.
    pub failed: usize,
    pub files_migrated: u64,
    /// Data bytes copied by completed migrations.
    pub bytes_moved: u64,
    pub files_skipped: u64,
    /// Directories whose layout was rewritten by fix-layout or a rebalance crawl.
    pub layouts_fixed: u64,
}

/// Current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
