use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::rebalance::types::now_ms;
use crate::topology::types::SubvolId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// A live node failed a lookup with an error other than absent/unreachable.
    MiscLookupError,
    /// The same name exists as a data file on more than one node.
    AmbiguousPlacement,
    /// A heal was needed but postponed because a node was down.
    HealDeferred,
    /// A live node refused a directory or layout write; the cached layout was dropped.
    LayoutWriteFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthIssue {
    pub path: String,
    pub kind: IssueKind,
    /// Human readable summary for the operator.
    pub detail: String,
    /// Nodes involved, e.g. those that refused a write or hold duplicate copies.
    pub subvols: Vec<SubvolId>,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    /// Times the same issue was recorded for the path.
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// True when no issue is outstanding.
    pub healthy: bool,
    pub issues: Vec<HealthIssue>,
}

/// Consistency problems awaiting an operator, keyed by path and kind.
pub struct HealthRegistry {
    issues: DashMap<(String, IssueKind), HealthIssue>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            issues: DashMap::new(),
        }
    }

    pub fn record(&self, path: &str, kind: IssueKind, detail: String, subvols: Vec<SubvolId>) {
        let now = now_ms();
        let mut issue = self
            .issues
            .entry((path.to_string(), kind))
            .or_insert_with(|| HealthIssue {
                path: path.to_string(),
                kind,
                detail: String::new(),
                subvols: Vec::new(),
                first_seen_ms: now,
                last_seen_ms: now,
                count: 0,
            });

        issue.count += 1;
        issue.last_seen_ms = now;
        issue.detail = detail;
        issue.subvols = subvols;

        tracing::warn!(
            "Health issue {:?} on {} (seen {} times): {}",
            kind,
            path,
            issue.count,
            issue.detail
        );
    }

    /// Forgets every issue of `path`, after it was found or made consistent.
    pub fn clear(&self, path: &str) {
        self.issues.retain(|(p, _), _| p != path);
    }

    pub fn clear_kind(&self, path: &str, kind: IssueKind) {
        self.issues.remove(&(path.to_string(), kind));
    }

    pub fn has(&self, path: &str, kind: IssueKind) -> bool {
        self.issues.contains_key(&(path.to_string(), kind))
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn issues(&self) -> Vec<HealthIssue> {
        let mut issues: Vec<HealthIssue> = self.issues.iter().map(|e| e.value().clone()).collect();
        issues.sort_by(|a, b| (&a.path, a.kind).cmp(&(&b.path, b.kind)));
        issues
    }

    pub fn report(&self) -> HealthReport {
        let issues = self.issues();
        HealthReport {
            healthy: issues.is_empty(),
            issues,
        }
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}
