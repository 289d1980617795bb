//! Failover records and their in-memory store
//!
//! A record is created at initiation (implicitly in progress), mutated only
//! by the orchestrator appending and closing steps, and terminal once
//! completed or failed. The store holds the one-in-progress-per-cluster
//! invariant: the existence check and the insert happen under one lock.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use super::FailoverError;

/// How a failover was initiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverKind {
    Manual,
    Automatic,
}

/// Lifecycle state of a failover operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverStatus {
    InProgress,
    Completed,
    Failed,
}

/// Lifecycle state of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    InProgress,
    Completed,
    Failed,
}

/// One executed step of a failover
#[derive(Debug, Clone, Serialize)]
pub struct FailoverStep {
    pub name: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Tracked state of one failover operation
#[derive(Debug, Clone, Serialize)]
pub struct FailoverRecord {
    pub id: Uuid,
    pub cluster_id: String,
    pub previous_primary_id: Option<String>,
    pub new_primary_id: String,
    pub kind: FailoverKind,
    pub status: FailoverStatus,
    pub steps: Vec<FailoverStep>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub reason: Option<String>,
}

impl FailoverRecord {
    pub fn is_terminal(&self) -> bool {
        self.status != FailoverStatus::InProgress
    }
}

/// History query filter
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub cluster_id: Option<String>,
    pub status: Option<FailoverStatus>,
    pub limit: Option<usize>,
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<Uuid, FailoverRecord>,
    /// Insertion order, oldest first
    order: Vec<Uuid>,
}

/// In-memory failover record store
///
/// Single-process scope. Exactly-once initiation across multiple
/// orchestrator processes needs an external uniqueness guarantee instead.
#[derive(Default)]
pub struct FailoverStore {
    inner: Mutex<StoreInner>,
}

impl FailoverStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new in-progress record
    ///
    /// Rejects when the cluster already has an in-progress record; the check
    /// and the insert are atomic under the store lock.
    pub fn begin(
        &self,
        cluster_id: &str,
        previous_primary_id: Option<String>,
        new_primary_id: &str,
        kind: FailoverKind,
        reason: Option<String>,
    ) -> Result<FailoverRecord, FailoverError> {
        let mut inner = self.inner.lock();

        let busy = inner.records.values().any(|r| {
            r.cluster_id == cluster_id && r.status == FailoverStatus::InProgress
        });
        if busy {
            return Err(FailoverError::AlreadyInProgress(cluster_id.to_string()));
        }

        let record = FailoverRecord {
            id: Uuid::new_v4(),
            cluster_id: cluster_id.to_string(),
            previous_primary_id,
            new_primary_id: new_primary_id.to_string(),
            kind,
            status: FailoverStatus::InProgress,
            steps: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
            reason,
        };
        inner.order.push(record.id);
        inner.records.insert(record.id, record.clone());
        Ok(record)
    }

    /// Append a new in-progress step
    pub fn start_step(&self, id: Uuid, name: &str) {
        self.mutate(id, |record| {
            record.steps.push(FailoverStep {
                name: name.to_string(),
                status: StepStatus::InProgress,
                started_at: Utc::now(),
                completed_at: None,
                error: None,
            });
        });
    }

    /// Close the most recent open step as completed
    pub fn complete_step(&self, id: Uuid) {
        self.finish_step(id, StepStatus::Completed, None);
    }

    /// Close the most recent open step as failed
    pub fn fail_step(&self, id: Uuid, error: &str) {
        self.finish_step(id, StepStatus::Failed, Some(error.to_string()));
    }

    fn finish_step(&self, id: Uuid, status: StepStatus, error: Option<String>) {
        self.mutate(id, |record| {
            if let Some(step) = record
                .steps
                .iter_mut()
                .rev()
                .find(|s| s.status == StepStatus::InProgress)
            {
                step.status = status;
                step.completed_at = Some(Utc::now());
                step.error = error;
            }
        });
    }

    /// Mark the record completed; no-op on a terminal record
    pub fn complete(&self, id: Uuid) {
        self.mutate(id, |record| {
            if record.is_terminal() {
                return;
            }
            record.status = FailoverStatus::Completed;
            record.completed_at = Some(Utc::now());
        });
    }

    /// Mark the record failed with a message; no-op on a terminal record
    pub fn fail(&self, id: Uuid, message: &str) {
        self.mutate(id, |record| {
            if record.is_terminal() {
                return;
            }
            record.status = FailoverStatus::Failed;
            record.completed_at = Some(Utc::now());
            record.error_message = Some(message.to_string());
        });
    }

    fn mutate(&self, id: Uuid, f: impl FnOnce(&mut FailoverRecord)) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.get_mut(&id) {
            f(record);
        }
    }

    /// Read one record
    pub fn get(&self, id: Uuid) -> Option<FailoverRecord> {
        self.inner.lock().records.get(&id).cloned()
    }

    /// Read history, newest first
    pub fn history(&self, filter: &HistoryFilter) -> Vec<FailoverRecord> {
        let inner = self.inner.lock();
        let mut out: Vec<FailoverRecord> = inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.records.get(id))
            .filter(|r| {
                filter
                    .cluster_id
                    .as_deref()
                    .map_or(true, |c| r.cluster_id == c)
                    && filter.status.map_or(true, |s| r.status == s)
            })
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn begin(store: &FailoverStore, cluster: &str) -> FailoverRecord {
        store
            .begin(cluster, Some("old".to_string()), "new", FailoverKind::Manual, None)
            .unwrap()
    }

    #[test]
    fn test_one_in_progress_per_cluster() {
        let store = FailoverStore::new();
        let first = begin(&store, "c1");

        match store.begin("c1", None, "other", FailoverKind::Manual, None) {
            Err(FailoverError::AlreadyInProgress(cluster)) => assert_eq!(cluster, "c1"),
            other => panic!("expected AlreadyInProgress, got {:?}", other.map(|r| r.id)),
        }
        // A different cluster is unaffected
        assert!(store.begin("c2", None, "x", FailoverKind::Manual, None).is_ok());

        // Once terminal, the cluster can fail over again
        store.fail(first.id, "boom");
        assert!(store.begin("c1", None, "x", FailoverKind::Manual, None).is_ok());
    }

    #[test]
    fn test_steps_append_in_order() {
        let store = FailoverStore::new();
        let record = begin(&store, "c1");

        store.start_step(record.id, "stop_old_primary");
        store.complete_step(record.id);
        store.start_step(record.id, "promote_new_primary");
        store.fail_step(record.id, "promotion timed out");

        let record = store.get(record.id).unwrap();
        assert_eq!(record.steps.len(), 2);
        assert_eq!(record.steps[0].name, "stop_old_primary");
        assert_eq!(record.steps[0].status, StepStatus::Completed);
        assert!(record.steps[0].completed_at.is_some());
        assert_eq!(record.steps[1].name, "promote_new_primary");
        assert_eq!(record.steps[1].status, StepStatus::Failed);
        assert_eq!(record.steps[1].error.as_deref(), Some("promotion timed out"));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let store = FailoverStore::new();
        let record = begin(&store, "c1");

        store.fail(record.id, "boom");
        store.complete(record.id);

        let record = store.get(record.id).unwrap();
        assert_eq!(record.status, FailoverStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_history_filters_newest_first() {
        let store = FailoverStore::new();
        let a = begin(&store, "c1");
        store.complete(a.id);
        let b = begin(&store, "c1");
        store.fail(b.id, "x");
        let c = begin(&store, "c2");
        store.complete(c.id);

        let all = store.history(&HistoryFilter::default());
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, c.id);
        assert_eq!(all[2].id, a.id);

        let c1_failed = store.history(&HistoryFilter {
            cluster_id: Some("c1".to_string()),
            status: Some(FailoverStatus::Failed),
            limit: None,
        });
        assert_eq!(c1_failed.len(), 1);
        assert_eq!(c1_failed[0].id, b.id);

        let limited = store.history(&HistoryFilter {
            limit: Some(2),
            ..Default::default()
        });
        assert_eq!(limited.len(), 2);
    }
}
