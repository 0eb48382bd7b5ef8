//! In-memory progress store
//!
//! Holds the authoritative `ProgressRecord` for every job. The store is a
//! cloneable handle around shared state, injected into the orchestrator and
//! runners rather than reached through a global, so tests can stand up an
//! isolated store per case.
//!
//! Guarantees enforced here rather than trusted to callers:
//!
//! - transitions follow the job state machine; writes against a terminal
//!   record are no-ops reported back to the caller
//! - `completed` only ever increments, and never past `total`
//! - mutating operations apply under a single write-lock acquisition, so
//!   concurrent workers cannot interleave a lost update
//!
//! Terminal records stay queryable until the retention sweeper removes them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{JobStatus, ProgressRecord, ProgressSnapshot, ResultSummary};

#[derive(Clone, Default)]
pub struct ProgressStore {
    records: Arc<RwLock<HashMap<Uuid, ProgressRecord>>>,
}

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new record. Submission creates the record before the
    /// submit call returns, so a caller's immediate status query finds it.
    pub async fn insert(&self, record: ProgressRecord) {
        let mut records = self.records.write().await;
        records.insert(record.job_id, record);
    }

    pub async fn snapshot(&self, job_id: Uuid) -> Option<ProgressSnapshot> {
        let records = self.records.read().await;
        records.get(&job_id).map(|r| r.snapshot())
    }

    /// Snapshots of all non-terminal jobs, oldest first.
    pub async fn active_snapshots(&self) -> Vec<ProgressSnapshot> {
        let records = self.records.read().await;
        let mut active: Vec<&ProgressRecord> = records
            .values()
            .filter(|r| !r.status.is_terminal())
            .collect();
        active.sort_by_key(|r| r.created_at);
        active.iter().map(|r| r.snapshot()).collect()
    }

    pub async fn mark_started(&self, job_id: Uuid) -> bool {
        self.apply(job_id, |record| {
            transition(record, JobStatus::Started)
        })
        .await
    }

    /// Finishes an item job with its score summary. Sets the work counter
    /// to its total so the derived percentage reads 100.
    pub async fn finish_item(&self, job_id: Uuid, summary: ResultSummary) -> bool {
        self.apply(job_id, |record| {
            if !transition(record, JobStatus::Finished) {
                return false;
            }
            record.completed = record.total;
            record.current_item = None;
            record.result = Some(summary);
            true
        })
        .await
    }

    /// Finishes a collection job. The member counters stay as the children
    /// left them; no aggregate score exists.
    pub async fn finish_collection(&self, job_id: Uuid) -> bool {
        self.apply(job_id, |record| {
            if !transition(record, JobStatus::Finished) {
                return false;
            }
            record.current_item = None;
            true
        })
        .await
    }

    pub async fn mark_failed(&self, job_id: Uuid, error: String) -> bool {
        self.apply(job_id, |record| {
            if !transition(record, JobStatus::Failed) {
                return false;
            }
            record.current_item = None;
            record.error = Some(error);
            true
        })
        .await
    }

    pub async fn mark_cancelled(&self, job_id: Uuid) -> bool {
        self.apply(job_id, |record| {
            if !transition(record, JobStatus::Cancelled) {
                return false;
            }
            record.current_item = None;
            true
        })
        .await
    }

    /// Updates the label of what the job is working on right now.
    pub async fn set_current_item(&self, job_id: Uuid, label: impl Into<String>) {
        let label = label.into();
        self.apply(job_id, |record| {
            if record.status.is_terminal() {
                return false;
            }
            record.current_item = Some(label);
            record.updated_at = Utc::now();
            true
        })
        .await;
    }

    /// Counts one settled member on a collection record. Returns the new
    /// `(completed, total)` pair when applied, `None` when the record is
    /// missing, terminal, or already fully counted.
    pub async fn increment_completed(
        &self,
        job_id: Uuid,
        settled_label: Option<String>,
    ) -> Option<(u32, u32)> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&job_id)?;
        if record.status.is_terminal() {
            return None;
        }
        if record.completed >= record.total {
            warn!(
                job_id = %job_id,
                completed = record.completed,
                total = record.total,
                "completed counter already at total, ignoring increment"
            );
            return None;
        }
        record.completed += 1;
        if let Some(label) = settled_label {
            record.current_item = Some(label);
        }
        record.updated_at = Utc::now();
        Some((record.completed, record.total))
    }

    /// Removes terminal records whose terminal timestamp is older than the
    /// retention window. Returns the number removed.
    pub async fn sweep_terminal(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| match record.terminal_at {
            Some(terminal_at) => terminal_at > cutoff,
            None => true,
        });
        let removed = before - records.len();
        if removed > 0 {
            debug!(removed, remaining = records.len(), "swept expired progress records");
        }
        removed
    }

    async fn apply<F>(&self, job_id: Uuid, mutate: F) -> bool
    where
        F: FnOnce(&mut ProgressRecord) -> bool,
    {
        let mut records = self.records.write().await;
        match records.get_mut(&job_id) {
            Some(record) => mutate(record),
            None => {
                warn!(job_id = %job_id, "progress update for unknown job");
                false
            }
        }
    }
}

/// Applies a state machine edge in place. Returns false without touching
/// the record when the edge is invalid or the record is already terminal.
fn transition(record: &mut ProgressRecord, next: JobStatus) -> bool {
    if record.status.is_terminal() {
        debug!(
            job_id = %record.job_id,
            current = %record.status,
            requested = %next,
            "ignoring transition on terminal record"
        );
        return false;
    }
    if !record.status.can_transition_to(next) {
        warn!(
            job_id = %record.job_id,
            current = %record.status,
            requested = %next,
            "invalid job state transition rejected"
        );
        return false;
    }
    let now = Utc::now();
    record.status = next;
    record.updated_at = now;
    if next.is_terminal() {
        record.terminal_at = Some(now);
    }
    true
}

/// Spawns the retention sweeper. Runs until the shutdown token fires.
pub fn spawn_sweeper(
    store: ProgressStore,
    retention: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // first tick fires immediately; skip it so a fresh start never sweeps
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    store.sweep_terminal(retention).await;
                }
            }
        }
    })
}
