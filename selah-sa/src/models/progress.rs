//! Job progress state machine and status snapshots
//!
//! Every job, item or collection, owns one `ProgressRecord` in the progress
//! store. The record is the single source of truth for job state: submission
//! creates it, the runner advances it, and status queries read it without
//! ever touching in-flight work.
//!
//! State machine:
//!
//! ```text
//! Queued -> Started -> Finished
//!    |         |-----> Failed
//!    |         `-----> Cancelled
//!    |-----> Failed
//!    `-----> Cancelled
//! ```
//!
//! Terminal states are immutable. A transition attempted against a terminal
//! record is a no-op, which makes cancellation idempotent and prevents a
//! late worker write from demoting a Finished job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::AnalysisTarget;
use super::result::Verdict;

/// Lifecycle state of an analysis job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted, waiting for a worker slot
    Queued,
    /// A worker is processing the job
    Started,
    /// Completed successfully (for collections: all members settled)
    Finished,
    /// Terminal failure, `error` carries the reason code
    Failed,
    /// Stopped at a cancellation checkpoint before completing
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Validates a state machine edge. Terminal states have no outgoing
    /// edges; Queued may settle directly without ever starting (for example
    /// a child cancelled while waiting for a worker slot).
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Queued, JobStatus::Started)
            | (JobStatus::Queued, JobStatus::Failed)
            | (JobStatus::Queued, JobStatus::Cancelled)
            | (JobStatus::Started, JobStatus::Finished)
            | (JobStatus::Started, JobStatus::Failed)
            | (JobStatus::Started, JobStatus::Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Compact result carried on a finished item job's progress record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub score: u8,
    pub verdict: Verdict,
}

/// Mutable progress state for one job.
#[derive(Debug, Clone)]
pub struct ProgressRecord {
    pub job_id: Uuid,
    pub target: AnalysisTarget,
    /// Collection job this item belongs to, if any
    pub parent: Option<Uuid>,
    pub status: JobStatus,
    /// Settled work units. Item jobs flip 0 -> 1 on Finished; collection
    /// jobs count settled members. Never decremented.
    pub completed: u32,
    /// Total work units: 1 for item jobs, member count for collections.
    /// Fixed at creation from the membership snapshot.
    pub total: u32,
    /// Human-readable label of what is being worked on right now
    pub current_item: Option<String>,
    /// Reason string, only set when status is Failed
    pub error: Option<String>,
    /// Score summary, only set when an item job finishes
    pub result: Option<ResultSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once when the record enters a terminal state; drives retention GC
    pub terminal_at: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    /// New record for a single-track job.
    pub fn new_item(job_id: Uuid, target: AnalysisTarget, parent: Option<Uuid>) -> Self {
        Self::new(job_id, target, parent, 1)
    }

    /// New record for a collection job over `total` members.
    pub fn new_collection(job_id: Uuid, target: AnalysisTarget, total: u32) -> Self {
        Self::new(job_id, target, None, total)
    }

    fn new(job_id: Uuid, target: AnalysisTarget, parent: Option<Uuid>, total: u32) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            target,
            parent,
            status: JobStatus::Queued,
            completed: 0,
            total,
            current_item: None,
            error: None,
            result: None,
            created_at: now,
            updated_at: now,
            terminal_at: None,
        }
    }

    /// Percentage is always derived from the counters, never stored.
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.completed as f64 / self.total as f64) * 100.0
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            job_id: self.job_id,
            target: self.target,
            status: self.status,
            progress: ProgressCounters {
                completed: self.completed,
                total: self.total,
                percentage: self.percentage(),
                current_item: self.current_item.clone(),
            },
            result: self.result,
            error: self.error.clone(),
        }
    }
}

/// Derived progress counters as reported to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressCounters {
    pub completed: u32,
    pub total: u32,
    pub percentage: f64,
    pub current_item: Option<String>,
}

/// Point-in-time view of a job, safe to hand out while the job runs.
///
/// `result` is populated only for finished item jobs and `error` only for
/// failed jobs; both serialize as explicit nulls otherwise so the response
/// shape is stable across states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: Uuid,
    pub target: AnalysisTarget,
    pub status: JobStatus,
    pub progress: ProgressCounters,
    pub result: Option<ResultSummary>,
    pub error: Option<String>,
}
