//! Per-track analysis worker
//!
//! Drives one item job from queued to terminal: acquire a worker slot,
//! fetch lyrics (cache first), obtain a judgment under the retry policy,
//! normalize the score, persist the result, and settle the progress record.
//!
//! Cancellation is cooperative. The token is checked at every step boundary
//! and between judgment attempts; a step already underway runs to its end.
//! Once the runner is past its last checkpoint the job completes even if
//! cancellation arrives during the final write.
//!
//! Every terminal path writes the progress record before emitting its
//! event, and a settled member reports to its parent collection in the
//! same breath so the aggregate counter tracks reality.

use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use selah_common::events::{EventBus, SelahEvent};

use crate::db;
use crate::db::tracks::Track;
use crate::models::{AnalysisResult, ResultSummary, RUBRIC_VERSION};
use crate::services::judgment_client::{JudgmentError, JudgmentService, DEFAULT_RUBRIC};
use crate::services::lyrics_provider::{LyricsDocument, LyricsProvider};
use crate::services::normalizer::{normalize, NormalizeError};
use crate::services::progress_store::ProgressStore;
use crate::utils::retry::{retry_with_policy, RetryError, RetryPolicy};

/// Work order for one item job.
pub struct ItemJob {
    pub job_id: Uuid,
    pub track: Track,
    /// Collection this item settles into, if any
    pub parent: Option<Uuid>,
    pub cancel: CancellationToken,
}

/// Terminal failure reasons, each with a stable code surfaced in the
/// progress record's error string and the failure event.
#[derive(Debug)]
pub enum ItemFailure {
    /// No lyrics could be obtained; not retried, absence is not transient
    ContentUnavailable(String),
    /// Judgment service unusable after retries, or rejected the request
    JudgmentUnavailable(String),
    /// Judgment replied with output the parser or validator rejected
    MalformedOutput(String),
    /// The assessment supports its verdict with no citations
    MissingCitation(String),
    Internal(String),
}

impl ItemFailure {
    pub fn code(&self) -> &'static str {
        match self {
            ItemFailure::ContentUnavailable(_) => "CONTENT_UNAVAILABLE",
            ItemFailure::JudgmentUnavailable(_) => "JUDGMENT_UNAVAILABLE",
            ItemFailure::MalformedOutput(_) => "MALFORMED_OUTPUT",
            ItemFailure::MissingCitation(_) => "MISSING_CITATION",
            ItemFailure::Internal(_) => "INTERNAL",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ItemFailure::ContentUnavailable(m)
            | ItemFailure::JudgmentUnavailable(m)
            | ItemFailure::MalformedOutput(m)
            | ItemFailure::MissingCitation(m)
            | ItemFailure::Internal(m) => m,
        }
    }

    /// Error string stored on the progress record: "CODE: detail".
    pub fn to_error_string(&self) -> String {
        format!("{}: {}", self.code(), self.message())
    }
}

enum RunError {
    Cancelled,
    Failed(ItemFailure),
}

#[derive(Clone)]
pub struct JobRunner {
    db: SqlitePool,
    store: ProgressStore,
    event_bus: EventBus,
    lyrics: Arc<dyn LyricsProvider>,
    judgment: Arc<dyn JudgmentService>,
    slots: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl JobRunner {
    pub fn new(
        db: SqlitePool,
        store: ProgressStore,
        event_bus: EventBus,
        lyrics: Arc<dyn LyricsProvider>,
        judgment: Arc<dyn JudgmentService>,
        slots: Arc<Semaphore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            store,
            event_bus,
            lyrics,
            judgment,
            slots,
            retry,
        }
    }

    /// Runs one item job to a terminal state. Never panics out; every exit
    /// path settles the progress record.
    pub async fn run_item(&self, job: ItemJob) {
        // Queued until a worker slot frees up. Cancellation while waiting
        // settles the job without it ever starting.
        let _permit = tokio::select! {
            _ = job.cancel.cancelled() => {
                self.settle_cancelled(&job).await;
                return;
            }
            permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.settle_failed(&job, ItemFailure::Internal("worker pool closed".to_string()))
                        .await;
                    return;
                }
            }
        };
        if job.cancel.is_cancelled() {
            self.settle_cancelled(&job).await;
            return;
        }

        if !self.store.mark_started(job.job_id).await {
            // record went terminal while we waited (cancel already settled it)
            return;
        }
        self.event_bus.emit_lossy(SelahEvent::AnalysisJobStarted {
            job_id: job.job_id,
            timestamp: Utc::now(),
        });
        debug!(job_id = %job.job_id, track = %job.track.display_label(), "analysis started");

        match self.execute(&job).await {
            Ok(result) => self.settle_finished(&job, result).await,
            Err(RunError::Cancelled) => self.settle_cancelled(&job).await,
            Err(RunError::Failed(failure)) => self.settle_failed(&job, failure).await,
        }
    }

    async fn execute(&self, job: &ItemJob) -> Result<AnalysisResult, RunError> {
        self.store
            .set_current_item(job.job_id, "fetching lyrics")
            .await;
        let content = self
            .fetch_content(&job.track)
            .await
            .map_err(RunError::Failed)?;
        if job.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let assessment = self.obtain_judgment(job, &content).await?;
        if job.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        self.store
            .set_current_item(job.job_id, "normalizing score")
            .await;
        let normalized = normalize(&assessment).map_err(|e| match e {
            NormalizeError::MissingCitation { .. } => {
                RunError::Failed(ItemFailure::MissingCitation(e.to_string()))
            }
        })?;
        if job.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        self.store
            .set_current_item(job.job_id, "persisting result")
            .await;
        let result = AnalysisResult {
            guid: Uuid::new_v4(),
            track_id: job.track.guid,
            score: normalized.score,
            verdict: normalized.verdict,
            review_flag: normalized.review_flag,
            adjustments: normalized.adjustments,
            citations: assessment.citations.clone(),
            rubric_version: RUBRIC_VERSION.to_string(),
            analyzed_at: Utc::now(),
        };
        db::results::insert_result(&self.db, &result)
            .await
            .map_err(|e| {
                RunError::Failed(ItemFailure::Internal(format!(
                    "failed to persist result: {e}"
                )))
            })?;

        Ok(result)
    }

    /// Lyrics lookup: cache, then provider. Cache trouble degrades to a
    /// provider fetch; only the provider having nothing fails the job.
    async fn fetch_content(&self, track: &Track) -> Result<LyricsDocument, ItemFailure> {
        match db::lyrics::get_cached(&self.db, track.guid).await {
            Ok(Some(doc)) => {
                debug!(track = %track.display_label(), "lyrics cache hit");
                return Ok(doc);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(track = %track.display_label(), error = %e, "lyrics cache read failed, fetching");
            }
        }

        match self.lyrics.fetch(track).await {
            Ok(Some(doc)) => {
                if let Err(e) = db::lyrics::put_cached(&self.db, track.guid, &doc).await {
                    warn!(track = %track.display_label(), error = %e, "failed to cache lyrics");
                }
                Ok(doc)
            }
            Ok(None) => Err(ItemFailure::ContentUnavailable(format!(
                "no lyrics available for {}",
                track.display_label()
            ))),
            Err(e) => Err(ItemFailure::ContentUnavailable(format!(
                "lyrics fetch failed for {}: {e}",
                track.display_label()
            ))),
        }
    }

    async fn obtain_judgment(
        &self,
        job: &ItemJob,
        content: &LyricsDocument,
    ) -> Result<crate::models::RawAssessment, RunError> {
        let store = self.store.clone();
        let judgment = Arc::clone(&self.judgment);
        let body = content.body.clone();
        let job_id = job.job_id;
        let max_attempts = self.retry.max_attempts;

        let outcome = retry_with_policy(
            "judgment",
            &self.retry,
            Some(&job.cancel),
            JudgmentError::is_transient,
            move |attempt| {
                let store = store.clone();
                let judgment = Arc::clone(&judgment);
                let body = body.clone();
                async move {
                    store
                        .set_current_item(
                            job_id,
                            format!("awaiting judgment (attempt {attempt}/{max_attempts})"),
                        )
                        .await;
                    judgment.assess(&body, DEFAULT_RUBRIC).await
                }
            },
        )
        .await;

        match outcome {
            Ok(assessment) => Ok(assessment),
            Err(RetryError::Cancelled) => Err(RunError::Cancelled),
            Err(RetryError::Exhausted { attempts, source }) => {
                Err(RunError::Failed(ItemFailure::JudgmentUnavailable(format!(
                    "judgment failed after {attempts} attempts: {source}"
                ))))
            }
            Err(RetryError::Fatal(e)) => Err(RunError::Failed(match e {
                JudgmentError::Malformed(detail) => ItemFailure::MalformedOutput(detail),
                other => ItemFailure::JudgmentUnavailable(other.to_string()),
            })),
        }
    }

    async fn settle_finished(&self, job: &ItemJob, result: AnalysisResult) {
        let summary = ResultSummary {
            score: result.score,
            verdict: result.verdict,
        };
        if !self.store.finish_item(job.job_id, summary).await {
            // cancel won the race after the final checkpoint; the result row
            // is persisted but this job's record stays cancelled
            return;
        }
        info!(
            job_id = %job.job_id,
            track = %job.track.display_label(),
            score = result.score,
            verdict = %result.verdict,
            "analysis finished"
        );
        self.report_settled_to_parent(job).await;
        self.event_bus.emit_lossy(SelahEvent::AnalysisJobFinished {
            job_id: job.job_id,
            track_id: Some(result.track_id),
            score: Some(result.score),
            verdict: Some(result.verdict.as_str().to_string()),
            timestamp: Utc::now(),
        });
    }

    async fn settle_failed(&self, job: &ItemJob, failure: ItemFailure) {
        if !self.store.mark_failed(job.job_id, failure.to_error_string()).await {
            return;
        }
        warn!(
            job_id = %job.job_id,
            track = %job.track.display_label(),
            code = failure.code(),
            error = failure.message(),
            "analysis failed"
        );
        // a failed member still counts as settled for its collection
        self.report_settled_to_parent(job).await;
        self.event_bus.emit_lossy(SelahEvent::AnalysisJobFailed {
            job_id: job.job_id,
            code: failure.code().to_string(),
            message: failure.message().to_string(),
            timestamp: Utc::now(),
        });
    }

    async fn settle_cancelled(&self, job: &ItemJob) {
        if !self.store.mark_cancelled(job.job_id).await {
            return;
        }
        debug!(job_id = %job.job_id, "analysis cancelled");
        self.event_bus.emit_lossy(SelahEvent::AnalysisJobCancelled {
            job_id: job.job_id,
            timestamp: Utc::now(),
        });
    }

    async fn report_settled_to_parent(&self, job: &ItemJob) {
        let Some(parent) = job.parent else {
            return;
        };
        if let Some((completed, total)) = self
            .store
            .increment_completed(parent, Some(job.track.display_label()))
            .await
        {
            self.event_bus.emit_lossy(SelahEvent::AnalysisJobProgress {
                job_id: parent,
                completed,
                total,
                current_item: Some(job.track.display_label()),
                timestamp: Utc::now(),
            });
        }
    }
}
