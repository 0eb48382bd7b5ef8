//! Analysis API handlers
//!
//! Submission, polling, and cancellation for track and playlist analysis
//! jobs, plus read access to persisted results.
//!
//! Submission is idempotent per target: re-submitting an in-flight target
//! answers 200 with the existing handle instead of 202 with a new one, so
//! clients can re-POST freely after a timeout without double-analyzing.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::{AnalysisResult, AnalysisTarget, JobHandle, ProgressSnapshot};
use crate::AppState;

/// Submission response body, shared by track and playlist submission.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub target: AnalysisTarget,
    /// False when an in-flight job was returned instead of a new one
    pub created: bool,
}

impl From<JobHandle> for SubmitResponse {
    fn from(handle: JobHandle) -> Self {
        Self {
            job_id: handle.job_id,
            target: handle.target,
            created: handle.created,
        }
    }
}

/// POST /analysis/track/{track_id}
///
/// Queue analysis of one track. 202 with a fresh handle, or 200 with the
/// existing handle when the track is already being analyzed.
pub async fn submit_track(
    State(state): State<AppState>,
    Path(track_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let handle = state.orchestrator.submit_track(track_id).await?;
    let status = if handle.created {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(handle.into())))
}

/// POST /analysis/playlist/{playlist_id}
///
/// Queue analysis of every track in a playlist as one collection job.
/// 422 when the playlist has no members; member snapshot is taken now.
pub async fn submit_playlist(
    State(state): State<AppState>,
    Path(playlist_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let handle = state.orchestrator.submit_playlist(playlist_id).await?;
    let status = if handle.created {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(handle.into())))
}

/// GET /analysis/status/{job_id}
///
/// Poll job progress. Read-only snapshot; never blocks on running work.
pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<ProgressSnapshot>> {
    state
        .orchestrator
        .status(job_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id} not found")))
}

/// POST /analysis/cancel/{job_id}
///
/// Request cooperative cancellation. The response snapshot reflects the
/// state after the cancel was applied; a job already terminal is returned
/// as-is.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<ProgressSnapshot>> {
    let snapshot = state.orchestrator.cancel(job_id).await?;
    Ok(Json(snapshot))
}

/// GET /analysis/jobs
///
/// All non-terminal jobs, oldest first.
pub async fn active_jobs(State(state): State<AppState>) -> Json<Vec<ProgressSnapshot>> {
    Json(state.orchestrator.active_jobs().await)
}

/// GET /tracks/{track_id}/result
///
/// The track's current verdict: its most recent persisted result.
pub async fn latest_result(
    State(state): State<AppState>,
    Path(track_id): Path<Uuid>,
) -> ApiResult<Json<AnalysisResult>> {
    crate::db::results::latest_for_track(&state.db, track_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no analysis result for track {track_id}")))
}

/// GET /tracks/{track_id}/history
///
/// Every persisted result for the track, newest first. Re-analysis
/// supersedes rather than overwrites, so the chain stays auditable.
pub async fn result_history(
    State(state): State<AppState>,
    Path(track_id): Path<Uuid>,
) -> ApiResult<Json<Vec<AnalysisResult>>> {
    let history = crate::db::results::history_for_track(&state.db, track_id).await?;
    Ok(Json(history))
}

/// Build analysis routes
pub fn analysis_routes() -> Router<AppState> {
    Router::new()
        .route("/analysis/track/:track_id", post(submit_track))
        .route("/analysis/playlist/:playlist_id", post(submit_playlist))
        .route("/analysis/status/:job_id", get(job_status))
        .route("/analysis/cancel/:job_id", post(cancel_job))
        .route("/analysis/jobs", get(active_jobs))
        .route("/tracks/:track_id/result", get(latest_result))
        .route("/tracks/:track_id/history", get(result_history))
}
