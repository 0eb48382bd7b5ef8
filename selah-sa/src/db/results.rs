//! Analysis result persistence
//!
//! Results are append-only: every analysis run inserts a new row and the
//! most recent `analyzed_at` is the track's current verdict. History stays
//! queryable for audit. Inserts run under the lock-retry policy since they
//! land while other workers hold write transactions.

use chrono::{DateTime, Utc};
use selah_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{AnalysisResult, AppliedAdjustment, Citation, Verdict};
use crate::utils::retry::retry_db_write;

pub async fn insert_result(pool: &SqlitePool, result: &AnalysisResult) -> Result<()> {
    let adjustments = serde_json::to_string(&result.adjustments)
        .map_err(|e| Error::Internal(format!("failed to serialize adjustments: {e}")))?;
    let citations = serde_json::to_string(&result.citations)
        .map_err(|e| Error::Internal(format!("failed to serialize citations: {e}")))?;

    retry_db_write("insert_analysis_result", |_| {
        let pool = pool.clone();
        let guid = result.guid.to_string();
        let track_id = result.track_id.to_string();
        let verdict = result.verdict.as_str();
        let rubric_version = result.rubric_version.clone();
        let analyzed_at = result.analyzed_at.to_rfc3339();
        let adjustments = adjustments.clone();
        let citations = citations.clone();
        let score = result.score;
        let review_flag = result.review_flag;
        async move {
            sqlx::query(
                r#"
                INSERT INTO analysis_results
                    (guid, track_id, score, verdict, review_flag, adjustments,
                     citations, rubric_version, analyzed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(guid)
            .bind(track_id)
            .bind(score as i64)
            .bind(verdict)
            .bind(review_flag)
            .bind(adjustments)
            .bind(citations)
            .bind(rubric_version)
            .bind(analyzed_at)
            .execute(&pool)
            .await
            .map(|_| ())
        }
    })
    .await?;
    Ok(())
}

/// The track's current verdict: latest row by analysis time.
pub async fn latest_for_track(pool: &SqlitePool, track_id: Uuid) -> Result<Option<AnalysisResult>> {
    let row = sqlx::query(
        r#"
        SELECT guid, track_id, score, verdict, review_flag, adjustments,
               citations, rubric_version, analyzed_at
        FROM analysis_results
        WHERE track_id = ?
        ORDER BY analyzed_at DESC
        LIMIT 1
        "#,
    )
    .bind(track_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(result_from_row).transpose()
}

/// All results for a track, newest first.
pub async fn history_for_track(pool: &SqlitePool, track_id: Uuid) -> Result<Vec<AnalysisResult>> {
    let rows = sqlx::query(
        r#"
        SELECT guid, track_id, score, verdict, review_flag, adjustments,
               citations, rubric_version, analyzed_at
        FROM analysis_results
        WHERE track_id = ?
        ORDER BY analyzed_at DESC
        "#,
    )
    .bind(track_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(result_from_row).collect()
}

fn result_from_row(row: SqliteRow) -> Result<AnalysisResult> {
    let guid: String = row.try_get("guid")?;
    let track_id: String = row.try_get("track_id")?;
    let score: i64 = row.try_get("score")?;
    let verdict: String = row.try_get("verdict")?;
    let adjustments: String = row.try_get("adjustments")?;
    let citations: String = row.try_get("citations")?;
    let analyzed_at: String = row.try_get("analyzed_at")?;

    Ok(AnalysisResult {
        guid: Uuid::parse_str(&guid)
            .map_err(|e| Error::Internal(format!("invalid result guid '{guid}': {e}")))?,
        track_id: Uuid::parse_str(&track_id)
            .map_err(|e| Error::Internal(format!("invalid track guid '{track_id}': {e}")))?,
        score: u8::try_from(score)
            .map_err(|_| Error::Internal(format!("stored score {score} out of range")))?,
        verdict: verdict
            .parse::<Verdict>()
            .map_err(Error::Internal)?,
        review_flag: row.try_get("review_flag")?,
        adjustments: serde_json::from_str::<Vec<AppliedAdjustment>>(&adjustments)
            .map_err(|e| Error::Internal(format!("invalid stored adjustments: {e}")))?,
        citations: serde_json::from_str::<Vec<Citation>>(&citations)
            .map_err(|e| Error::Internal(format!("invalid stored citations: {e}")))?,
        rubric_version: row.try_get("rubric_version")?,
        analyzed_at: DateTime::parse_from_rfc3339(&analyzed_at)
            .map_err(|e| Error::Internal(format!("invalid analyzed_at '{analyzed_at}': {e}")))?
            .with_timezone(&Utc),
    })
}
