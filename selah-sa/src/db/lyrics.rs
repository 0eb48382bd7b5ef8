//! Lyrics cache
//!
//! One cached document per track, replaced on refetch. A cache miss or
//! read failure is never fatal to an analysis job; the runner falls back
//! to the provider.

use selah_common::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::services::lyrics_provider::LyricsDocument;

pub async fn get_cached(pool: &SqlitePool, track_id: Uuid) -> Result<Option<LyricsDocument>> {
    let row = sqlx::query("SELECT source, body, synced FROM lyrics_cache WHERE track_id = ?")
        .bind(track_id.to_string())
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|row| {
        Ok::<_, sqlx::Error>(LyricsDocument {
            source: row.try_get("source")?,
            body: row.try_get("body")?,
            synced: row.try_get("synced")?,
        })
    })
    .transpose()?)
}

pub async fn put_cached(pool: &SqlitePool, track_id: Uuid, doc: &LyricsDocument) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO lyrics_cache (track_id, source, body, synced, fetched_at)
        VALUES (?, ?, ?, ?, datetime('now'))
        ON CONFLICT(track_id) DO UPDATE SET
            source = excluded.source,
            body = excluded.body,
            synced = excluded.synced,
            fetched_at = excluded.fetched_at
        "#,
    )
    .bind(track_id.to_string())
    .bind(&doc.source)
    .bind(&doc.body)
    .bind(doc.synced)
    .execute(pool)
    .await?;
    Ok(())
}
