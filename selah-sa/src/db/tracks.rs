//! Track queries
//!
//! Guids are stored as hyphenated TEXT, so rows are read as strings and
//! parsed rather than decoded directly into `Uuid`.

use selah_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Library track as the analysis service sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub guid: Uuid,
    pub spotify_id: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub duration_ms: Option<i64>,
}

impl Track {
    /// Label used in progress reporting and logs.
    pub fn display_label(&self) -> String {
        format!("{} - {}", self.artist, self.title)
    }
}

pub async fn get_track(pool: &SqlitePool, track_id: Uuid) -> Result<Option<Track>> {
    let row = sqlx::query(
        "SELECT guid, spotify_id, title, artist, album, duration_ms FROM tracks WHERE guid = ?",
    )
    .bind(track_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(track_from_row).transpose()
}

pub async fn upsert_track(pool: &SqlitePool, track: &Track) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tracks (guid, spotify_id, title, artist, album, duration_ms)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(spotify_id) DO UPDATE SET
            title = excluded.title,
            artist = excluded.artist,
            album = excluded.album,
            duration_ms = excluded.duration_ms,
            updated_at = datetime('now')
        "#,
    )
    .bind(track.guid.to_string())
    .bind(&track.spotify_id)
    .bind(&track.title)
    .bind(&track.artist)
    .bind(&track.album)
    .bind(track.duration_ms)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) fn track_from_row(row: SqliteRow) -> Result<Track> {
    let guid: String = row.try_get("guid")?;
    Ok(Track {
        guid: Uuid::parse_str(&guid)
            .map_err(|e| Error::Internal(format!("invalid track guid '{guid}': {e}")))?,
        spotify_id: row.try_get("spotify_id")?,
        title: row.try_get("title")?,
        artist: row.try_get("artist")?,
        album: row.try_get("album")?,
        duration_ms: row.try_get("duration_ms")?,
    })
}
