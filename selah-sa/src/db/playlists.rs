//! Playlist queries
//!
//! Membership is position-ordered. Collection submission reads the member
//! list once as a snapshot; later playlist edits do not affect a running
//! collection job.

use selah_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::tracks::{track_from_row, Track};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Playlist {
    pub guid: Uuid,
    pub spotify_id: String,
    pub name: String,
    pub owner: Option<String>,
    pub snapshot_id: Option<String>,
}

pub async fn get_playlist(pool: &SqlitePool, playlist_id: Uuid) -> Result<Option<Playlist>> {
    let row = sqlx::query(
        "SELECT guid, spotify_id, name, owner, snapshot_id FROM playlists WHERE guid = ?",
    )
    .bind(playlist_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(|row| {
        let guid: String = row.try_get("guid")?;
        Ok(Playlist {
            guid: Uuid::parse_str(&guid)
                .map_err(|e| Error::Internal(format!("invalid playlist guid '{guid}': {e}")))?,
            spotify_id: row.try_get("spotify_id")?,
            name: row.try_get("name")?,
            owner: row.try_get("owner")?,
            snapshot_id: row.try_get("snapshot_id")?,
        })
    })
    .transpose()
}

/// Member tracks in playlist order.
pub async fn playlist_members(pool: &SqlitePool, playlist_id: Uuid) -> Result<Vec<Track>> {
    let rows = sqlx::query(
        r#"
        SELECT t.guid, t.spotify_id, t.title, t.artist, t.album, t.duration_ms
        FROM playlist_tracks pt
        JOIN tracks t ON t.guid = pt.track_id
        WHERE pt.playlist_id = ?
        ORDER BY pt.position
        "#,
    )
    .bind(playlist_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(track_from_row).collect()
}

pub async fn upsert_playlist(pool: &SqlitePool, playlist: &Playlist) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO playlists (guid, spotify_id, name, owner, snapshot_id)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(spotify_id) DO UPDATE SET
            name = excluded.name,
            owner = excluded.owner,
            snapshot_id = excluded.snapshot_id,
            updated_at = datetime('now')
        "#,
    )
    .bind(playlist.guid.to_string())
    .bind(&playlist.spotify_id)
    .bind(&playlist.name)
    .bind(&playlist.owner)
    .bind(&playlist.snapshot_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Replaces a playlist's membership with the given tracks in order.
pub async fn set_playlist_tracks(
    pool: &SqlitePool,
    playlist_id: Uuid,
    track_ids: &[Uuid],
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM playlist_tracks WHERE playlist_id = ?")
        .bind(playlist_id.to_string())
        .execute(&mut *tx)
        .await?;

    for (position, track_id) in track_ids.iter().enumerate() {
        sqlx::query(
            "INSERT INTO playlist_tracks (playlist_id, track_id, position) VALUES (?, ?, ?)",
        )
        .bind(playlist_id.to_string())
        .bind(track_id.to_string())
        .bind(position as i64)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}
