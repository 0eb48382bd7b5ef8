//! Database initialization
//!
//! Opens (or creates) the SQLite database and applies the schema. All
//! CREATE statements are idempotent so startup is safe against an
//! existing database from any prior version.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::{info, warn};

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // Enable foreign keys
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;

    // WAL allows concurrent readers with one writer, which matters when
    // several analysis workers persist results while pollers read status
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    create_settings_table(&pool).await?;
    create_tracks_table(&pool).await?;
    create_playlists_table(&pool).await?;
    create_playlist_tracks_table(&pool).await?;
    create_lyrics_cache_table(&pool).await?;
    create_analysis_results_table(&pool).await?;

    init_default_settings(&pool).await?;

    Ok(pool)
}

/// Create the settings table
///
/// Stores application configuration key-value pairs.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the tracks table
///
/// Synced library tracks. Rows are written by the library sync service;
/// the analysis service only reads them.
pub async fn create_tracks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tracks (
            guid TEXT PRIMARY KEY,
            spotify_id TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            artist TEXT NOT NULL,
            album TEXT,
            duration_ms INTEGER,
            added_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            CHECK (duration_ms IS NULL OR duration_ms > 0)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tracks_spotify_id ON tracks(spotify_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tracks_artist ON tracks(artist)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the playlists table
pub async fn create_playlists_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS playlists (
            guid TEXT PRIMARY KEY,
            spotify_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            owner TEXT,
            snapshot_id TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_playlists_spotify_id ON playlists(spotify_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the playlist membership table
///
/// Position is 0-based within the playlist.
pub async fn create_playlist_tracks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS playlist_tracks (
            playlist_id TEXT NOT NULL REFERENCES playlists(guid) ON DELETE CASCADE,
            track_id TEXT NOT NULL REFERENCES tracks(guid) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (playlist_id, position),
            CHECK (position >= 0)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_playlist_tracks_track ON playlist_tracks(track_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the lyrics cache table
///
/// Read-through cache for fetched lyrics, keyed by track.
pub async fn create_lyrics_cache_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS lyrics_cache (
            track_id TEXT PRIMARY KEY REFERENCES tracks(guid) ON DELETE CASCADE,
            source TEXT NOT NULL,
            body TEXT NOT NULL,
            synced INTEGER NOT NULL DEFAULT 0,
            fetched_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the analysis results table
///
/// Append-only: a re-analysis inserts a new row and supersedes older
/// rows by `analyzed_at`, it never updates in place.
pub async fn create_analysis_results_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_results (
            guid TEXT PRIMARY KEY,
            track_id TEXT NOT NULL REFERENCES tracks(guid) ON DELETE CASCADE,
            score INTEGER NOT NULL,
            verdict TEXT NOT NULL CHECK (verdict IN ('avoid', 'caution', 'acceptable', 'recommended')),
            review_flag INTEGER NOT NULL DEFAULT 0,
            adjustments TEXT NOT NULL,
            citations TEXT NOT NULL,
            rubric_version TEXT NOT NULL,
            analyzed_at TEXT NOT NULL,
            CHECK (score >= 0 AND score <= 100)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_analysis_results_track ON analysis_results(track_id, analyzed_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Initialize or update default settings
///
/// Ensures all required settings exist with default values and resets
/// NULL values back to defaults.
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    // Worker pool
    ensure_setting(pool, "sa_max_concurrent_jobs", "4").await?;

    // Judgment service
    ensure_setting(pool, "sa_judgment_base_url", "https://api.openai.com/v1").await?;
    ensure_setting(pool, "sa_judgment_model", "gpt-4o-mini").await?;
    ensure_setting(pool, "sa_judgment_timeout_ms", "60000").await?;
    ensure_setting(pool, "sa_judgment_max_attempts", "4").await?;
    ensure_setting(pool, "sa_judgment_retry_base_ms", "500").await?;
    ensure_setting(pool, "sa_judgment_retry_cap_ms", "8000").await?;

    // Lyrics provider
    ensure_setting(pool, "sa_lyrics_base_url", "https://lrclib.net/api").await?;
    ensure_setting(pool, "sa_lyrics_timeout_ms", "15000").await?;

    // Progress retention
    ensure_setting(pool, "sa_progress_retention_secs", "3600").await?;
    ensure_setting(pool, "sa_progress_sweep_interval_secs", "60").await?;

    info!("Default settings initialized");
    Ok(())
}

/// Ensure a setting exists with the specified default value
///
/// If the setting doesn't exist, it will be created with the default.
/// If the setting exists but has a NULL value, it will be reset to the default.
async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM settings WHERE key = ?)")
            .bind(key)
            .fetch_one(pool)
            .await?;

    if !exists {
        // INSERT OR IGNORE handles concurrent initialization races:
        // multiple connections may pass the exists check simultaneously
        sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(default_value)
            .execute(pool)
            .await?;

        info!(
            "Initialized setting '{}' with default value: {}",
            key, default_value
        );
        return Ok(());
    }

    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_one(pool)
        .await?;

    if value.is_none() {
        sqlx::query("UPDATE settings SET value = ? WHERE key = ?")
            .bind(default_value)
            .bind(key)
            .execute(pool)
            .await?;

        warn!("Setting '{}' was NULL, reset to default: {}", key, default_value);
    }

    Ok(())
}
