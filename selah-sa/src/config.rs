//! Runtime settings and judgment API key handling
//!
//! Bootstrap config (database path, port) comes from selah-common; this
//! module covers what the analysis service reads from the database settings
//! table at startup. First load persists the defaults, so the table always
//! shows the effective configuration.
//!
//! The judgment API key resolves through three tiers, highest priority
//! first: database setting, `SELAH_JUDGMENT_API_KEY` environment variable,
//! TOML bootstrap file. Keys found outside the database are migrated into
//! it once at startup so the settings endpoint is authoritative afterward.

use std::time::Duration;

use selah_common::config::{default_config_path, write_toml_config, Config};
use selah_common::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::db::settings::{get_or_init, get_setting, set_setting};
use crate::utils::retry::RetryPolicy;

pub const JUDGMENT_KEY_SETTING: &str = "sa_judgment_api_key";
pub const JUDGMENT_KEY_ENV: &str = "SELAH_JUDGMENT_API_KEY";

/// Database-backed settings for the analysis service.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// System-wide cap on concurrently running analysis jobs
    pub max_concurrent_jobs: usize,
    pub judgment_base_url: String,
    pub judgment_model: String,
    pub judgment_timeout: Duration,
    pub judgment_max_attempts: u32,
    pub judgment_retry_base: Duration,
    pub judgment_retry_cap: Duration,
    pub lyrics_base_url: String,
    pub lyrics_timeout: Duration,
    /// How long terminal progress records stay queryable
    pub progress_retention: Duration,
    pub progress_sweep_interval: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            judgment_base_url: "https://api.openai.com/v1".to_string(),
            judgment_model: "gpt-4o-mini".to_string(),
            judgment_timeout: Duration::from_millis(60_000),
            judgment_max_attempts: 4,
            judgment_retry_base: Duration::from_millis(500),
            judgment_retry_cap: Duration::from_millis(8_000),
            lyrics_base_url: "https://lrclib.net/api".to_string(),
            lyrics_timeout: Duration::from_millis(15_000),
            progress_retention: Duration::from_secs(3_600),
            progress_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl RuntimeSettings {
    pub async fn load(pool: &SqlitePool) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_concurrent_jobs: get_or_init(
                pool,
                "sa_max_concurrent_jobs",
                defaults.max_concurrent_jobs,
            )
            .await?,
            judgment_base_url: get_or_init(
                pool,
                "sa_judgment_base_url",
                defaults.judgment_base_url,
            )
            .await?,
            judgment_model: get_or_init(pool, "sa_judgment_model", defaults.judgment_model)
                .await?,
            judgment_timeout: Duration::from_millis(
                get_or_init(
                    pool,
                    "sa_judgment_timeout_ms",
                    defaults.judgment_timeout.as_millis() as u64,
                )
                .await?,
            ),
            judgment_max_attempts: get_or_init(
                pool,
                "sa_judgment_max_attempts",
                defaults.judgment_max_attempts,
            )
            .await?,
            judgment_retry_base: Duration::from_millis(
                get_or_init(
                    pool,
                    "sa_judgment_retry_base_ms",
                    defaults.judgment_retry_base.as_millis() as u64,
                )
                .await?,
            ),
            judgment_retry_cap: Duration::from_millis(
                get_or_init(
                    pool,
                    "sa_judgment_retry_cap_ms",
                    defaults.judgment_retry_cap.as_millis() as u64,
                )
                .await?,
            ),
            lyrics_base_url: get_or_init(pool, "sa_lyrics_base_url", defaults.lyrics_base_url)
                .await?,
            lyrics_timeout: Duration::from_millis(
                get_or_init(
                    pool,
                    "sa_lyrics_timeout_ms",
                    defaults.lyrics_timeout.as_millis() as u64,
                )
                .await?,
            ),
            progress_retention: Duration::from_secs(
                get_or_init(
                    pool,
                    "sa_progress_retention_secs",
                    defaults.progress_retention.as_secs(),
                )
                .await?,
            ),
            progress_sweep_interval: Duration::from_secs(
                get_or_init(
                    pool,
                    "sa_progress_sweep_interval_secs",
                    defaults.progress_sweep_interval.as_secs(),
                )
                .await?,
            ),
        })
    }

    pub fn judgment_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.judgment_max_attempts,
            self.judgment_retry_base,
            self.judgment_retry_cap,
        )
    }
}

/// Basic shape check before a key is accepted or used.
pub fn is_valid_key(key: &str) -> bool {
    let trimmed = key.trim();
    trimmed.len() >= 8 && !trimmed.contains(char::is_whitespace)
}

/// Resolves the judgment API key: database, then environment, then TOML.
/// Returns `None` when no source holds a valid key.
pub async fn resolve_judgment_api_key(
    pool: &SqlitePool,
    toml_key: Option<&str>,
) -> Result<Option<String>> {
    let db_key: Option<String> = get_setting(pool, JUDGMENT_KEY_SETTING)
        .await?
        .filter(|k: &String| is_valid_key(k));
    let env_key = std::env::var(JUDGMENT_KEY_ENV)
        .ok()
        .filter(|k| is_valid_key(k));
    let toml_key = toml_key
        .map(str::to_string)
        .filter(|k| is_valid_key(k));

    let configured_sources = [db_key.is_some(), env_key.is_some(), toml_key.is_some()]
        .into_iter()
        .filter(|present| *present)
        .count();
    if configured_sources > 1 {
        warn!(
            sources = configured_sources,
            "judgment API key configured in multiple sources; database value takes precedence"
        );
    }

    Ok(db_key.or(env_key).or(toml_key))
}

/// One-time startup migration: a key found only in the environment or TOML
/// file is copied into the database so later edits go through one place.
pub async fn migrate_judgment_key_to_db(pool: &SqlitePool, toml_key: Option<&str>) -> Result<()> {
    let existing: Option<String> = get_setting(pool, JUDGMENT_KEY_SETTING).await?;
    if existing.map_or(false, |k| is_valid_key(&k)) {
        return Ok(());
    }

    let fallback = std::env::var(JUDGMENT_KEY_ENV)
        .ok()
        .filter(|k| is_valid_key(k))
        .or_else(|| toml_key.map(str::to_string).filter(|k| is_valid_key(k)));

    if let Some(key) = fallback {
        set_setting(pool, JUDGMENT_KEY_SETTING, key.trim()).await?;
        info!("migrated judgment API key into database settings");
    }
    Ok(())
}

/// Masked form for display: never more than the last four characters.
pub fn mask_key(key: &str) -> String {
    let trimmed = key.trim();
    let chars = trimmed.chars().count();
    if chars <= 4 {
        return "****".to_string();
    }
    let tail: String = trimmed.chars().skip(chars - 4).collect();
    format!("...{tail}")
}

/// Mirrors a newly set key into the bootstrap TOML so it survives a
/// database reset. Failures are reported to the caller but are not fatal
/// to the settings update itself.
pub fn sync_key_to_toml(config: &Config, key: &str) -> Result<()> {
    let path = config
        .config_path
        .clone()
        .unwrap_or_else(default_config_path);
    let mut toml = config.toml.clone();
    toml.judgment_api_key = Some(key.trim().to_string());
    write_toml_config(&toml, &path)?;
    info!(path = %path.display(), "mirrored judgment API key to config file");
    Ok(())
}
