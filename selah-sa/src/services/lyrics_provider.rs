//! Lyrics content provider
//!
//! `LyricsProvider` is the seam between the job runner and the outside
//! world: production uses the LRCLIB client, tests inject a scripted stub.
//! A provider answering `Ok(None)` means the track has no usable lyrics,
//! which the runner records as a terminal content-unavailable failure
//! rather than retrying; absence is not a transient condition.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::db::tracks::Track;

const USER_AGENT: &str = concat!("Selah/", env!("CARGO_PKG_VERSION"));

/// Minimum spacing between LRCLIB requests.
const RATE_LIMIT_MS: u64 = 500;

/// Lyrics text retrieved for a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LyricsDocument {
    /// Provider identifier, stored with the cache row
    pub source: String,
    pub body: String,
    /// True when the body carries timestamped (LRC) lines
    pub synced: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum LyricsError {
    #[error("lyrics request timed out")]
    Timeout,
    #[error("lyrics request failed: {0}")]
    Network(String),
    #[error("lyrics service returned HTTP {0}")]
    Api(u16),
    #[error("unexpected lyrics payload: {0}")]
    Parse(String),
}

#[async_trait]
pub trait LyricsProvider: Send + Sync {
    /// Fetches lyrics for a track. `Ok(None)` means the provider has no
    /// usable lyrics (not found, or an instrumental).
    async fn fetch(&self, track: &Track) -> Result<Option<LyricsDocument>, LyricsError>;
}

/// Paces outbound requests to respect the provider's service limits.
struct RateLimiter {
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            last_request: Mutex::new(None),
            min_interval,
        }
    }

    async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// LRCLIB (lrclib.net) lyrics client.
pub struct LrclibClient {
    http: reqwest::Client,
    base_url: String,
    rate_limiter: RateLimiter,
}

impl LrclibClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> selah_common::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| {
                selah_common::Error::Internal(format!("failed to build lyrics HTTP client: {e}"))
            })?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            rate_limiter: RateLimiter::new(Duration::from_millis(RATE_LIMIT_MS)),
        })
    }
}

/// Wire shape of an LRCLIB lookup response.
#[derive(Debug, Deserialize)]
struct LrclibResponse {
    #[serde(rename = "plainLyrics")]
    plain_lyrics: Option<String>,
    #[serde(rename = "syncedLyrics")]
    synced_lyrics: Option<String>,
    #[serde(default)]
    instrumental: bool,
}

impl LrclibResponse {
    /// Prefers plain lyrics; falls back to the synced body when that is all
    /// the catalog has. Instrumentals carry no judgeable text.
    fn into_document(self) -> Option<LyricsDocument> {
        if self.instrumental {
            return None;
        }
        if let Some(plain) = self.plain_lyrics.filter(|s| !s.trim().is_empty()) {
            return Some(LyricsDocument {
                source: "lrclib".to_string(),
                body: plain,
                synced: false,
            });
        }
        if let Some(synced) = self.synced_lyrics.filter(|s| !s.trim().is_empty()) {
            return Some(LyricsDocument {
                source: "lrclib".to_string(),
                body: synced,
                synced: true,
            });
        }
        None
    }
}

#[async_trait]
impl LyricsProvider for LrclibClient {
    async fn fetch(&self, track: &Track) -> Result<Option<LyricsDocument>, LyricsError> {
        self.rate_limiter.wait().await;

        let mut query: Vec<(&str, String)> = vec![
            ("track_name", track.title.clone()),
            ("artist_name", track.artist.clone()),
        ];
        if let Some(album) = &track.album {
            query.push(("album_name", album.clone()));
        }
        if let Some(duration_ms) = track.duration_ms {
            query.push(("duration", (duration_ms / 1000).to_string()));
        }

        let url = format!("{}/get", self.base_url);
        debug!(track = %track.title, artist = %track.artist, "looking up lyrics");

        let response = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LyricsError::Timeout
                } else {
                    LyricsError::Network(e.to_string())
                }
            })?;

        match response.status().as_u16() {
            404 => Ok(None),
            status if status >= 400 => Err(LyricsError::Api(status)),
            _ => {
                let parsed: LrclibResponse = response
                    .json()
                    .await
                    .map_err(|e| LyricsError::Parse(e.to_string()))?;
                Ok(parsed.into_document())
            }
        }
    }
}
