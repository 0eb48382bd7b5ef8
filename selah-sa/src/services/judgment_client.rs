//! Judgment service client
//!
//! Sends lyrics plus the scoring rubric to an OpenAI-compatible
//! chat-completions endpoint and parses the structured assessment out of
//! the reply. The error enum separates transient transport conditions
//! (worth retrying) from rejected requests and malformed output (terminal,
//! a retry would return the same thing).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::debug;

use crate::config::resolve_judgment_api_key;
use crate::models::RawAssessment;

/// Rubric prompt sent as the system message. Instructs the judgment model
/// to return the assessment as a single JSON object the parser understands.
pub const DEFAULT_RUBRIC: &str = r#"You are a lyrical content assessor for a Christian listening context. Read the song lyrics supplied by the user and evaluate their spiritual and thematic content.

Respond with exactly one JSON object, no surrounding prose, with these fields:

- "base_score": number 0-100, your overall alignment sub-score before theme adjustments. 50 is neutral.
- "narrative_voice": one of "direct" (singer speaks as themselves), "collective" (congregational we), "character" (singer inhabits a persona), "declarative" (third-person statements about the world).
- "distress_posture": one of "none", "addressed_lament" (distress voiced toward a hoped-for hearer), "glorified" (darkness presented as desirable).
- "spiritual_framing": one of "explicit", "ambiguous" (could read either way), "secular".
- "themes": array of detected themes, each {"label": string, "weight": number, "negative_affect": bool, "flagged": bool}. Weight is signed, -100..100: positive raises the score, negative lowers it. Set "negative_affect" true for sorrow/grief/distress themes. Set "flagged" true for categories a reviewer must see (occult, explicit content, glorified violence).
- "citations": array of {"reference": string, "quote": string} quoting the lyric lines your assessment rests on. Cite evidence for every substantive claim.
"#;

#[derive(Debug, thiserror::Error)]
pub enum JudgmentError {
    #[error("judgment request timed out")]
    Timeout,
    #[error("judgment service rate limited the request")]
    RateLimited,
    #[error("judgment request failed: {0}")]
    Network(String),
    #[error("judgment service returned HTTP {status}: {detail}")]
    Api { status: u16, detail: String },
    #[error("judgment output malformed: {0}")]
    Malformed(String),
    #[error("judgment API key is not configured")]
    NotConfigured,
}

impl JudgmentError {
    /// Transient errors are retried under the backoff policy; everything
    /// else terminates the job immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            JudgmentError::Timeout | JudgmentError::RateLimited | JudgmentError::Network(_) => true,
            JudgmentError::Api { status, .. } => *status >= 500,
            JudgmentError::Malformed(_) | JudgmentError::NotConfigured => false,
        }
    }
}

#[async_trait]
pub trait JudgmentService: Send + Sync {
    /// Assesses lyrics under a rubric, returning the structured judgment.
    async fn assess(&self, lyrics: &str, rubric: &str) -> Result<RawAssessment, JudgmentError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Chat-completions judgment client for OpenAI-compatible endpoints.
///
/// The API key is resolved per request (database, then environment, then
/// bootstrap TOML), so a key set at runtime through the settings endpoint
/// takes effect without a restart. The lookup is one settings read per
/// track, noise next to the judgment call itself.
pub struct OpenAiJudgmentClient {
    http: reqwest::Client,
    db: SqlitePool,
    base_url: String,
    model: String,
    toml_key: Option<String>,
}

impl OpenAiJudgmentClient {
    pub fn new(
        db: SqlitePool,
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
        toml_key: Option<String>,
    ) -> selah_common::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                selah_common::Error::Internal(format!("failed to build judgment HTTP client: {e}"))
            })?;
        Ok(Self {
            http,
            db,
            base_url: base_url.into(),
            model: model.into(),
            toml_key,
        })
    }
}

#[async_trait]
impl JudgmentService for OpenAiJudgmentClient {
    async fn assess(&self, lyrics: &str, rubric: &str) -> Result<RawAssessment, JudgmentError> {
        let api_key = resolve_judgment_api_key(&self.db, self.toml_key.as_deref())
            .await
            .map_err(|e| JudgmentError::Network(e.to_string()))?
            .ok_or(JudgmentError::NotConfigured)?;

        let user_message = format!("Assess the following song lyrics.\n\n{lyrics}");
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: rubric,
                },
                ChatMessage {
                    role: "user",
                    content: &user_message,
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let url = format!("{}/chat/completions", self.base_url);
        debug!(model = %self.model, "requesting judgment");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    JudgmentError::Timeout
                } else {
                    JudgmentError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(JudgmentError::RateLimited);
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(JudgmentError::Api {
                status: status.as_u16(),
                detail: truncate_detail(&detail),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| JudgmentError::Malformed(format!("invalid response envelope: {e}")))?;
        let content = parsed
            .choices
            .first()
            .map(|choice| choice.message.content.as_str())
            .ok_or_else(|| JudgmentError::Malformed("response contained no choices".to_string()))?;

        parse_assessment(content)
    }
}

/// Parses and validates the assessment JSON from the model's reply text.
pub fn parse_assessment(content: &str) -> Result<RawAssessment, JudgmentError> {
    let body = strip_code_fences(content);
    let assessment: RawAssessment = serde_json::from_str(body)
        .map_err(|e| JudgmentError::Malformed(format!("invalid assessment JSON: {e}")))?;
    assessment.validate().map_err(JudgmentError::Malformed)?;
    Ok(assessment)
}

/// Models occasionally wrap JSON in a markdown fence despite instructions.
fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}

fn truncate_detail(detail: &str) -> String {
    const MAX: usize = 300;
    if detail.len() <= MAX {
        return detail.to_string();
    }
    // back off to a char boundary before slicing
    let mut end = MAX;
    while !detail.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &detail[..end])
}
