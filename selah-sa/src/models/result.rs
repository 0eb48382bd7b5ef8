//! Persisted analysis result and verdict mapping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::assessment::Citation;

/// Version tag stored with every result so historical rows remain
/// interpretable after scoring rules change.
pub const RUBRIC_VERSION: &str = "2025.2";

/// Recommendation tier derived from the final score.
///
/// Breakpoints are inclusive lower bounds: 40 maps to Caution, 60 to
/// Acceptable, 80 to Recommended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Avoid,
    Caution,
    Acceptable,
    Recommended,
}

impl Verdict {
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=39 => Verdict::Avoid,
            40..=59 => Verdict::Caution,
            60..=79 => Verdict::Acceptable,
            _ => Verdict::Recommended,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Avoid => "avoid",
            Verdict::Caution => "caution",
            Verdict::Acceptable => "acceptable",
            Verdict::Recommended => "recommended",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avoid" => Ok(Verdict::Avoid),
            "caution" => Ok(Verdict::Caution),
            "acceptable" => Ok(Verdict::Acceptable),
            "recommended" => Ok(Verdict::Recommended),
            other => Err(format!("unknown verdict '{other}'")),
        }
    }
}

/// Which normalization rule produced an adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentRule {
    /// Character voice dampens negative theme weights
    VoiceDampening,
    /// Declarative voice scores normally but is flagged for human review
    DeclarativeReview,
    /// Addressed lament suppresses negative-affect penalties
    LamentException,
    /// Ambiguous spiritual framing caps the score
    AmbiguityCeiling,
    /// Neutral secular content with no strong signal lands in a fixed band
    NeutralFloor,
}

impl AdjustmentRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentRule::VoiceDampening => "voice_dampening",
            AdjustmentRule::DeclarativeReview => "declarative_review",
            AdjustmentRule::LamentException => "lament_exception",
            AdjustmentRule::AmbiguityCeiling => "ambiguity_ceiling",
            AdjustmentRule::NeutralFloor => "neutral_floor",
        }
    }
}

/// One normalization rule application, recorded for explainability.
///
/// Only rules that actually changed something are recorded, so the trace
/// reads as the delta between the raw assessment and the published score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedAdjustment {
    pub rule: AdjustmentRule,
    pub detail: String,
}

impl AppliedAdjustment {
    pub fn new(rule: AdjustmentRule, detail: impl Into<String>) -> Self {
        Self {
            rule,
            detail: detail.into(),
        }
    }
}

/// Final, persisted analysis verdict for one track.
///
/// Results are append-only: re-analysis inserts a new row and the latest
/// `analyzed_at` wins. History remains queryable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub guid: Uuid,
    pub track_id: Uuid,
    pub score: u8,
    pub verdict: Verdict,
    /// Set when a human should double-check the verdict (declarative voice)
    pub review_flag: bool,
    pub adjustments: Vec<AppliedAdjustment>,
    pub citations: Vec<Citation>,
    pub rubric_version: String,
    pub analyzed_at: DateTime<Utc>,
}
