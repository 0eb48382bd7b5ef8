//! Raw judgment output model
//!
//! `RawAssessment` is the structured verdict material produced by the
//! judgment service for one track: a base sub-score, narrative and framing
//! classifications, a free-form theme list with signed weights, and the
//! citations backing the assessment. It is judgment output, not a final
//! result: the normalizer consumes it and derives the published score.

use serde::{Deserialize, Serialize};

/// Point of view the lyrics are sung from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NarrativeVoice {
    /// First person, the singer speaking as themselves
    Direct,
    /// First person plural, congregational "we"
    Collective,
    /// The singer inhabits a persona distinct from themselves
    Character,
    /// Third-person statements about the world rather than from a speaker
    Declarative,
}

/// How the lyrics relate to expressed distress or anguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistressPosture {
    /// No notable distress content
    None,
    /// Distress voiced toward a hoped-for hearer, lament rather than despair
    AddressedLament,
    /// Distress or darkness presented as desirable
    Glorified,
}

/// Whether the lyrics' spiritual orientation is stated, hinted, or absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpiritualFraming {
    /// Overt, unambiguous spiritual content
    Explicit,
    /// Spiritual-sounding language that could read either way
    Ambiguous,
    /// No spiritual framing at all
    Secular,
}

/// One detected theme with its scoring weight.
///
/// `weight` is signed: positive themes raise the score, negative themes
/// lower it. `negative_affect` marks sorrow/distress themes (the targets of
/// the lament exception) as opposed to themes that are merely negative in
/// weight. `flagged` marks categories that disqualify the neutral floor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeFinding {
    pub label: String,
    pub weight: f64,
    #[serde(default)]
    pub negative_affect: bool,
    #[serde(default)]
    pub flagged: bool,
}

/// A lyric excerpt the judgment cites as evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    /// Where in the lyrics the quote comes from, e.g. "verse 2"
    pub reference: String,
    pub quote: String,
}

/// Structured judgment output for one track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAssessment {
    pub base_score: f64,
    #[serde(rename = "narrative_voice")]
    pub voice: NarrativeVoice,
    #[serde(rename = "distress_posture", default = "default_posture")]
    pub distress: DistressPosture,
    #[serde(rename = "spiritual_framing")]
    pub framing: SpiritualFraming,
    #[serde(default)]
    pub themes: Vec<ThemeFinding>,
    #[serde(default)]
    pub citations: Vec<Citation>,
}

fn default_posture() -> DistressPosture {
    DistressPosture::None
}

impl RawAssessment {
    /// Range and sanity checks applied at the judgment output boundary.
    /// A violation means the judgment produced unusable output, which the
    /// runner treats as a malformed-output failure.
    pub fn validate(&self) -> Result<(), String> {
        if !self.base_score.is_finite() {
            return Err("base_score is not a finite number".to_string());
        }
        if !(0.0..=100.0).contains(&self.base_score) {
            return Err(format!(
                "base_score {} outside valid range 0-100",
                self.base_score
            ));
        }
        for theme in &self.themes {
            if theme.label.trim().is_empty() {
                return Err("theme with empty label".to_string());
            }
            if !theme.weight.is_finite() {
                return Err(format!("theme '{}' has non-finite weight", theme.label));
            }
            if theme.weight.abs() > 100.0 {
                return Err(format!(
                    "theme '{}' weight {} outside valid range -100..100",
                    theme.label, theme.weight
                ));
            }
        }
        for citation in &self.citations {
            if citation.quote.trim().is_empty() {
                return Err("citation with empty quote".to_string());
            }
        }
        Ok(())
    }
}
