//! Score normalization pipeline
//!
//! Takes a raw judgment assessment and derives the published score, verdict,
//! and review flag through an ordered sequence of pure rules. Rules run over
//! an immutable view of the assessment and accumulate changes in a working
//! value; later rules see the effect of earlier ones, and every rule that
//! changes something leaves a trace entry in the adjustment list.
//!
//! Rule order:
//!
//! 1. Start from the judgment's base sub-score.
//! 2. Narrative voice: Character dampens negative theme weights before they
//!    are summed; Declarative scores normally but sets the review flag.
//! 3. Addressed lament suppresses penalties from negative-affect themes.
//! 4. Theme weights fold onto the base score.
//! 5. Ambiguous spiritual framing caps the score.
//! 6. Quiet secular content with no strong signal lands in a fixed band.
//! 7. Citation gate: any verdict above avoid requires at least one citation,
//!    otherwise normalization fails closed rather than publishing an
//!    unsupported score.
//! 8. The clamped, rounded score maps to a verdict tier.

use serde::{Deserialize, Serialize};

use crate::models::{
    AdjustmentRule, AppliedAdjustment, DistressPosture, NarrativeVoice, RawAssessment,
    SpiritualFraming, Verdict,
};

/// Tunable rule parameters. Defaults match the published rubric.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NormalizerConfig {
    /// Fraction removed from negative theme weights under Character voice
    pub voice_dampening: f64,
    /// Score cap for ambiguous spiritual framing
    pub ambiguity_ceiling: f64,
    /// Band that neutral secular content is clamped into
    pub neutral_floor_min: f64,
    pub neutral_floor_max: f64,
    /// Minimum |weight| for a theme to count as a relevant signal
    pub relevance_threshold: f64,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            voice_dampening: 0.30,
            ambiguity_ceiling: 45.0,
            neutral_floor_min: 60.0,
            neutral_floor_max: 75.0,
            relevance_threshold: 10.0,
        }
    }
}

/// Normalization output: everything the runner needs to assemble a result.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub score: u8,
    pub verdict: Verdict,
    pub review_flag: bool,
    pub adjustments: Vec<AppliedAdjustment>,
}

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    /// The assessment supports a verdict above avoid but cites no evidence.
    /// Fails closed: no score is published without backing citations.
    #[error("verdict '{verdict}' requires at least one citation")]
    MissingCitation { verdict: Verdict },
}

/// Working value threaded through the rule pipeline.
struct Working {
    /// Effective theme weights, index-aligned with the assessment's themes
    effective_weights: Vec<f64>,
    score: f64,
    review_flag: bool,
    adjustments: Vec<AppliedAdjustment>,
}

/// Normalizes with the default rubric parameters.
pub fn normalize(assessment: &RawAssessment) -> Result<Normalized, NormalizeError> {
    normalize_with(&NormalizerConfig::default(), assessment)
}

pub fn normalize_with(
    config: &NormalizerConfig,
    assessment: &RawAssessment,
) -> Result<Normalized, NormalizeError> {
    let mut working = Working {
        effective_weights: assessment.themes.iter().map(|t| t.weight).collect(),
        score: assessment.base_score,
        review_flag: false,
        adjustments: Vec::new(),
    };

    apply_voice_rule(config, assessment, &mut working);
    apply_lament_rule(assessment, &mut working);
    fold_theme_weights(&mut working);
    apply_ambiguity_ceiling(config, assessment, &mut working);
    apply_neutral_floor(config, assessment, &mut working);

    let score = working.score.clamp(0.0, 100.0).round() as u8;
    let verdict = Verdict::from_score(score);

    if verdict != Verdict::Avoid && assessment.citations.is_empty() {
        return Err(NormalizeError::MissingCitation { verdict });
    }

    Ok(Normalized {
        score,
        verdict,
        review_flag: working.review_flag,
        adjustments: working.adjustments,
    })
}

/// Character voice dampens negative theme weights: the singer inhabits a
/// persona, so dark themes carry reduced (not zero) weight. Declarative
/// voice scores at full weight but is flagged for human review.
fn apply_voice_rule(config: &NormalizerConfig, assessment: &RawAssessment, working: &mut Working) {
    match assessment.voice {
        NarrativeVoice::Character => {
            let mut dampened = 0usize;
            for weight in working.effective_weights.iter_mut() {
                if *weight < 0.0 {
                    *weight *= 1.0 - config.voice_dampening;
                    dampened += 1;
                }
            }
            if dampened > 0 {
                working.adjustments.push(AppliedAdjustment::new(
                    AdjustmentRule::VoiceDampening,
                    format!(
                        "character voice: negative weight on {} theme(s) reduced by {}%",
                        dampened,
                        (config.voice_dampening * 100.0).round() as u32
                    ),
                ));
            }
        }
        NarrativeVoice::Declarative => {
            working.review_flag = true;
            working.adjustments.push(AppliedAdjustment::new(
                AdjustmentRule::DeclarativeReview,
                "declarative voice: scored normally, flagged for human review",
            ));
        }
        NarrativeVoice::Direct | NarrativeVoice::Collective => {}
    }
}

/// Grief and lament exception: distress voiced toward a hoped-for hearer is
/// lament, not glorified despair, so penalties from negative-affect themes
/// are suppressed entirely.
fn apply_lament_rule(assessment: &RawAssessment, working: &mut Working) {
    if assessment.distress != DistressPosture::AddressedLament {
        return;
    }
    let mut suppressed = 0usize;
    for (theme, weight) in assessment.themes.iter().zip(working.effective_weights.iter_mut()) {
        if theme.negative_affect && *weight < 0.0 {
            *weight = 0.0;
            suppressed += 1;
        }
    }
    if suppressed > 0 {
        working.adjustments.push(AppliedAdjustment::new(
            AdjustmentRule::LamentException,
            format!(
                "addressed lament: penalty suppressed on {suppressed} negative-affect theme(s)"
            ),
        ));
    }
}

fn fold_theme_weights(working: &mut Working) {
    working.score += working.effective_weights.iter().sum::<f64>();
}

/// Ambiguous spiritual framing cannot score above the ceiling regardless of
/// how positive the themes are.
fn apply_ambiguity_ceiling(
    config: &NormalizerConfig,
    assessment: &RawAssessment,
    working: &mut Working,
) {
    if assessment.framing != SpiritualFraming::Ambiguous {
        return;
    }
    if working.score > config.ambiguity_ceiling {
        let before = working.score;
        working.score = config.ambiguity_ceiling;
        working.adjustments.push(AppliedAdjustment::new(
            AdjustmentRule::AmbiguityCeiling,
            format!(
                "ambiguous framing: score capped at {} (was {:.1})",
                config.ambiguity_ceiling, before
            ),
        ));
    }
}

/// Secular content with no relevant theme signal and no flagged category is
/// "acceptable absent explicit alignment": the score is clamped into the
/// neutral band instead of drifting on weak noise.
fn apply_neutral_floor(
    config: &NormalizerConfig,
    assessment: &RawAssessment,
    working: &mut Working,
) {
    if assessment.framing != SpiritualFraming::Secular {
        return;
    }
    let has_relevant_theme = assessment
        .themes
        .iter()
        .any(|t| t.weight.abs() >= config.relevance_threshold);
    let has_flagged_theme = assessment.themes.iter().any(|t| t.flagged);
    if has_relevant_theme || has_flagged_theme {
        return;
    }

    let before = working.score;
    let clamped = before.clamp(config.neutral_floor_min, config.neutral_floor_max);
    if clamped != before {
        working.score = clamped;
        working.adjustments.push(AppliedAdjustment::new(
            AdjustmentRule::NeutralFloor,
            format!(
                "neutral secular content: score clamped into {}-{} band (was {:.1})",
                config.neutral_floor_min, config.neutral_floor_max, before
            ),
        ));
    }
}
