//! Analysis job identity types
//!
//! A job targets either a single track or a whole playlist. Targets are the
//! dedup key for submission: at most one non-terminal job exists per target
//! at any time, and re-submitting an in-flight target returns the existing
//! job's handle instead of creating a duplicate.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What an analysis job operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum AnalysisTarget {
    /// Single track analysis
    Track(Uuid),
    /// Playlist analysis: fans out one child job per member track
    Playlist(Uuid),
}

impl AnalysisTarget {
    pub fn id(&self) -> Uuid {
        match self {
            AnalysisTarget::Track(id) => *id,
            AnalysisTarget::Playlist(id) => *id,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            AnalysisTarget::Track(_) => "track",
            AnalysisTarget::Playlist(_) => "playlist",
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, AnalysisTarget::Playlist(_))
    }
}

impl std::fmt::Display for AnalysisTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind_str(), self.id())
    }
}

/// Handle returned from a submission.
///
/// `created` distinguishes a freshly created job from an existing in-flight
/// job returned by the dedup rule, so the HTTP layer can answer 202 vs 200.
#[derive(Debug, Clone, Serialize)]
pub struct JobHandle {
    pub job_id: Uuid,
    pub target: AnalysisTarget,
    pub created: bool,
}
