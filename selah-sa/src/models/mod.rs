//! Domain models for song analysis

pub mod assessment;
pub mod job;
pub mod progress;
pub mod result;

pub use assessment::{
    Citation, DistressPosture, NarrativeVoice, RawAssessment, SpiritualFraming, ThemeFinding,
};
pub use job::{AnalysisTarget, JobHandle};
pub use progress::{JobStatus, ProgressCounters, ProgressRecord, ProgressSnapshot, ResultSummary};
pub use result::{AdjustmentRule, AnalysisResult, AppliedAdjustment, Verdict, RUBRIC_VERSION};
