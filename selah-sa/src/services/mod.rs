//! Analysis services

pub mod job_runner;
pub mod judgment_client;
pub mod lyrics_provider;
pub mod normalizer;
pub mod orchestrator;
pub mod progress_store;

pub use job_runner::JobRunner;
pub use judgment_client::{JudgmentError, JudgmentService, OpenAiJudgmentClient};
pub use lyrics_provider::{LrclibClient, LyricsDocument, LyricsError, LyricsProvider};
pub use normalizer::{normalize, NormalizeError, Normalized, NormalizerConfig};
pub use orchestrator::{Orchestrator, SubmitError};
pub use progress_store::ProgressStore;
