//! Event types for the Selah event system
//!
//! Provides shared event definitions and the EventBus used by all services.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Selah event types
///
/// Events are broadcast via EventBus and can be serialized for SSE transmission.
/// All services use this central enum for type safety and exhaustive matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SelahEvent {
    /// Analysis job accepted and queued
    ///
    /// Triggers:
    /// - SSE: Show job in activity view
    AnalysisJobQueued {
        /// Job UUID
        job_id: Uuid,
        /// Target kind ("track" or "playlist")
        target_kind: String,
        /// Target UUID (track or playlist)
        target_id: Uuid,
        /// When the job was queued
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Analysis job picked up by a worker
    AnalysisJobStarted {
        job_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Aggregate progress update for a collection job
    ///
    /// Emitted each time a member settles. NOT persisted; SSE only.
    ///
    /// Triggers:
    /// - SSE: Update progress bar
    AnalysisJobProgress {
        job_id: Uuid,
        /// Members settled so far
        completed: u32,
        /// Total members in the collection
        total: u32,
        /// Label of the most recently settled item
        current_item: Option<String>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Analysis job finished with a persisted result
    ///
    /// Triggers:
    /// - SSE: Update track verdict badge
    AnalysisJobFinished {
        job_id: Uuid,
        /// Track the result belongs to (None for collection jobs)
        track_id: Option<Uuid>,
        /// Final score (0-100), None for collection jobs
        score: Option<u8>,
        /// Verdict tier name, None for collection jobs
        verdict: Option<String>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Analysis job failed terminally
    AnalysisJobFailed {
        job_id: Uuid,
        /// Stable error code (e.g. "CONTENT_UNAVAILABLE")
        code: String,
        /// Human-readable failure description
        message: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Analysis job cancelled before completion
    AnalysisJobCancelled {
        job_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl SelahEvent {
    /// Event type name for SSE event field
    pub fn event_type(&self) -> &str {
        match self {
            SelahEvent::AnalysisJobQueued { .. } => "AnalysisJobQueued",
            SelahEvent::AnalysisJobStarted { .. } => "AnalysisJobStarted",
            SelahEvent::AnalysisJobProgress { .. } => "AnalysisJobProgress",
            SelahEvent::AnalysisJobFinished { .. } => "AnalysisJobFinished",
            SelahEvent::AnalysisJobFailed { .. } => "AnalysisJobFailed",
            SelahEvent::AnalysisJobCancelled { .. } => "AnalysisJobCancelled",
        }
    }
}

/// Broadcast channel for distributing events to subscribers
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SelahEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before dropping old events
    ///
    /// # Examples
    ///
    /// ```
    /// use selah_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(100);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<SelahEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists,
    /// `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: SelahEvent,
    ) -> Result<usize, broadcast::error::SendError<SelahEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    ///
    /// Used for progress and lifecycle events where it is acceptable if
    /// no component is currently listening.
    pub fn emit_lossy(&self, event: SelahEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
