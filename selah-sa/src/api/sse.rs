//! Server-Sent Events (SSE) for analysis progress streaming
//!
//! Push-side companion to the polling status endpoint: every job lifecycle
//! event on the bus is forwarded to connected clients as it happens.

use crate::AppState;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use selah_common::events::SelahEvent;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, info, warn};

/// GET /events - SSE event stream for analysis progress
///
/// Streams events:
/// - AnalysisJobQueued
/// - AnalysisJobStarted
/// - AnalysisJobProgress (per completed collection member)
/// - AnalysisJobFinished
/// - AnalysisJobFailed
/// - AnalysisJobCancelled
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New SSE client connected to analysis events");

    // Subscribe to event broadcast
    let mut rx = state.event_bus.subscribe();

    let stream = async_stream::stream! {
        debug!("SSE: analysis event stream started");

        loop {
            tokio::select! {
                // Heartbeat every 15 seconds
                _ = tokio::time::sleep(Duration::from_secs(15)) => {
                    yield Ok(Event::default().comment("heartbeat"));
                }

                // Broadcast events
                Ok(event) = rx.recv() => {
                    let event_type = SelahEvent::event_type(&event);

                    match serde_json::to_string(&event) {
                        Ok(event_json) => {
                            debug!("SSE: broadcasting {}", event_type);
                            yield Ok(Event::default()
                                .event(event_type)
                                .data(event_json));
                        }
                        Err(e) => {
                            warn!("SSE: failed to serialize event {}: {}", event_type, e);
                        }
                    }
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}
