//! HTTP API handlers for selah-sa
//!
//! Route modules are merged into the service router in `build_router`.

pub mod analysis;
pub mod health;
pub mod settings;
pub mod sse;

pub use analysis::analysis_routes;
pub use health::health_routes;
pub use settings::settings_routes;
pub use sse::event_stream;
