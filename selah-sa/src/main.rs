//! selah-sa - Song Analysis Microservice
//!
//! **Module Identity:**
//! - Name: selah-sa (Song Analysis)
//! - Port: 5750
//!
//! Analyzes song lyrics for content alignment: fetches lyrics, obtains a
//! structured judgment from an LLM endpoint, normalizes the raw assessment
//! through the scoring rules, and persists the verdict. Serves submission,
//! polling, and cancellation over HTTP REST + SSE.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use selah_common::config::{Config, ConfigOverrides};
use selah_common::db::init_database;
use selah_common::events::EventBus;

use selah_sa::config::{
    mask_key, migrate_judgment_key_to_db, resolve_judgment_api_key, RuntimeSettings,
};
use selah_sa::services::judgment_client::{JudgmentService, OpenAiJudgmentClient};
use selah_sa::services::lyrics_provider::{LrclibClient, LyricsProvider};
use selah_sa::services::orchestrator::Orchestrator;
use selah_sa::services::progress_store::{spawn_sweeper, ProgressStore};
use selah_sa::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Bootstrap config comes first so the log filter can honor the TOML
    // logging level; RUST_LOG still wins when set.
    let overrides = ConfigOverrides::from_env()?;
    let config = Config::resolve(overrides)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level())),
        )
        .init();

    // Log build identification IMMEDIATELY after tracing init
    info!(
        "Starting Selah Song Analysis (selah-sa) v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    match &config.config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: built-in defaults"),
    }
    info!("Database: {}", config.database_path.display());

    let db_pool = init_database(&config.database_path)
        .await
        .context("Failed to initialize database")?;
    info!("Database connection established");

    // A key found only in the environment or TOML moves into the database
    // so the settings endpoint is authoritative afterward
    migrate_judgment_key_to_db(&db_pool, config.toml.judgment_api_key.as_deref())
        .await
        .context("Failed to migrate judgment API key")?;

    match resolve_judgment_api_key(&db_pool, config.toml.judgment_api_key.as_deref()).await? {
        Some(key) => info!("Judgment API key configured ({})", mask_key(&key)),
        None => warn!(
            "No judgment API key configured; analysis jobs will fail until one is set via PUT /settings/judgment-key"
        ),
    }

    let settings = RuntimeSettings::load(&db_pool)
        .await
        .context("Failed to load runtime settings")?;
    info!(
        "Runtime settings loaded (max {} concurrent jobs, judgment model {})",
        settings.max_concurrent_jobs, settings.judgment_model
    );

    // Event bus for SSE broadcasting
    let event_bus = EventBus::new(100);

    let lyrics: Arc<dyn LyricsProvider> = Arc::new(LrclibClient::new(
        settings.lyrics_base_url.clone(),
        settings.lyrics_timeout,
    )?);
    let judgment: Arc<dyn JudgmentService> = Arc::new(OpenAiJudgmentClient::new(
        db_pool.clone(),
        settings.judgment_base_url.clone(),
        settings.judgment_model.clone(),
        settings.judgment_timeout,
        config.toml.judgment_api_key.clone(),
    )?);

    let store = ProgressStore::new();
    let orchestrator = Orchestrator::new(
        db_pool.clone(),
        store.clone(),
        event_bus.clone(),
        lyrics,
        judgment,
        &settings,
    );
    let shutdown = orchestrator.shutdown_token();

    // Terminal progress records stay queryable for the retention window,
    // then the sweeper drops them
    spawn_sweeper(
        store,
        settings.progress_retention,
        settings.progress_sweep_interval,
        shutdown.clone(),
    );

    let bind_address = config.bind_address.clone();
    let port = config.port;
    let state = AppState::new(db_pool, event_bus, orchestrator, config);
    let app = selah_sa::build_router(state);

    let listener = tokio::net::TcpListener::bind((bind_address.as_str(), port))
        .await
        .with_context(|| format!("Failed to bind to {}:{}", bind_address, port))?;
    info!("Listening on http://{}:{}", bind_address, port);
    info!("Health check: http://{}:{}/health", bind_address, port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
///
/// Cancels the orchestrator's parent token before returning so in-flight
/// jobs and the sweeper stop cooperatively while axum drains connections.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }

    shutdown.cancel();
}
