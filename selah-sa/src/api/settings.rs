//! Settings API endpoints
//!
//! Runtime configuration of the judgment API key. The database row is
//! authoritative; the bootstrap TOML receives a best-effort mirror so the
//! key survives a database reset.

use axum::{
    extract::State,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{is_valid_key, mask_key, sync_key_to_toml, JUDGMENT_KEY_SETTING};
use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// Request payload for setting the judgment API key
#[derive(Debug, Deserialize)]
pub struct SetKeyRequest {
    /// The judgment service API key to configure
    pub api_key: String,
}

/// Response payload for key updates
#[derive(Debug, Serialize)]
pub struct SetKeyResponse {
    /// Whether the operation succeeded
    pub success: bool,
    /// Human-readable status message
    pub message: String,
}

/// Response payload describing the configured key without revealing it
#[derive(Debug, Serialize)]
pub struct KeyStatusResponse {
    /// Whether a usable key is present
    pub configured: bool,
    /// Masked form for display, e.g. `...a9f3`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub masked_key: Option<String>,
}

/// GET /settings/judgment-key
///
/// Reports whether a judgment key is configured. Only a masked suffix is
/// ever returned.
pub async fn get_judgment_key(State(state): State<AppState>) -> ApiResult<Json<KeyStatusResponse>> {
    let key: Option<String> =
        crate::db::settings::get_setting(&state.db, JUDGMENT_KEY_SETTING).await?;
    let key = key.filter(|k| is_valid_key(k));

    Ok(Json(KeyStatusResponse {
        configured: key.is_some(),
        masked_key: key.as_deref().map(mask_key),
    }))
}

/// PUT /settings/judgment-key
///
/// **Request:** `{"api_key": "sk-..."}`
/// **Response:** `{"success": true, "message": "..."}`
///
/// **Behavior:**
/// 1. Validate key shape
/// 2. Write to database (authoritative)
/// 3. Mirror to TOML (best-effort backup)
///
/// **Errors:**
/// - 400 Bad Request: key too short or contains whitespace
/// - 500 Internal Server Error: database write failure
///
/// TOML write failures log warnings but do not fail the request.
pub async fn set_judgment_key(
    State(state): State<AppState>,
    Json(payload): Json<SetKeyRequest>,
) -> ApiResult<Json<SetKeyResponse>> {
    if !is_valid_key(&payload.api_key) {
        return Err(ApiError::BadRequest(
            "API key must be at least 8 characters with no whitespace".to_string(),
        ));
    }

    let key = payload.api_key.trim().to_string();

    crate::db::settings::set_setting(&state.db, JUDGMENT_KEY_SETTING, &key)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to save API key to database: {}", e)))?;

    info!(masked = %mask_key(&key), "judgment API key updated");

    match sync_key_to_toml(&state.config, &key) {
        Ok(()) => info!("judgment API key mirrored to config file"),
        Err(e) => warn!("TOML mirror failed (database write succeeded): {}", e),
    }

    Ok(Json(SetKeyResponse {
        success: true,
        message: "Judgment API key configured successfully".to_string(),
    }))
}

/// Build settings routes
pub fn settings_routes() -> Router<AppState> {
    Router::new().route(
        "/settings/judgment-key",
        get(get_judgment_key).put(set_judgment_key),
    )
}
