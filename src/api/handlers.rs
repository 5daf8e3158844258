use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::gate::{sanitize_blocked_countries, BlockListInput, BlockPolicyConfig};
use crate::models::{CountryCode, CountryStat};
use crate::storage::Storage;

pub struct AppState {
    pub storage: Arc<dyn Storage>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct SuccessResponse {
    pub message: String,
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub stats: Vec<CountryStat>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct PolicyResponse {
    pub blocked_countries: Vec<CountryCode>,
    pub admin_country: Option<CountryCode>,
    /// Countries actually denied (blocked minus admin country)
    pub effective_blocked: Vec<CountryCode>,
}

impl From<BlockPolicyConfig> for PolicyResponse {
    fn from(config: BlockPolicyConfig) -> Self {
        let effective_blocked = config.effective_blocked().into_iter().collect();
        Self {
            blocked_countries: config.blocked_countries.into_iter().collect(),
            admin_country: config.admin_country,
            effective_blocked,
        }
    }
}

#[derive(Deserialize)]
pub struct UpdateBlockedRequest {
    pub countries: BlockListInput,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn internal_error(context: &str, e: anyhow::Error) -> ApiError {
    tracing::error!("{context}: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: context.to_string(),
        }),
    )
}

/// Per-country visit statistics, most visited first
pub async fn list_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatsResponse>, ApiError> {
    match state.storage.list_stats().await {
        Ok(stats) => {
            let total = stats.len();
            Ok(Json(StatsResponse { stats, total }))
        }
        Err(e) => Err(internal_error("Failed to list statistics", e)),
    }
}

pub async fn get_policy(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PolicyResponse>, ApiError> {
    match state.storage.load_policy().await {
        Ok(config) => Ok(Json(config.into())),
        Err(e) => Err(internal_error("Failed to load block policy", e)),
    }
}

/// Replace the blocked country list. Entries that are not two-letter codes
/// are dropped.
pub async fn update_blocked_countries(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<UpdateBlockedRequest>,
) -> Result<Json<PolicyResponse>, ApiError> {
    let countries = sanitize_blocked_countries(&payload.countries);

    if let Err(e) = state.storage.save_blocked_countries(&countries).await {
        return Err(internal_error("Failed to save blocked countries", e));
    }
    tracing::info!(count = countries.len(), "blocked countries updated");

    match state.storage.load_policy().await {
        Ok(config) => Ok(Json(config.into())),
        Err(e) => Err(internal_error("Failed to load block policy", e)),
    }
}

/// Clear the protected admin country so the next privileged visitor sets it
pub async fn reset_admin_country(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SuccessResponse>, ApiError> {
    match state.storage.clear_admin_country().await {
        Ok(true) => {
            tracing::info!("admin country reset");
            Ok(Json(SuccessResponse {
                message: "Admin country reset".to_string(),
            }))
        }
        Ok(false) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Admin country is not set".to_string(),
            }),
        )),
        Err(e) => Err(internal_error("Failed to reset admin country", e)),
    }
}

/// Health check endpoint
pub async fn health_check() -> Json<SuccessResponse> {
    Json(SuccessResponse {
        message: "OK".to_string(),
    })
}
