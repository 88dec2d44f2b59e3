//! Dashboard HTTP API: per-organization configuration and panel posting.
//!
//! Requests arrive from a trusted dashboard; panel posting skips the
//! in-chat privilege check.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::error;
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use crate::shared::models::OrganizationConfig;
use crate::shared::state::AppState;
use crate::tickets::TicketError;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/config/:org", get(get_config).post(save_config))
        .route("/api/postpanel", post(post_panel))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn internal(context: &str, err: impl std::fmt::Display) -> (StatusCode, String) {
    error!("{context}: {err}");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
}

/// Stored configuration, or the default template for organizations that
/// have none yet so the dashboard always has something to edit.
async fn get_config(
    State(state): State<AppState>,
    Path(org): Path<String>,
) -> Result<Json<OrganizationConfig>, (StatusCode, String)> {
    let config = state
        .configs
        .load(&org)
        .await
        .map_err(|e| internal("config load failed", e))?
        .unwrap_or_else(OrganizationConfig::default_template);
    Ok(Json(config))
}

async fn save_config(
    State(state): State<AppState>,
    Path(org): Path<String>,
    Json(config): Json<OrganizationConfig>,
) -> Result<StatusCode, (StatusCode, String)> {
    if config.options.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Config must declare at least one ticket option".to_string(),
        ));
    }
    state
        .configs
        .save(&org, &config)
        .await
        .map_err(|e| internal("config save failed", e))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct PostPanelRequest {
    org_id: String,
    channel_id: String,
}

async fn post_panel(
    State(state): State<AppState>,
    Json(req): Json<PostPanelRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    match state
        .engine
        .post_panel(&req.org_id, &req.channel_id, None)
        .await
    {
        Ok(_) => Ok(StatusCode::CREATED),
        Err(TicketError::NotConfigured) => Err((
            StatusCode::NOT_FOUND,
            TicketError::NotConfigured.to_string(),
        )),
        Err(e) => Err(internal("panel post failed", e)),
    }
}
