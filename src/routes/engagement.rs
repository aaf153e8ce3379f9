use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::constants::{DEFAULT_ENCOUNTER_PAGE_SIZE, MAX_ENCOUNTER_PAGE_SIZE};
use crate::engagement::config::EngagementConfig;
use crate::engagement::engine::DeliverySettings;
use crate::extractors::JsonBody;
use crate::response::{created, ok, AppError};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/config", get(get_config).put(update_config))
        .route("/users/:user_id", get(get_user))
        .route("/users/:user_id/enroll", post(enroll))
        .route("/users/:user_id/unenroll", post(unenroll))
        .route("/users/:user_id/themes", put(update_themes))
        .route("/users/:user_id/delivery-mode", put(update_delivery_mode))
        .route("/users/:user_id/resolve", post(resolve))
        .route("/users/:user_id/encounters", get(list_encounters))
        .route("/users/:user_id/stats", get(get_stats))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThemesRequest {
    themes: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveRequest {
    /// Defaults to now. Chat bridges forward the message timestamp here.
    #[serde(default)]
    responded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    is_public: bool,
}

#[derive(Debug, Deserialize)]
struct EncounterQuery {
    limit: Option<usize>,
}

async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let snapshot = state.engine().snapshot(&user_id, Utc::now()).await?;
    Ok(ok(snapshot))
}

async fn enroll(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    JsonBody(req): JsonBody<ThemesRequest>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let snapshot = state
        .engine()
        .enroll(&user_id, &req.themes, Utc::now())
        .await?;
    Ok(created(snapshot))
}

async fn unenroll(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let snapshot = state.engine().unenroll(&user_id, Utc::now()).await?;
    Ok(ok(snapshot))
}

async fn update_themes(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    JsonBody(req): JsonBody<ThemesRequest>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let snapshot = state
        .engine()
        .update_themes(&user_id, &req.themes, Utc::now())
        .await?;
    Ok(ok(snapshot))
}

async fn update_delivery_mode(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    JsonBody(settings): JsonBody<DeliverySettings>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let snapshot = state
        .engine()
        .set_delivery_settings(&user_id, settings, Utc::now())
        .await?;
    Ok(ok(snapshot))
}

async fn resolve(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    JsonBody(req): JsonBody<ResolveRequest>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let responded_at = req.responded_at.unwrap_or_else(Utc::now);
    let action = state
        .engine()
        .resolve(&user_id, responded_at, req.is_public)
        .await?;
    Ok(ok(action))
}

async fn list_encounters(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<EncounterQuery>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ENCOUNTER_PAGE_SIZE)
        .clamp(1, MAX_ENCOUNTER_PAGE_SIZE);
    let entries = state.engine().recent_encounters(&user_id, limit)?;
    Ok(ok(entries))
}

async fn get_stats(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let stats = state.engine().encounter_stats(&user_id)?;
    Ok(ok(stats))
}

async fn get_config(
    State(state): State<AppState>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    Ok(ok(state.engine().get_config().await))
}

async fn update_config(
    State(state): State<AppState>,
    JsonBody(config): JsonBody<EngagementConfig>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let version = state.engine().reload_config(config).await?;
    let config = state.engine().get_config().await;
    Ok(ok(serde_json::json!({
        "version": version,
        "config": config,
    })))
}
