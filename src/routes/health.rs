use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/live", get(liveness))
        .route("/ready", get(readiness))
        .route("/database", get(database_health))
}

pub async fn health_check(State(state): State<AppState>) -> impl axum::response::IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "uptimeSecs": state.uptime_secs(),
        "transport": state.transport().name(),
        "workerLeader": state.config().worker.is_leader,
    }))
}

pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Ready once the store answers a read.
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    match state.store().engagement_record_exists("__health_check__") {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::error!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

pub async fn database_health(
    State(state): State<AppState>,
) -> impl axum::response::IntoResponse {
    let start = Instant::now();
    let healthy = state
        .store()
        .engagement_record_exists("__health_check__")
        .is_ok();
    let latency_us = start.elapsed().as_micros() as u64;
    let enrolled_users = state
        .store()
        .list_engagement_user_ids()
        .map(|ids| ids.len())
        .unwrap_or(0);

    Json(serde_json::json!({
        "healthy": healthy,
        "latencyUs": latency_us,
        "records": enrolled_users,
        "encounterLogEntries": state.store().encounters.len(),
    }))
}
