use crate::AppState;
use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use std::time::Instant;

/// Liveness probe, answered before routing and never logged.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptimeSecs": state.start_time.elapsed().as_secs(),
        "loggingDegraded": state.writer.is_degraded(),
    }))
}

/// Live upstream states for the management UI collaborator.
pub async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let report = state.runtime.load().health_report(Instant::now());
    Json(json!({ "routes": report }))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

/// Most recent attempt records from the access store.
pub async fn logs(State(state): State<AppState>, Query(query): Query<LogsQuery>) -> Response {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    match state.writer.recent(limit).await {
        Ok(entries) => {
            let count = entries.len();
            Json(json!({ "items": entries, "count": count })).into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "log query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "log store unavailable"})),
            )
                .into_response()
        }
    }
}
