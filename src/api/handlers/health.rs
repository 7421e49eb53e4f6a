use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::models::Exchange;
use crate::AppState;

/// GET /health: database reachability plus which master venues are wired.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = sqlx::query("SELECT 1").execute(&state.db).await.is_ok();
    let masters: Vec<&str> = Exchange::ALL
        .into_iter()
        .filter(|ex| state.config.master_credentials(*ex).is_some())
        .map(|ex| ex.as_str())
        .collect();
    let mode = if state.config.dry_run { "dry_run" } else { "live" };

    if db_ok {
        (
            StatusCode::OK,
            Json(json!({ "status": "healthy", "mode": mode, "masters": masters })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy", "db": "disconnected", "mode": mode })),
        )
    }
}
