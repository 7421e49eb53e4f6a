use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::models::Position;
use crate::AppState;

#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PositionsQuery {
    pub follower_id: Option<i64>,
}

/// GET /api/positions?follower_id=: open positions, newest first.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<PositionsQuery>,
) -> Result<Json<ApiResponse<Vec<Position>>>, AppError> {
    let positions = state.ledger.list_open_positions(query.follower_id).await?;
    Ok(Json(ApiResponse {
        success: true,
        data: Some(positions),
        error: None,
    }))
}
