// src/routes/queue_routes.rs

use axum::{
    Json, Router,
    extract::{Query, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    models::{ApiOk, AppState},
    queue::coordinator::QueueBoard,
    queue::store::QueueStats,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/queue/board", get(board))
        .route("/queue/stats", get(stats))
        .route("/queue/refresh", post(refresh))
}

#[derive(Debug, Deserialize)]
pub struct BoardQuery {
    pub service_point_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct RefreshData {
    pub tickets: usize,
}

pub async fn board(
    State(state): State<AppState>,
    Query(q): Query<BoardQuery>,
) -> Result<Json<ApiOk<QueueBoard>>, ApiError> {
    let data = state.queue.board(q.service_point_id).await?;
    Ok(Json(ApiOk { data }))
}

pub async fn stats(State(state): State<AppState>) -> Result<Json<ApiOk<QueueStats>>, ApiError> {
    let data = state.queue.stats().await?;
    Ok(Json(ApiOk { data }))
}

/// Manual rebuild of the ticket cache, for when the change feed is down.
pub async fn refresh(State(state): State<AppState>) -> Result<Json<ApiOk<RefreshData>>, ApiError> {
    let tickets = state.queue.refresh().await?;
    Ok(Json(ApiOk {
        data: RefreshData { tickets },
    }))
}
