use axum::{Json, Router, extract::State, routing::get};

use crate::models::AppState;

#[derive(serde::Serialize)]
pub struct HealthResponse {
    pub data: HealthData,
}

#[derive(serde::Serialize)]
pub struct HealthData {
    pub status: &'static str,
    pub cached_tickets: usize,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        data: HealthData {
            status: "ok",
            cached_tickets: state.queue.store().len().await,
        },
    })
}
