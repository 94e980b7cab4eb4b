// src/routes/settings_routes.rs

use axum::{Json, Router, extract::State, routing::get};

use crate::{
    error::ApiError,
    models::{ApiOk, AppState},
    queue::policy::SchedulingConfig,
};

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/settings/scheduling",
        get(get_scheduling).put(put_scheduling),
    )
}

pub async fn get_scheduling(State(state): State<AppState>) -> Json<ApiOk<SchedulingConfig>> {
    Json(ApiOk {
        data: state.queue.scheduling().await,
    })
}

/// Takes effect on the next scheduling decision.
pub async fn put_scheduling(
    State(state): State<AppState>,
    Json(req): Json<SchedulingConfig>,
) -> Result<Json<ApiOk<SchedulingConfig>>, ApiError> {
    let saved = state.queue.set_scheduling(req).await?;
    Ok(Json(ApiOk { data: saved }))
}
