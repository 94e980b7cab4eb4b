use crate::models::AppState;
use axum::Router;

pub mod health_routes;
pub mod queue_routes;
pub mod service_point_routes;
pub mod settings_routes;
pub mod ticket_routes;

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", ticket_routes::router())
        .nest("/api/v1", service_point_routes::router())
        .nest("/api/v1", queue_routes::router())
        .nest("/api/v1", settings_routes::router())
        .merge(health_routes::router())
        .with_state(state)
}
