mod config;
mod db;
mod error;
mod models;
mod queue;
mod routes;

use std::sync::Arc;

use crate::queue::changes;
use crate::queue::debounce::Debouncer;
use crate::queue::notify::{self, LoggingNotifier};
use crate::queue::postgres::PgQueueRepository;
use crate::queue::registry::ServicePointRegistry;
use crate::queue::QueueCoordinator;
use crate::{config::Config, models::AppState};

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use axum::http::header;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::from_env()?;
    let pool = db::connect_pg(&cfg.database_url).await?;
    db::migrate(&pool).await?;

    let repo = Arc::new(PgQueueRepository::new(pool.clone()));
    let registry = Arc::new(ServicePointRegistry::new(repo.clone(), cfg.registry_ttl));
    let queue = Arc::new(QueueCoordinator::new(
        repo.clone(),
        repo.clone(),
        registry.clone(),
        Arc::new(LoggingNotifier),
        cfg.coordinator_options(),
    ));

    let loaded = queue.refresh().await?;
    tracing::info!(
        tickets = loaded,
        policy = cfg.default_policy.name(),
        "queue loaded"
    );

    // Bursts of row changes collapse into one cache rebuild.
    let refresher = queue.clone();
    let (refresh, _debouncer) = Debouncer::spawn(
        cfg.change_debounce,
        cfg.change_debounce * 10,
        move || {
            let queue = refresher.clone();
            async move {
                if let Err(e) = queue.refresh().await {
                    tracing::warn!(error = %e, "queue refresh failed");
                }
            }
        },
    );
    let _listener = changes::spawn_listener(pool.clone(), registry, refresh).await?;
    let _announcer = notify::spawn_announcer(queue.subscribe());

    let state = AppState {
        queue,
        service_points: repo,
    };

    // Allow the display and counter web clients to call the API.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    let app = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on http://{}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
