//! Row-level change feed from PostgreSQL (`LISTEN queue_changes`).

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::queue::debounce::DebounceHandle;
use crate::queue::registry::ServicePointRegistry;

pub const CHANNEL: &str = "queue_changes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub op: ChangeOp,
    pub id: Option<Uuid>,
}

impl ChangeEvent {
    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    pub fn touches_service_points(&self) -> bool {
        matches!(
            self.table.as_str(),
            "service_point" | "service_point_ticket_type"
        )
    }
}

/// Applies one change: service point edits drop the registry cache, and
/// every change asks for a (debounced) ticket refresh.
pub async fn apply_change(
    event: &ChangeEvent,
    registry: &ServicePointRegistry,
    refresh: &DebounceHandle,
) {
    tracing::debug!(table = %event.table, op = ?event.op, id = ?event.id, "change notification");
    if event.touches_service_points() {
        registry.invalidate().await;
    }
    if !refresh.trigger() {
        tracing::warn!("refresh debouncer is gone; change ignored");
    }
}

pub async fn spawn_listener(
    pool: PgPool,
    registry: Arc<ServicePointRegistry>,
    refresh: DebounceHandle,
) -> anyhow::Result<JoinHandle<()>> {
    let mut listener = PgListener::connect_with(&pool).await?;
    listener.listen(CHANNEL).await?;
    tracing::info!(channel = CHANNEL, "listening for queue changes");

    let task = tokio::spawn(async move {
        loop {
            match listener.recv().await {
                Ok(notification) => match ChangeEvent::parse(notification.payload()) {
                    Ok(event) => apply_change(&event, &registry, &refresh).await,
                    Err(e) => {
                        tracing::warn!(error = %e, payload = notification.payload(), "bad change payload");
                        // Still worth a refresh: something changed.
                        refresh.trigger();
                    }
                },
                Err(e) => {
                    // PgListener reconnects on the next recv.
                    tracing::warn!(error = %e, "change listener error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    Ok(task)
}
