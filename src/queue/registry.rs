//! Service point registry: enabled points and their ticket-type capabilities,
//! cached for a short TTL so scheduling decisions do not hit the database
//! on every call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::QueueError;
use crate::models::{Capability, ServicePoint, TicketType};
use crate::queue::repository::ServicePointRepository;

#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    points: Vec<ServicePoint>,
    capabilities: HashMap<Uuid, HashSet<TicketType>>,
}

impl RegistrySnapshot {
    pub fn new(mut points: Vec<ServicePoint>, mappings: Vec<Capability>) -> Self {
        points.sort_by(|a, b| a.code.cmp(&b.code));
        let mut capabilities: HashMap<Uuid, HashSet<TicketType>> = HashMap::new();
        for m in mappings {
            capabilities
                .entry(m.service_point_id)
                .or_default()
                .insert(m.ticket_type);
        }
        Self {
            points,
            capabilities,
        }
    }

    pub fn all(&self) -> &[ServicePoint] {
        &self.points
    }

    pub fn enabled(&self) -> Vec<&ServicePoint> {
        self.points.iter().filter(|sp| sp.enabled).collect()
    }

    pub fn get(&self, service_point_id: Uuid) -> Option<&ServicePoint> {
        self.points
            .iter()
            .find(|sp| sp.service_point_id == service_point_id)
    }

    pub fn is_enabled(&self, service_point_id: Uuid) -> bool {
        self.get(service_point_id).is_some_and(|sp| sp.enabled)
    }

    pub fn types_for(&self, service_point_id: Uuid) -> Vec<TicketType> {
        let mut types: Vec<TicketType> = self
            .capabilities
            .get(&service_point_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        types.sort();
        types
    }

    /// Enabled points explicitly mapped to the type.
    pub fn mapped_points(&self, ticket_type: TicketType) -> Vec<Uuid> {
        self.points
            .iter()
            .filter(|sp| sp.enabled)
            .filter(|sp| {
                self.capabilities
                    .get(&sp.service_point_id)
                    .is_some_and(|set| set.contains(&ticket_type))
            })
            .map(|sp| sp.service_point_id)
            .collect()
    }

    /// Mapped points, or every enabled point when the type has no mapping.
    pub fn capable_points(&self, ticket_type: TicketType) -> Vec<Uuid> {
        let mapped = self.mapped_points(ticket_type);
        if !mapped.is_empty() {
            return mapped;
        }
        self.enabled().iter().map(|sp| sp.service_point_id).collect()
    }

    pub fn may_serve(&self, service_point_id: Uuid, ticket_type: TicketType) -> bool {
        self.capable_points(ticket_type).contains(&service_point_id)
    }
}

struct Cached {
    snapshot: Arc<RegistrySnapshot>,
    loaded_at: Instant,
}

pub struct ServicePointRegistry {
    source: Arc<dyn ServicePointRepository>,
    ttl: Duration,
    cache: RwLock<Option<Cached>>,
}

impl ServicePointRegistry {
    pub fn new(source: Arc<dyn ServicePointRepository>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cache: RwLock::new(None),
        }
    }

    /// Current snapshot, reloaded when older than the TTL.
    pub async fn snapshot(&self) -> Result<Arc<RegistrySnapshot>, QueueError> {
        {
            let guard = self.cache.read().await;
            if let Some(cached) = guard.as_ref() {
                if cached.loaded_at.elapsed() < self.ttl {
                    return Ok(cached.snapshot.clone());
                }
            }
        }
        self.refresh().await
    }

    pub async fn refresh(&self) -> Result<Arc<RegistrySnapshot>, QueueError> {
        let points = self.source.list_service_points().await?;
        let mappings = self.source.list_capabilities().await?;
        let snapshot = Arc::new(RegistrySnapshot::new(points, mappings));

        tracing::debug!(
            points = snapshot.all().len(),
            enabled = snapshot.enabled().len(),
            "service point registry reloaded"
        );

        *self.cache.write().await = Some(Cached {
            snapshot: snapshot.clone(),
            loaded_at: Instant::now(),
        });
        Ok(snapshot)
    }

    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }
}
