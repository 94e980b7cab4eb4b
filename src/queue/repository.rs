//! Persistence seams for the queue. The coordinator only talks to these
//! traits; `postgres` implements them over sqlx.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::QueueError;
use crate::models::{Capability, ServicePoint, Ticket, TicketStatus, TicketType};

#[derive(Debug, Clone, Default)]
pub struct TicketFilter {
    pub queue_date: Option<NaiveDate>,
    pub status: Option<TicketStatus>,
    pub service_point_id: Option<Uuid>,
}

impl TicketFilter {
    pub fn matches(&self, t: &Ticket) -> bool {
        self.queue_date.is_none_or(|d| t.queue_date == d)
            && self.status.is_none_or(|s| t.status == s)
            && self
                .service_point_id
                .is_none_or(|sp| t.service_point_id == Some(sp))
    }
}

/// A ticket to insert. `number` is only given for transfer continuations;
/// otherwise the repository assigns the next number for `(type, date)`.
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub ticket_type: TicketType,
    pub queue_date: NaiveDate,
    pub service_point_id: Option<Uuid>,
    pub patient_name: Option<String>,
    pub phone_number: Option<String>,
    pub line_user_id: Option<String>,
    pub notes: Option<String>,
    pub transferred_from: Option<Uuid>,
    pub number: Option<i32>,
}

#[async_trait]
pub trait TicketRepository: Send + Sync {
    async fn list_tickets(&self, filter: &TicketFilter) -> Result<Vec<Ticket>, QueueError>;

    async fn get_ticket(&self, ticket_id: Uuid) -> Result<Option<Ticket>, QueueError>;

    async fn insert_ticket(&self, new: NewTicket, start_number: i32)
        -> Result<Ticket, QueueError>;

    /// Writes the mutable fields of `ticket` only if the stored row is still in
    /// one of `expected`. `None` means the guard did not match.
    async fn update_ticket_if(
        &self,
        ticket: &Ticket,
        expected: &[TicketStatus],
    ) -> Result<Option<Ticket>, QueueError>;

    /// Closes `closed` and inserts `continuation` as one atomic unit.
    async fn transfer_ticket(
        &self,
        closed: &Ticket,
        expected: &[TicketStatus],
        continuation: NewTicket,
    ) -> Result<Option<(Ticket, Ticket)>, QueueError>;
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServicePointPatch {
    pub code: Option<String>,
    pub name: Option<String>,
    pub enabled: Option<bool>,
}

#[async_trait]
pub trait ServicePointRepository: Send + Sync {
    async fn list_service_points(&self) -> Result<Vec<ServicePoint>, QueueError>;

    async fn list_capabilities(&self) -> Result<Vec<Capability>, QueueError>;

    async fn create_service_point(
        &self,
        code: &str,
        name: &str,
        enabled: bool,
    ) -> Result<ServicePoint, QueueError>;

    async fn update_service_point(
        &self,
        service_point_id: Uuid,
        patch: ServicePointPatch,
    ) -> Result<Option<ServicePoint>, QueueError>;

    /// Replaces the full set of ticket types the point may serve.
    async fn set_capabilities(
        &self,
        service_point_id: Uuid,
        types: &[TicketType],
    ) -> Result<(), QueueError>;
}

/// Operator settings, stored as JSON per (category, key).
#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn get_setting(
        &self,
        category: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, QueueError>;

    async fn put_setting(
        &self,
        category: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), QueueError>;
}
