use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::queue::coordinator::QueueCoordinator;
use crate::queue::repository::ServicePointRepository;

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<QueueCoordinator>,
    pub service_points: Arc<dyn ServicePointRepository>,
}

/* -------------------------
   API envelopes
--------------------------*/

#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    pub data: T,
}

/* -------------------------
   Enums (smallint in DB)
--------------------------*/

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "smallint")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum TicketType {
    General = 0,
    Urgent = 1,
    Elderly = 2,
    Appointment = 3,
}

impl TicketType {
    pub const ALL: [TicketType; 4] = [
        TicketType::General,
        TicketType::Urgent,
        TicketType::Elderly,
        TicketType::Appointment,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TicketType::General => "GENERAL",
            TicketType::Urgent => "URGENT",
            TicketType::Elderly => "ELDERLY",
            TicketType::Appointment => "APPOINTMENT",
        }
    }

    /// Letter shown in front of the ticket number on displays and in messages.
    pub fn prefix(self) -> char {
        match self {
            TicketType::General => 'A',
            TicketType::Urgent => 'U',
            TicketType::Elderly => 'E',
            TicketType::Appointment => 'P',
        }
    }
}

impl fmt::Display for TicketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "smallint")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum TicketStatus {
    Waiting = 0,
    Active = 1,
    Completed = 2,
    Skipped = 3,
    Cancelled = 4,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::Waiting => "WAITING",
            TicketStatus::Active => "ACTIVE",
            TicketStatus::Completed => "COMPLETED",
            TicketStatus::Skipped => "SKIPPED",
            TicketStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "WAITING" => Ok(TicketStatus::Waiting),
            "ACTIVE" => Ok(TicketStatus::Active),
            "COMPLETED" => Ok(TicketStatus::Completed),
            "SKIPPED" => Ok(TicketStatus::Skipped),
            "CANCELLED" => Ok(TicketStatus::Cancelled),
            other => Err(format!("unknown ticket status: {other}")),
        }
    }
}

/* -------------------------
   DB Row Models
--------------------------*/

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Ticket {
    pub ticket_id: Uuid,
    pub number: i32,
    pub ticket_type: TicketType,
    pub status: TicketStatus,
    pub queue_date: NaiveDate,
    pub service_point_id: Option<Uuid>,

    pub patient_name: Option<String>,
    pub phone_number: Option<String>,
    pub line_user_id: Option<String>,
    pub notes: Option<String>,
    /// Set on the continuation ticket created by a transfer.
    pub transferred_from: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub called_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub skipped_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub transferred_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    /// Held tickets are WAITING rows carrying a pause marker.
    pub fn is_on_hold(&self) -> bool {
        self.status == TicketStatus::Waiting && self.paused_at.is_some()
    }

    pub fn display_number(&self) -> String {
        format!("{}{:03}", self.ticket_type.prefix(), self.number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ServicePoint {
    pub service_point_id: Uuid,
    pub code: String,
    pub name: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Capability {
    pub service_point_id: Uuid,
    pub ticket_type: TicketType,
}

/* -------------------------
   API DTOs
--------------------------*/

#[derive(Debug, Serialize)]
pub struct TicketDto {
    #[serde(flatten)]
    pub ticket: Ticket,
    pub display_number: String,
    pub on_hold: bool,
}

impl From<Ticket> for TicketDto {
    fn from(ticket: Ticket) -> Self {
        Self {
            display_number: ticket.display_number(),
            on_hold: ticket.is_on_hold(),
            ticket,
        }
    }
}
