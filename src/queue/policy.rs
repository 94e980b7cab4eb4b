//! Scheduling policies: ordering of waiting tickets and service point suggestion.
//!
//! Everything here is a pure function of its arguments. The caller reads the
//! active [`SchedulingConfig`] from settings and passes it in together with the
//! current time, so two calls with the same inputs always agree.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Ticket, TicketStatus, TicketType};
use crate::queue::registry::RegistrySnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Policy {
    Fifo,
    Priority,
    Multilevel,
    MultilevelFeedback { aging: AgingConfig },
}

impl Policy {
    pub fn name(&self) -> &'static str {
        match self {
            Policy::Fifo => "FIFO",
            Policy::Priority => "PRIORITY",
            Policy::Multilevel => "MULTILEVEL",
            Policy::MultilevelFeedback { .. } => "MULTILEVEL_FEEDBACK",
        }
    }

    /// Parses a policy name as stored by operators (`FIFO`, `PRIORITY`, ...).
    /// The aging config is only used by the feedback policy.
    pub fn from_name(name: &str, aging: AgingConfig) -> Option<Self> {
        match name.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "FIFO" => Some(Policy::Fifo),
            "PRIORITY" => Some(Policy::Priority),
            "MULTILEVEL" => Some(Policy::Multilevel),
            "MULTILEVEL_FEEDBACK" | "MLFQ" => Some(Policy::MultilevelFeedback { aging }),
            _ => None,
        }
    }
}

/// Cumulative wait thresholds. Each threshold a ticket has waited past
/// promotes it one level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgingConfig {
    pub step_minutes: Vec<i64>,
}

impl Default for AgingConfig {
    fn default() -> Self {
        Self {
            step_minutes: vec![15, 30, 45],
        }
    }
}

impl AgingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.step_minutes.is_empty() {
            return Err("aging needs at least one threshold".into());
        }
        if self.step_minutes.iter().any(|m| *m <= 0) {
            return Err("aging thresholds must be positive minutes".into());
        }
        if self.step_minutes.windows(2).any(|w| w[0] >= w[1]) {
            return Err("aging thresholds must be strictly increasing".into());
        }
        Ok(())
    }

    /// Number of thresholds passed after waiting `waited`.
    pub fn promotions(&self, waited: Duration) -> u8 {
        let minutes = waited.num_minutes();
        let passed = self.step_minutes.iter().filter(|m| minutes >= **m).count();
        u8::try_from(passed).unwrap_or(u8::MAX)
    }
}

/// Static rank per ticket type. Higher is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRanking {
    pub urgent: u8,
    pub elderly: u8,
    pub appointment: u8,
    pub general: u8,
}

impl Default for TypeRanking {
    fn default() -> Self {
        Self {
            urgent: 3,
            elderly: 2,
            appointment: 1,
            general: 0,
        }
    }
}

impl TypeRanking {
    pub fn rank(&self, ticket_type: TicketType) -> u8 {
        match ticket_type {
            TicketType::Urgent => self.urgent,
            TicketType::Elderly => self.elderly,
            TicketType::Appointment => self.appointment,
            TicketType::General => self.general,
        }
    }

    pub fn top(&self) -> u8 {
        self.urgent
            .max(self.elderly)
            .max(self.appointment)
            .max(self.general)
    }
}

/// Where a held ticket sits when it goes back to waiting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeldPlacement {
    /// Keep the original issue time: the ticket resumes its old position.
    #[default]
    Keep,
    /// Queue the ticket again from the moment it was put on hold.
    Requeue,
}

impl HeldPlacement {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "keep" => Some(HeldPlacement::Keep),
            "requeue" => Some(HeldPlacement::Requeue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingConfig {
    pub policy: Policy,
    #[serde(default)]
    pub ranking: TypeRanking,
    #[serde(default)]
    pub held: HeldPlacement,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            policy: Policy::Fifo,
            ranking: TypeRanking::default(),
            held: HeldPlacement::default(),
        }
    }
}

impl SchedulingConfig {
    pub fn validate(&self) -> Result<(), String> {
        match &self.policy {
            Policy::MultilevelFeedback { aging } => aging.validate(),
            _ => Ok(()),
        }
    }
}

/// One level of the queue as seen by the active policy, FIFO inside.
#[derive(Debug, Clone, Serialize)]
pub struct SubQueue<'a> {
    pub level: u8,
    pub ticket_type: Option<TicketType>,
    pub tickets: Vec<&'a Ticket>,
}

/// Timestamp a ticket is ordered by inside its level.
pub fn queue_key(ticket: &Ticket, held: HeldPlacement) -> DateTime<Utc> {
    match held {
        HeldPlacement::Keep => ticket.created_at,
        HeldPlacement::Requeue => ticket.paused_at.unwrap_or(ticket.created_at),
    }
}

/// Rank used for level selection. Only the feedback policy ages tickets,
/// and the result never decreases as `now` moves forward.
pub fn effective_rank(ticket: &Ticket, config: &SchedulingConfig, now: DateTime<Utc>) -> u8 {
    let base = config.ranking.rank(ticket.ticket_type);
    match &config.policy {
        Policy::MultilevelFeedback { aging } => {
            let waited = (now - queue_key(ticket, config.held)).max(Duration::zero());
            base.saturating_add(aging.promotions(waited))
                .min(config.ranking.top().max(base))
        }
        _ => base,
    }
}

fn fifo_cmp(a: &Ticket, b: &Ticket, held: HeldPlacement) -> Ordering {
    queue_key(a, held)
        .cmp(&queue_key(b, held))
        .then_with(|| a.number.cmp(&b.number))
        .then_with(|| a.ticket_id.cmp(&b.ticket_id))
}

/// Splits the waiting tickets into the levels of the configured policy,
/// highest level first.
pub fn sub_queues<'a>(
    tickets: &'a [Ticket],
    config: &SchedulingConfig,
    now: DateTime<Utc>,
) -> Vec<SubQueue<'a>> {
    let mut waiting: Vec<&Ticket> = tickets
        .iter()
        .filter(|t| t.status == TicketStatus::Waiting)
        .collect();
    waiting.sort_by(|a, b| fifo_cmp(a, b, config.held));

    match &config.policy {
        Policy::Fifo => {
            if waiting.is_empty() {
                Vec::new()
            } else {
                vec![SubQueue {
                    level: 0,
                    ticket_type: None,
                    tickets: waiting,
                }]
            }
        }
        Policy::Priority | Policy::MultilevelFeedback { .. } => {
            let mut levels: BTreeMap<u8, Vec<&Ticket>> = BTreeMap::new();
            for t in waiting {
                levels
                    .entry(effective_rank(t, config, now))
                    .or_default()
                    .push(t);
            }
            levels
                .into_iter()
                .rev()
                .map(|(level, tickets)| SubQueue {
                    level,
                    ticket_type: None,
                    tickets,
                })
                .collect()
        }
        Policy::Multilevel => {
            let mut per_type: BTreeMap<TicketType, Vec<&Ticket>> = BTreeMap::new();
            for t in waiting {
                per_type.entry(t.ticket_type).or_default().push(t);
            }
            let mut queues: Vec<SubQueue<'a>> = per_type
                .into_iter()
                .map(|(ticket_type, tickets)| SubQueue {
                    level: config.ranking.rank(ticket_type),
                    ticket_type: Some(ticket_type),
                    tickets,
                })
                .collect();
            // Stable: equal ranks keep type declaration order.
            queues.sort_by(|a, b| b.level.cmp(&a.level));
            queues
        }
    }
}

/// Waiting tickets, best candidate first.
pub fn order<'a>(
    tickets: &'a [Ticket],
    config: &SchedulingConfig,
    now: DateTime<Utc>,
) -> Vec<&'a Ticket> {
    sub_queues(tickets, config, now)
        .into_iter()
        .flat_map(|q| q.tickets)
        .collect()
}

pub fn next_ticket<'a>(
    tickets: &'a [Ticket],
    config: &SchedulingConfig,
    now: DateTime<Utc>,
) -> Option<&'a Ticket> {
    order(tickets, config, now).into_iter().next()
}

/// Waiting tickets a service point may call: those already assigned to it,
/// plus unassigned ones (or ones stranded on a disabled point) whose type it
/// can serve.
pub fn candidates_for_service_point(
    tickets: &[Ticket],
    registry: &RegistrySnapshot,
    service_point_id: Uuid,
) -> Vec<Ticket> {
    if !registry.is_enabled(service_point_id) {
        return Vec::new();
    }
    tickets
        .iter()
        .filter(|t| t.status == TicketStatus::Waiting)
        .filter(|t| match t.service_point_id {
            Some(owner) if owner == service_point_id => true,
            Some(owner) if registry.is_enabled(owner) => false,
            _ => registry.may_serve(service_point_id, t.ticket_type),
        })
        .cloned()
        .collect()
}

/// Suggests a service point for a new or unassigned ticket: a random enabled
/// point mapped to the type, else the first enabled point.
pub fn suggest_service_point<R: Rng + ?Sized>(
    ticket_type: TicketType,
    registry: &RegistrySnapshot,
    rng: &mut R,
) -> Option<Uuid> {
    let mapped = registry.mapped_points(ticket_type);
    if let Some(sp) = mapped.choose(rng) {
        return Some(*sp);
    }
    registry.enabled().first().map(|sp| sp.service_point_id)
}
