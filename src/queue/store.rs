//! Read-mostly cache of the day's tickets.
//!
//! The repository stays the source of truth: the cache is rebuilt on every
//! change notification and patched by id after the coordinator's own writes.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Ticket, TicketStatus, TicketType};

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusPartitions {
    pub waiting: Vec<Ticket>,
    pub on_hold: Vec<Ticket>,
    pub active: Vec<Ticket>,
    pub completed: Vec<Ticket>,
    pub skipped: Vec<Ticket>,
    pub cancelled: Vec<Ticket>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub waiting_by_type: BTreeMap<TicketType, usize>,
    pub waiting: usize,
    pub on_hold: usize,
    pub active: usize,
    pub completed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    /// Issue to first call, over tickets that have been called.
    pub average_wait_seconds: Option<i64>,
    /// First call to completion, over completed tickets.
    pub average_service_seconds: Option<i64>,
    pub longest_current_wait_seconds: Option<i64>,
}

#[derive(Default)]
struct DayTickets {
    day: Option<NaiveDate>,
    tickets: HashMap<Uuid, Ticket>,
}

#[derive(Default)]
pub struct TicketStore {
    inner: RwLock<DayTickets>,
}

impl TicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the cache with the tickets of `day`.
    pub async fn rebuild(&self, day: NaiveDate, tickets: Vec<Ticket>) {
        let tickets: HashMap<Uuid, Ticket> =
            tickets.into_iter().map(|t| (t.ticket_id, t)).collect();
        *self.inner.write().await = DayTickets {
            day: Some(day),
            tickets,
        };
    }

    /// Queue day of the last rebuild, `None` before the first one.
    pub async fn day(&self) -> Option<NaiveDate> {
        self.inner.read().await.day
    }

    pub async fn replace(&self, ticket: Ticket) {
        self.inner
            .write()
            .await
            .tickets
            .insert(ticket.ticket_id, ticket);
    }

    pub async fn get(&self, ticket_id: Uuid) -> Option<Ticket> {
        self.inner.read().await.tickets.get(&ticket_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.tickets.len()
    }

    /// All cached tickets in issue order.
    pub async fn all(&self) -> Vec<Ticket> {
        let mut out: Vec<Ticket> = self
            .inner
            .read()
            .await
            .tickets
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.number.cmp(&b.number))
        });
        out
    }

    /// WAITING tickets, held ones included.
    pub async fn waiting(&self) -> Vec<Ticket> {
        self.all()
            .await
            .into_iter()
            .filter(|t| t.status == TicketStatus::Waiting)
            .collect()
    }

    pub async fn partitions(&self) -> StatusPartitions {
        partition(self.all().await)
    }

    pub async fn stats(&self, now: DateTime<Utc>) -> QueueStats {
        compute_stats(&self.all().await, now)
    }
}

pub fn partition(tickets: Vec<Ticket>) -> StatusPartitions {
    let mut p = StatusPartitions::default();
    for t in tickets {
        match t.status {
            TicketStatus::Waiting if t.is_on_hold() => p.on_hold.push(t),
            TicketStatus::Waiting => p.waiting.push(t),
            TicketStatus::Active => p.active.push(t),
            TicketStatus::Completed => p.completed.push(t),
            TicketStatus::Skipped => p.skipped.push(t),
            TicketStatus::Cancelled => p.cancelled.push(t),
        }
    }
    p
}

fn mean(values: &[i64]) -> Option<i64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<i64>() / values.len() as i64)
    }
}

pub fn compute_stats(tickets: &[Ticket], now: DateTime<Utc>) -> QueueStats {
    let mut stats = QueueStats {
        total: tickets.len(),
        ..QueueStats::default()
    };
    let mut waits = Vec::new();
    let mut services = Vec::new();

    for t in tickets {
        match t.status {
            TicketStatus::Waiting => {
                if t.is_on_hold() {
                    stats.on_hold += 1;
                } else {
                    stats.waiting += 1;
                }
                *stats.waiting_by_type.entry(t.ticket_type).or_default() += 1;
                let waited = (now - t.created_at).num_seconds().max(0);
                stats.longest_current_wait_seconds =
                    Some(stats.longest_current_wait_seconds.unwrap_or(0).max(waited));
            }
            TicketStatus::Active => stats.active += 1,
            TicketStatus::Completed => stats.completed += 1,
            TicketStatus::Skipped => stats.skipped += 1,
            TicketStatus::Cancelled => stats.cancelled += 1,
        }

        if let Some(called) = t.called_at {
            waits.push((called - t.created_at).num_seconds().max(0));
            if let (TicketStatus::Completed, Some(done)) = (t.status, t.completed_at) {
                services.push((done - called).num_seconds().max(0));
            }
        }
    }

    stats.average_wait_seconds = mean(&waits);
    stats.average_service_seconds = mean(&services);
    stats
}
