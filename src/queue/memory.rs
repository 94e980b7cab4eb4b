//! In-memory repositories with failure injection, for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::QueueError;
use crate::models::{Capability, ServicePoint, Ticket, TicketStatus, TicketType};
use crate::queue::repository::{
    NewTicket, ServicePointPatch, ServicePointRepository, SettingsRepository, TicketFilter,
    TicketRepository,
};

#[derive(Default)]
struct State {
    tickets: Vec<Ticket>,
    points: Vec<ServicePoint>,
    capabilities: Vec<Capability>,
    settings: HashMap<(String, String), serde_json::Value>,
    /// Status another client writes just before our next guarded write.
    interfere: Option<(Uuid, TicketStatus)>,
}

#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
    fail_writes: AtomicBool,
    fail_transfer_insert: AtomicBool,
    point_loads: AtomicUsize,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_service_point(&self, code: &str, enabled: bool) -> Uuid {
        let now = Utc::now();
        let sp = ServicePoint {
            service_point_id: Uuid::new_v4(),
            code: code.to_string(),
            name: format!("Counter {code}"),
            enabled,
            created_at: now,
            updated_at: now,
        };
        let id = sp.service_point_id;
        self.state.lock().await.points.push(sp);
        id
    }

    pub async fn seed_ticket(&self, ticket: Ticket) {
        self.state.lock().await.tickets.push(ticket);
    }

    pub async fn stored(&self, ticket_id: Uuid) -> Option<Ticket> {
        self.state
            .lock()
            .await
            .tickets
            .iter()
            .find(|t| t.ticket_id == ticket_id)
            .cloned()
    }

    pub async fn ticket_count(&self) -> usize {
        self.state.lock().await.tickets.len()
    }

    /// Every ticket write fails with a repository error.
    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    /// The second half of a transfer (the insert) fails.
    pub fn fail_transfer_insert(&self, on: bool) {
        self.fail_transfer_insert.store(on, Ordering::SeqCst);
    }

    pub fn service_point_loads(&self) -> usize {
        self.point_loads.load(Ordering::SeqCst)
    }

    /// The next guarded write on `ticket_id` finds it already moved to
    /// `status`, as if another counter got there first.
    pub async fn interfere_once(&self, ticket_id: Uuid, status: TicketStatus) {
        self.state.lock().await.interfere = Some((ticket_id, status));
    }

    fn check_writes(&self) -> Result<(), QueueError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(QueueError::Repository("injected write failure".into()));
        }
        Ok(())
    }
}

fn build_ticket(state: &State, new: &NewTicket, start_number: i32) -> Ticket {
    let number = new.number.unwrap_or_else(|| {
        state
            .tickets
            .iter()
            .filter(|t| {
                t.ticket_type == new.ticket_type
                    && t.queue_date == new.queue_date
                    && t.transferred_from.is_none()
            })
            .map(|t| t.number + 1)
            .max()
            .unwrap_or(start_number)
    });
    let now = Utc::now();
    Ticket {
        ticket_id: Uuid::new_v4(),
        number,
        ticket_type: new.ticket_type,
        status: TicketStatus::Waiting,
        queue_date: new.queue_date,
        service_point_id: new.service_point_id,
        patient_name: new.patient_name.clone(),
        phone_number: new.phone_number.clone(),
        line_user_id: new.line_user_id.clone(),
        notes: new.notes.clone(),
        transferred_from: new.transferred_from,
        created_at: now,
        called_at: None,
        completed_at: None,
        skipped_at: None,
        cancelled_at: None,
        paused_at: None,
        transferred_at: None,
        updated_at: now,
    }
}

fn apply_interference(state: &mut State) {
    let Some((id, status)) = state.interfere.take() else {
        return;
    };
    if let Some(t) = state.tickets.iter_mut().find(|t| t.ticket_id == id) {
        t.status = status;
        t.updated_at = Utc::now();
    }
}

fn guarded_update(
    state: &State,
    ticket: &Ticket,
    expected: &[TicketStatus],
) -> Option<(usize, Ticket)> {
    let idx = state
        .tickets
        .iter()
        .position(|t| t.ticket_id == ticket.ticket_id)?;
    if !expected.contains(&state.tickets[idx].status) {
        return None;
    }
    let mut updated = ticket.clone();
    updated.updated_at = Utc::now();
    Some((idx, updated))
}

#[async_trait]
impl TicketRepository for MemoryRepository {
    async fn list_tickets(&self, filter: &TicketFilter) -> Result<Vec<Ticket>, QueueError> {
        let state = self.state.lock().await;
        let mut out: Vec<Ticket> = state
            .tickets
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.number.cmp(&b.number)));
        Ok(out)
    }

    async fn get_ticket(&self, ticket_id: Uuid) -> Result<Option<Ticket>, QueueError> {
        Ok(self.stored(ticket_id).await)
    }

    async fn insert_ticket(
        &self,
        new: NewTicket,
        start_number: i32,
    ) -> Result<Ticket, QueueError> {
        self.check_writes()?;
        let mut state = self.state.lock().await;
        let ticket = build_ticket(&state, &new, start_number);
        state.tickets.push(ticket.clone());
        Ok(ticket)
    }

    async fn update_ticket_if(
        &self,
        ticket: &Ticket,
        expected: &[TicketStatus],
    ) -> Result<Option<Ticket>, QueueError> {
        self.check_writes()?;
        let mut state = self.state.lock().await;
        apply_interference(&mut state);
        let Some((idx, updated)) = guarded_update(&state, ticket, expected) else {
            return Ok(None);
        };
        state.tickets[idx] = updated.clone();
        Ok(Some(updated))
    }

    async fn transfer_ticket(
        &self,
        closed: &Ticket,
        expected: &[TicketStatus],
        continuation: NewTicket,
    ) -> Result<Option<(Ticket, Ticket)>, QueueError> {
        self.check_writes()?;
        let mut state = self.state.lock().await;
        apply_interference(&mut state);
        let Some((idx, source)) = guarded_update(&state, closed, expected) else {
            return Ok(None);
        };
        // Nothing is applied until both halves succeed.
        if self.fail_transfer_insert.load(Ordering::SeqCst) {
            return Err(QueueError::Repository("injected insert failure".into()));
        }
        let target = build_ticket(&state, &continuation, 1);
        state.tickets[idx] = source.clone();
        state.tickets.push(target.clone());
        Ok(Some((source, target)))
    }
}

#[async_trait]
impl ServicePointRepository for MemoryRepository {
    async fn list_service_points(&self) -> Result<Vec<ServicePoint>, QueueError> {
        self.point_loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().await.points.clone())
    }

    async fn list_capabilities(&self) -> Result<Vec<Capability>, QueueError> {
        Ok(self.state.lock().await.capabilities.clone())
    }

    async fn create_service_point(
        &self,
        code: &str,
        name: &str,
        enabled: bool,
    ) -> Result<ServicePoint, QueueError> {
        let mut state = self.state.lock().await;
        if state.points.iter().any(|sp| sp.code == code) {
            return Err(QueueError::Validation(format!(
                "service point code '{code}' already exists"
            )));
        }
        let now = Utc::now();
        let sp = ServicePoint {
            service_point_id: Uuid::new_v4(),
            code: code.to_string(),
            name: name.to_string(),
            enabled,
            created_at: now,
            updated_at: now,
        };
        state.points.push(sp.clone());
        Ok(sp)
    }

    async fn update_service_point(
        &self,
        service_point_id: Uuid,
        patch: ServicePointPatch,
    ) -> Result<Option<ServicePoint>, QueueError> {
        let mut state = self.state.lock().await;
        let Some(sp) = state
            .points
            .iter_mut()
            .find(|sp| sp.service_point_id == service_point_id)
        else {
            return Ok(None);
        };
        if let Some(code) = patch.code {
            sp.code = code;
        }
        if let Some(name) = patch.name {
            sp.name = name;
        }
        if let Some(enabled) = patch.enabled {
            sp.enabled = enabled;
        }
        sp.updated_at = Utc::now();
        Ok(Some(sp.clone()))
    }

    async fn set_capabilities(
        &self,
        service_point_id: Uuid,
        types: &[TicketType],
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state
            .capabilities
            .retain(|c| c.service_point_id != service_point_id);
        for ty in types {
            state.capabilities.push(Capability {
                service_point_id,
                ticket_type: *ty,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SettingsRepository for MemoryRepository {
    async fn get_setting(
        &self,
        category: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, QueueError> {
        let state = self.state.lock().await;
        Ok(state
            .settings
            .get(&(category.to_string(), key.to_string()))
            .cloned())
    }

    async fn put_setting(
        &self,
        category: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state
            .settings
            .insert((category.to_string(), key.to_string()), value);
        Ok(())
    }
}
