//! Queue action coordinator.
//!
//! Every status change goes through here: validate against the stored row,
//! write with a status guard, patch the local cache by id, then fire side
//! effects (announcement event, reminders) that can never fail the action.

use std::sync::Arc;

use chrono::{FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::QueueError;
use crate::models::{Ticket, TicketStatus, TicketType};
use crate::queue::notify::{self, Notifier, QueueEvent, Recipient};
use crate::queue::policy::{self, SchedulingConfig, SubQueue};
use crate::queue::registry::{RegistrySnapshot, ServicePointRegistry};
use crate::queue::repository::{NewTicket, SettingsRepository, TicketFilter, TicketRepository};
use crate::queue::store::{QueueStats, StatusPartitions, TicketStore};

pub const SETTINGS_CATEGORY: &str = "queue";
pub const SCHEDULING_KEY: &str = "scheduling";

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Used when no scheduling settings are stored yet.
    pub default_scheduling: SchedulingConfig,
    pub start_number: i32,
    /// How many waiting tickets get a reminder after each call.
    pub notify_ahead: usize,
    /// Local offset used to decide which queue day "now" belongs to.
    pub utc_offset: FixedOffset,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            default_scheduling: SchedulingConfig::default(),
            start_number: 1,
            notify_ahead: 3,
            utc_offset: Utc.fix(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssueTicket {
    pub ticket_type: Option<TicketType>,
    pub service_point_id: Option<Uuid>,
    pub patient_name: Option<String>,
    pub phone_number: Option<String>,
    pub line_user_id: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferRequest {
    pub from_service_point_id: Uuid,
    pub to_service_point_id: Uuid,
    pub notes: Option<String>,
    pub new_type: Option<TicketType>,
}

#[derive(Debug, Serialize)]
pub struct BoardLevel {
    pub level: u8,
    pub ticket_type: Option<TicketType>,
    pub tickets: Vec<Ticket>,
}

impl From<SubQueue<'_>> for BoardLevel {
    fn from(q: SubQueue<'_>) -> Self {
        Self {
            level: q.level,
            ticket_type: q.ticket_type,
            tickets: q.tickets.into_iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct QueueBoard {
    pub queue_date: NaiveDate,
    pub policy: &'static str,
    pub service_point_id: Option<Uuid>,
    pub levels: Vec<BoardLevel>,
    pub up_next: Vec<Ticket>,
    pub partitions: StatusPartitions,
}

pub struct QueueCoordinator {
    tickets: Arc<dyn TicketRepository>,
    settings: Arc<dyn SettingsRepository>,
    registry: Arc<ServicePointRegistry>,
    store: TicketStore,
    notifier: Arc<dyn Notifier>,
    events: broadcast::Sender<QueueEvent>,
    options: CoordinatorOptions,
}

fn require(ticket: &Ticket, allowed: &[TicketStatus], label: &'static str) -> Result<(), QueueError> {
    if allowed.contains(&ticket.status) {
        Ok(())
    } else {
        Err(QueueError::InvalidTransition {
            expected: label,
            actual: ticket.status,
        })
    }
}

fn append_note(notes: Option<String>, line: String) -> Option<String> {
    match notes {
        Some(existing) if !existing.trim().is_empty() => Some(format!("{existing}\n{line}")),
        _ => Some(line),
    }
}

fn clean(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl QueueCoordinator {
    pub fn new(
        tickets: Arc<dyn TicketRepository>,
        settings: Arc<dyn SettingsRepository>,
        registry: Arc<ServicePointRegistry>,
        notifier: Arc<dyn Notifier>,
        options: CoordinatorOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            tickets,
            settings,
            registry,
            store: TicketStore::new(),
            notifier,
            events,
            options,
        }
    }

    pub fn registry(&self) -> &Arc<ServicePointRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &TicketStore {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.options.utc_offset).date_naive()
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn load(&self, ticket_id: Uuid) -> Result<Ticket, QueueError> {
        self.tickets
            .get_ticket(ticket_id)
            .await?
            .ok_or_else(|| QueueError::ticket_not_found(ticket_id))
    }

    async fn enabled_point(
        &self,
        service_point_id: Uuid,
    ) -> Result<Arc<RegistrySnapshot>, QueueError> {
        let snapshot = self.registry.snapshot().await?;
        match snapshot.get(service_point_id) {
            None => Err(QueueError::service_point_not_found(service_point_id)),
            Some(sp) if !sp.enabled => Err(QueueError::validation(format!(
                "service point {} is disabled",
                sp.code
            ))),
            Some(_) => Ok(snapshot),
        }
    }

    async fn write(
        &self,
        updated: Ticket,
        expected: &[TicketStatus],
        action: &'static str,
    ) -> Result<Ticket, QueueError> {
        let saved = match self.tickets.update_ticket_if(&updated, expected).await {
            Ok(Some(saved)) => saved,
            Ok(None) => {
                tracing::warn!(ticket_id = %updated.ticket_id, action, "guarded write lost a race");
                return Err(QueueError::lost_race());
            }
            Err(e) => {
                tracing::error!(ticket_id = %updated.ticket_id, action, error = %e, "ticket write failed");
                return Err(e);
            }
        };
        self.store.replace(saved.clone()).await;
        tracing::info!(
            ticket_id = %saved.ticket_id,
            number = %saved.display_number(),
            status = %saved.status,
            action,
            "ticket updated"
        );
        Ok(saved)
    }

    /* ---------------- settings ---------------- */

    /// Scheduling config in effect right now. Unreadable or missing settings
    /// fall back to the configured default.
    pub async fn scheduling(&self) -> SchedulingConfig {
        match self
            .settings
            .get_setting(SETTINGS_CATEGORY, SCHEDULING_KEY)
            .await
        {
            Ok(Some(value)) => match serde_json::from_value::<SchedulingConfig>(value) {
                Ok(cfg) => match cfg.validate() {
                    Ok(()) => cfg,
                    Err(e) => {
                        tracing::warn!(error = %e, "stored scheduling settings are invalid, using default");
                        self.options.default_scheduling.clone()
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "stored scheduling settings are invalid, using default");
                    self.options.default_scheduling.clone()
                }
            },
            Ok(None) => self.options.default_scheduling.clone(),
            Err(e) => {
                tracing::warn!(error = %e, "could not read scheduling settings, using default");
                self.options.default_scheduling.clone()
            }
        }
    }

    pub async fn set_scheduling(
        &self,
        config: SchedulingConfig,
    ) -> Result<SchedulingConfig, QueueError> {
        config.validate().map_err(QueueError::Validation)?;
        let value = serde_json::to_value(&config)
            .map_err(|e| QueueError::Repository(format!("encode settings: {e}")))?;
        self.settings
            .put_setting(SETTINGS_CATEGORY, SCHEDULING_KEY, value)
            .await?;
        tracing::info!(policy = config.policy.name(), "scheduling policy changed");
        Ok(config)
    }

    /* ---------------- reads ---------------- */

    /// Rebuilds the cache from the repository for today.
    pub async fn refresh(&self) -> Result<usize, QueueError> {
        let today = self.today();
        let filter = TicketFilter {
            queue_date: Some(today),
            ..TicketFilter::default()
        };
        let tickets = self.tickets.list_tickets(&filter).await?;
        let n = tickets.len();
        self.store.rebuild(today, tickets).await;
        tracing::debug!(tickets = n, "ticket store refreshed");
        self.emit(QueueEvent::Refreshed { tickets: n });
        Ok(n)
    }

    /// Rebuilds the cache when it still holds an earlier queue day.
    async fn ensure_current_day(&self) -> Result<(), QueueError> {
        let today = self.today();
        if self.store.day().await != Some(today) {
            tracing::info!(%today, "queue day changed, reloading tickets");
            self.refresh().await?;
        }
        Ok(())
    }

    pub async fn get_ticket(&self, ticket_id: Uuid) -> Result<Ticket, QueueError> {
        self.load(ticket_id).await
    }

    pub async fn list_tickets(&self, filter: TicketFilter) -> Result<Vec<Ticket>, QueueError> {
        self.tickets.list_tickets(&filter).await
    }

    pub async fn board(&self, service_point_id: Option<Uuid>) -> Result<QueueBoard, QueueError> {
        self.ensure_current_day().await?;
        let scheduling = self.scheduling().await;
        let all = self.store.all().await;
        let waiting = match service_point_id {
            Some(sp) => {
                let snapshot = self.registry.snapshot().await?;
                if snapshot.get(sp).is_none() {
                    return Err(QueueError::service_point_not_found(sp));
                }
                policy::candidates_for_service_point(&all, &snapshot, sp)
            }
            None => all
                .iter()
                .filter(|t| t.status == TicketStatus::Waiting)
                .cloned()
                .collect(),
        };

        let now = Utc::now();
        let levels: Vec<BoardLevel> = policy::sub_queues(&waiting, &scheduling, now)
            .into_iter()
            .map(BoardLevel::from)
            .collect();
        let up_next = levels.iter().flat_map(|l| l.tickets.iter().cloned()).collect();

        Ok(QueueBoard {
            queue_date: self.today(),
            policy: scheduling.policy.name(),
            service_point_id,
            levels,
            up_next,
            partitions: crate::queue::store::partition(all),
        })
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.ensure_current_day().await?;
        Ok(self.store.stats(Utc::now()).await)
    }

    /* ---------------- transitions ---------------- */

    pub async fn issue_ticket(&self, req: IssueTicket) -> Result<Ticket, QueueError> {
        let ticket_type = req.ticket_type.unwrap_or(TicketType::General);
        let snapshot = self.registry.snapshot().await?;

        let service_point_id = match req.service_point_id {
            Some(sp) => {
                if !snapshot.is_enabled(sp) {
                    return Err(QueueError::validation(
                        "service point is disabled or unknown",
                    ));
                }
                Some(sp)
            }
            None => {
                let mut rng = rand::thread_rng();
                policy::suggest_service_point(ticket_type, &snapshot, &mut rng)
            }
        };

        let new = NewTicket {
            ticket_type,
            queue_date: self.today(),
            service_point_id,
            patient_name: clean(req.patient_name),
            phone_number: clean(req.phone_number),
            line_user_id: clean(req.line_user_id),
            notes: clean(req.notes),
            transferred_from: None,
            number: None,
        };

        let ticket = self
            .tickets
            .insert_ticket(new, self.options.start_number)
            .await
            .inspect_err(|e| tracing::error!(error = %e, "issue ticket failed"))?;

        self.store.replace(ticket.clone()).await;
        tracing::info!(
            ticket_id = %ticket.ticket_id,
            number = %ticket.display_number(),
            service_point_id = ?ticket.service_point_id,
            "ticket issued"
        );
        self.emit(QueueEvent::Issued {
            ticket: ticket.clone(),
        });
        Ok(ticket)
    }

    pub async fn call_ticket(
        &self,
        ticket_id: Uuid,
        service_point_id: Option<Uuid>,
    ) -> Result<Ticket, QueueError> {
        let ticket = self.load(ticket_id).await?;
        require(&ticket, &[TicketStatus::Waiting], "waiting")?;

        let target = service_point_id
            .or(ticket.service_point_id)
            .ok_or_else(|| QueueError::validation("service_point_id is required"))?;
        let snapshot = self.enabled_point(target).await?;

        // A held ticket keeps the time it was first called.
        let called_at = match ticket.called_at {
            Some(at) if ticket.is_on_hold() => at,
            _ => Utc::now(),
        };
        let updated = Ticket {
            status: TicketStatus::Active,
            called_at: Some(called_at),
            service_point_id: Some(target),
            paused_at: None,
            ..ticket
        };
        let saved = self.write(updated, &[TicketStatus::Waiting], "call").await?;

        let point_name = snapshot
            .get(target)
            .map(|sp| sp.name.clone())
            .unwrap_or_default();
        self.emit(QueueEvent::Called {
            ticket: saved.clone(),
            service_point: point_name.clone(),
        });
        self.remind_upcoming(target, &snapshot, &point_name).await;

        Ok(saved)
    }

    /// Calls the best waiting ticket for the service point under the current
    /// scheduling settings. `None` when nothing is waiting for it.
    pub async fn call_next(&self, service_point_id: Uuid) -> Result<Option<Ticket>, QueueError> {
        let snapshot = self.enabled_point(service_point_id).await?;
        let scheduling = self.scheduling().await;

        let filter = TicketFilter {
            queue_date: Some(self.today()),
            status: Some(TicketStatus::Waiting),
            ..TicketFilter::default()
        };
        let waiting = self.tickets.list_tickets(&filter).await?;
        let candidates = policy::candidates_for_service_point(&waiting, &snapshot, service_point_id);

        let Some(next) = policy::next_ticket(&candidates, &scheduling, Utc::now()) else {
            tracing::info!(%service_point_id, policy = scheduling.policy.name(), "no ticket to call");
            return Ok(None);
        };
        tracing::debug!(
            ticket_id = %next.ticket_id,
            policy = scheduling.policy.name(),
            "call-next picked ticket"
        );

        let called = self.call_ticket(next.ticket_id, Some(service_point_id)).await?;
        Ok(Some(called))
    }

    pub async fn complete_ticket(&self, ticket_id: Uuid) -> Result<Ticket, QueueError> {
        let ticket = self.load(ticket_id).await?;
        require(&ticket, &[TicketStatus::Active], "active")?;

        let now = Utc::now();
        let updated = Ticket {
            status: TicketStatus::Completed,
            called_at: Some(ticket.called_at.unwrap_or(now)),
            completed_at: Some(now),
            ..ticket
        };
        let saved = self.write(updated, &[TicketStatus::Active], "complete").await?;
        self.emit(QueueEvent::Completed {
            ticket: saved.clone(),
        });
        Ok(saved)
    }

    /// Skips a waiting ticket, or a called one whose patient did not show up.
    pub async fn skip_ticket(&self, ticket_id: Uuid) -> Result<Ticket, QueueError> {
        const FROM: [TicketStatus; 2] = [TicketStatus::Waiting, TicketStatus::Active];
        let ticket = self.load(ticket_id).await?;
        require(&ticket, &FROM, "waiting or active")?;

        let updated = Ticket {
            status: TicketStatus::Skipped,
            skipped_at: Some(Utc::now()),
            paused_at: None,
            ..ticket
        };
        let saved = self.write(updated, &FROM, "skip").await?;
        self.emit(QueueEvent::Skipped {
            ticket: saved.clone(),
        });
        Ok(saved)
    }

    pub async fn cancel_ticket(
        &self,
        ticket_id: Uuid,
        reason: Option<String>,
    ) -> Result<Ticket, QueueError> {
        const FROM: [TicketStatus; 2] = [TicketStatus::Waiting, TicketStatus::Active];
        let ticket = self.load(ticket_id).await?;
        require(&ticket, &FROM, "waiting or active")?;

        let notes = match clean(reason) {
            Some(r) => append_note(ticket.notes.clone(), format!("Cancelled: {r}")),
            None => ticket.notes.clone(),
        };
        let updated = Ticket {
            status: TicketStatus::Cancelled,
            cancelled_at: Some(Utc::now()),
            paused_at: None,
            notes,
            ..ticket
        };
        let saved = self.write(updated, &FROM, "cancel").await?;
        self.emit(QueueEvent::Cancelled {
            ticket: saved.clone(),
        });
        Ok(saved)
    }

    /// Puts a called ticket back in the queue. `called_at` is kept; where the
    /// ticket lands is decided by the `held` scheduling setting.
    pub async fn hold_ticket(
        &self,
        ticket_id: Uuid,
        service_point_id: Uuid,
        reason: Option<String>,
    ) -> Result<Ticket, QueueError> {
        let ticket = self.load(ticket_id).await?;
        require(&ticket, &[TicketStatus::Active], "active")?;
        if ticket.service_point_id != Some(service_point_id) {
            return Err(QueueError::validation(
                "ticket is not being served at this service point",
            ));
        }

        let notes = match clean(reason) {
            Some(r) => append_note(ticket.notes.clone(), format!("Hold: {r}")),
            None => ticket.notes.clone(),
        };
        let updated = Ticket {
            status: TicketStatus::Waiting,
            paused_at: Some(Utc::now()),
            notes,
            ..ticket
        };
        let saved = self.write(updated, &[TicketStatus::Active], "hold").await?;
        self.emit(QueueEvent::Held {
            ticket: saved.clone(),
        });
        Ok(saved)
    }

    pub async fn return_skipped_to_waiting(&self, ticket_id: Uuid) -> Result<Ticket, QueueError> {
        let ticket = self.load(ticket_id).await?;
        require(&ticket, &[TicketStatus::Skipped], "skipped")?;

        let updated = Ticket {
            status: TicketStatus::Waiting,
            skipped_at: None,
            paused_at: None,
            ..ticket
        };
        let saved = self
            .write(updated, &[TicketStatus::Skipped], "return")
            .await?;
        self.emit(QueueEvent::Returned {
            ticket: saved.clone(),
        });
        Ok(saved)
    }

    /// Closes the ticket at the source point and opens a WAITING continuation
    /// with the same number at the target, in one repository transaction.
    /// Returns the continuation.
    pub async fn transfer_ticket(
        &self,
        ticket_id: Uuid,
        req: TransferRequest,
    ) -> Result<Ticket, QueueError> {
        const FROM: [TicketStatus; 2] = [TicketStatus::Waiting, TicketStatus::Active];
        let ticket = self.load(ticket_id).await?;
        require(&ticket, &FROM, "waiting or active")?;

        if req.from_service_point_id == req.to_service_point_id {
            return Err(QueueError::validation(
                "source and target service point are the same",
            ));
        }
        if ticket.service_point_id != Some(req.from_service_point_id) {
            return Err(QueueError::validation(
                "ticket is not assigned to the source service point",
            ));
        }
        let snapshot = self.enabled_point(req.to_service_point_id).await?;
        let target_code = snapshot
            .get(req.to_service_point_id)
            .map(|sp| sp.code.clone())
            .unwrap_or_default();

        let now = Utc::now();
        let closed = Ticket {
            status: TicketStatus::Completed,
            completed_at: Some(now),
            transferred_at: Some(now),
            paused_at: None,
            notes: append_note(ticket.notes.clone(), format!("Transferred to {target_code}")),
            ..ticket.clone()
        };
        let continuation = NewTicket {
            ticket_type: req.new_type.unwrap_or(ticket.ticket_type),
            queue_date: ticket.queue_date,
            service_point_id: Some(req.to_service_point_id),
            patient_name: ticket.patient_name.clone(),
            phone_number: ticket.phone_number.clone(),
            line_user_id: ticket.line_user_id.clone(),
            notes: clean(req.notes),
            transferred_from: Some(ticket.ticket_id),
            number: Some(ticket.number),
        };

        let (source, target) = match self
            .tickets
            .transfer_ticket(&closed, &FROM, continuation)
            .await
        {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                tracing::warn!(%ticket_id, "transfer lost a race");
                return Err(QueueError::lost_race());
            }
            Err(e) => {
                tracing::error!(%ticket_id, error = %e, "transfer failed, nothing was written");
                return Err(e);
            }
        };

        self.store.replace(source.clone()).await;
        self.store.replace(target.clone()).await;
        tracing::info!(
            from = %source.ticket_id,
            to = %target.ticket_id,
            number = %target.display_number(),
            target = %target_code,
            "ticket transferred"
        );
        self.emit(QueueEvent::Transferred {
            from: source,
            to: target.clone(),
        });
        Ok(target)
    }

    /* ---------------- side effects ---------------- */

    /// Sends reminders to the next few tickets waiting for this point.
    async fn remind_upcoming(
        &self,
        service_point_id: Uuid,
        snapshot: &RegistrySnapshot,
        point_name: &str,
    ) {
        if self.options.notify_ahead == 0 {
            return;
        }
        let scheduling = self.scheduling().await;
        let waiting = self.store.waiting().await;
        let candidates = policy::candidates_for_service_point(&waiting, snapshot, service_point_id);
        let upcoming = policy::order(&candidates, &scheduling, Utc::now());

        for (ahead, ticket) in upcoming.into_iter().take(self.options.notify_ahead).enumerate() {
            let Some(to) = Recipient::for_ticket(ticket) else {
                continue;
            };
            let text = notify::reminder_text(ticket, ahead, point_name);
            notify::dispatch(self.notifier.clone(), to, text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::MemoryRepository;
    use crate::queue::notify::tests::RecordingNotifier;
    use crate::queue::policy::{AgingConfig, HeldPlacement, Policy};
    use crate::queue::repository::ServicePointRepository;
    use std::time::Duration;

    struct Fixture {
        repo: Arc<MemoryRepository>,
        notifier: Arc<RecordingNotifier>,
        queue: QueueCoordinator,
        sp_a: Uuid,
        sp_b: Uuid,
    }

    async fn fixture_with(notifier: RecordingNotifier) -> Fixture {
        let repo = Arc::new(MemoryRepository::new());
        let sp_a = repo.add_service_point("1", true).await;
        let sp_b = repo.add_service_point("2", true).await;
        let registry = Arc::new(ServicePointRegistry::new(
            repo.clone(),
            Duration::from_secs(30),
        ));
        let notifier = Arc::new(notifier);
        let queue = QueueCoordinator::new(
            repo.clone(),
            repo.clone(),
            registry,
            notifier.clone(),
            CoordinatorOptions::default(),
        );
        Fixture {
            repo,
            notifier,
            queue,
            sp_a,
            sp_b,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(RecordingNotifier::default()).await
    }

    async fn issue(f: &Fixture, ticket_type: TicketType, sp: Option<Uuid>) -> Ticket {
        f.queue
            .issue_ticket(IssueTicket {
                ticket_type: Some(ticket_type),
                service_point_id: sp,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn numbers_are_sequential_per_type() {
        let f = fixture().await;
        let g1 = issue(&f, TicketType::General, None).await;
        let g2 = issue(&f, TicketType::General, None).await;
        let u1 = issue(&f, TicketType::Urgent, None).await;
        assert_eq!((g1.number, g2.number, u1.number), (1, 2, 1));
        assert_eq!(g2.display_number(), "A002");
        assert!(g1.service_point_id.is_some());
        assert_eq!(f.queue.store().len().await, 3);
    }

    #[tokio::test]
    async fn issue_uses_capable_service_point() {
        let f = fixture().await;
        f.repo
            .set_capabilities(f.sp_b, &[TicketType::Urgent])
            .await
            .unwrap();
        f.queue.registry().invalidate().await;
        for _ in 0..10 {
            let t = issue(&f, TicketType::Urgent, None).await;
            assert_eq!(t.service_point_id, Some(f.sp_b));
        }
    }

    #[tokio::test]
    async fn issue_rejects_disabled_point() {
        let f = fixture().await;
        let off = f.repo.add_service_point("9", false).await;
        f.queue.registry().invalidate().await;
        let err = f
            .queue
            .issue_ticket(IssueTicket {
                service_point_id: Some(off),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
        assert_eq!(f.repo.ticket_count().await, 0);
    }

    #[tokio::test]
    async fn call_then_call_again_is_rejected() {
        let f = fixture().await;
        let t = issue(&f, TicketType::General, None).await;

        let called = f.queue.call_ticket(t.ticket_id, Some(f.sp_a)).await.unwrap();
        assert_eq!(called.status, TicketStatus::Active);
        assert!(called.called_at.is_some());
        assert_eq!(called.service_point_id, Some(f.sp_a));

        let err = f
            .queue
            .call_ticket(t.ticket_id, Some(f.sp_a))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("ticket not waiting"));
        // The stored row is untouched by the rejected call.
        assert_eq!(f.repo.stored(t.ticket_id).await.unwrap(), called);
    }

    #[tokio::test]
    async fn complete_requires_active() {
        let f = fixture().await;
        let t = issue(&f, TicketType::General, Some(f.sp_a)).await;

        let err = f.queue.complete_ticket(t.ticket_id).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                expected: "active",
                actual: TicketStatus::Waiting
            }
        ));

        f.queue.call_ticket(t.ticket_id, None).await.unwrap();
        let done = f.queue.complete_ticket(t.ticket_id).await.unwrap();
        assert_eq!(done.status, TicketStatus::Completed);
        assert!(done.called_at.unwrap() <= done.completed_at.unwrap());
    }

    #[tokio::test]
    async fn call_without_any_service_point_is_a_validation_error() {
        let f = fixture().await;
        let mut t = crate::queue::policy::tests::ticket(1, TicketType::General, 0);
        t.queue_date = f.queue.today();
        f.repo.seed_ticket(t.clone()).await;
        let err = f.queue.call_ticket(t.ticket_id, None).await.unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_ticket_is_not_found() {
        let f = fixture().await;
        let err = f.queue.skip_ticket(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound { .. }));
    }

    #[tokio::test]
    async fn skip_and_return_to_waiting() {
        let f = fixture().await;
        let t = issue(&f, TicketType::General, Some(f.sp_a)).await;

        let skipped = f.queue.skip_ticket(t.ticket_id).await.unwrap();
        assert_eq!(skipped.status, TicketStatus::Skipped);
        assert!(skipped.skipped_at.is_some());

        let back = f.queue.return_skipped_to_waiting(t.ticket_id).await.unwrap();
        assert_eq!(back.status, TicketStatus::Waiting);
        assert_eq!(back.skipped_at, None);

        let err = f
            .queue
            .return_skipped_to_waiting(t.ticket_id)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn hold_keeps_called_at_and_marks_pause() {
        let f = fixture().await;
        let t = issue(&f, TicketType::General, Some(f.sp_a)).await;
        let called = f.queue.call_ticket(t.ticket_id, None).await.unwrap();

        let err = f
            .queue
            .hold_ticket(t.ticket_id, f.sp_b, None)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));

        let held = f
            .queue
            .hold_ticket(t.ticket_id, f.sp_a, Some("fetching documents".into()))
            .await
            .unwrap();
        assert_eq!(held.status, TicketStatus::Waiting);
        assert!(held.is_on_hold());
        assert_eq!(held.called_at, called.called_at);
        assert!(held.notes.unwrap().contains("fetching documents"));

        let p = f.queue.store().partitions().await;
        assert_eq!(p.on_hold.len(), 1);

        // Called again: no longer on hold, first call time kept.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let again = f.queue.call_ticket(t.ticket_id, None).await.unwrap();
        assert!(!again.is_on_hold());
        assert_eq!(again.called_at, called.called_at);
    }

    #[tokio::test]
    async fn fresh_call_after_skip_and_return_gets_new_call_time() {
        let f = fixture().await;
        let t = issue(&f, TicketType::General, Some(f.sp_a)).await;
        let first = f.queue.call_ticket(t.ticket_id, None).await.unwrap();
        f.queue.skip_ticket(t.ticket_id).await.unwrap();
        f.queue.return_skipped_to_waiting(t.ticket_id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = f.queue.call_ticket(t.ticket_id, None).await.unwrap();
        assert!(second.called_at > first.called_at);
    }

    #[tokio::test]
    async fn held_then_skipped_ticket_returns_as_plain_waiting() {
        let f = fixture().await;
        let t = issue(&f, TicketType::General, Some(f.sp_a)).await;
        f.queue.call_ticket(t.ticket_id, None).await.unwrap();
        f.queue.hold_ticket(t.ticket_id, f.sp_a, None).await.unwrap();

        let skipped = f.queue.skip_ticket(t.ticket_id).await.unwrap();
        assert_eq!(skipped.paused_at, None);

        let back = f.queue.return_skipped_to_waiting(t.ticket_id).await.unwrap();
        assert_eq!(back.status, TicketStatus::Waiting);
        assert!(!back.is_on_hold());

        let p = f.queue.store().partitions().await;
        assert!(p.on_hold.is_empty());
        assert_eq!(p.waiting.len(), 1);
    }

    #[tokio::test]
    async fn cancelling_held_ticket_clears_pause() {
        let f = fixture().await;
        let t = issue(&f, TicketType::General, Some(f.sp_a)).await;
        f.queue.call_ticket(t.ticket_id, None).await.unwrap();
        f.queue.hold_ticket(t.ticket_id, f.sp_a, None).await.unwrap();

        let cancelled = f
            .queue
            .cancel_ticket(t.ticket_id, Some("left".into()))
            .await
            .unwrap();
        assert_eq!(cancelled.status, TicketStatus::Cancelled);
        assert_eq!(cancelled.paused_at, None);
    }

    #[tokio::test]
    async fn concurrent_call_loses_with_conflict() {
        let f = fixture().await;
        let t = issue(&f, TicketType::General, Some(f.sp_a)).await;

        // Another counter calls the ticket between our read and our write.
        f.repo.interfere_once(t.ticket_id, TicketStatus::Active).await;
        let err = f.queue.call_ticket(t.ticket_id, None).await.unwrap_err();
        assert!(matches!(err, QueueError::Conflict(_)));

        let cached = f.queue.store().get(t.ticket_id).await.unwrap();
        assert_eq!(cached.status, TicketStatus::Waiting);
        assert_eq!(cached.called_at, None);
        let stored = f.repo.stored(t.ticket_id).await.unwrap();
        assert_eq!(stored.status, TicketStatus::Active);
        assert_eq!(stored.called_at, None);
    }

    #[tokio::test]
    async fn concurrent_transfer_loses_with_conflict() {
        let f = fixture().await;
        let t = issue(&f, TicketType::General, Some(f.sp_a)).await;

        f.repo
            .interfere_once(t.ticket_id, TicketStatus::Cancelled)
            .await;
        let err = f
            .queue
            .transfer_ticket(
                t.ticket_id,
                TransferRequest {
                    from_service_point_id: f.sp_a,
                    to_service_point_id: f.sp_b,
                    notes: None,
                    new_type: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Conflict(_)));
        assert_eq!(f.repo.ticket_count().await, 1);
        assert_eq!(
            f.queue.store().get(t.ticket_id).await.unwrap().status,
            TicketStatus::Waiting
        );
        let stored = f.repo.stored(t.ticket_id).await.unwrap();
        assert_eq!(stored.status, TicketStatus::Cancelled);
        assert_eq!(stored.completed_at, None);
    }

    #[tokio::test]
    async fn transfer_of_uncalled_ticket_leaves_call_time_empty() {
        let f = fixture().await;
        let t = issue(&f, TicketType::Elderly, Some(f.sp_a)).await;
        f.queue
            .transfer_ticket(
                t.ticket_id,
                TransferRequest {
                    from_service_point_id: f.sp_a,
                    to_service_point_id: f.sp_b,
                    notes: None,
                    new_type: None,
                },
            )
            .await
            .unwrap();

        let source = f.repo.stored(t.ticket_id).await.unwrap();
        assert_eq!(source.status, TicketStatus::Completed);
        assert_eq!(source.called_at, None);
        assert_eq!(f.queue.stats().await.unwrap().average_wait_seconds, None);
    }

    #[tokio::test]
    async fn transfer_moves_number_to_target() {
        let f = fixture().await;
        let t = issue(&f, TicketType::General, Some(f.sp_a)).await;
        f.queue.call_ticket(t.ticket_id, None).await.unwrap();

        let moved = f
            .queue
            .transfer_ticket(
                t.ticket_id,
                TransferRequest {
                    from_service_point_id: f.sp_a,
                    to_service_point_id: f.sp_b,
                    notes: Some("needs pharmacist".into()),
                    new_type: Some(TicketType::Elderly),
                },
            )
            .await
            .unwrap();

        assert_eq!(moved.status, TicketStatus::Waiting);
        assert_eq!(moved.number, t.number);
        assert_eq!(moved.ticket_type, TicketType::Elderly);
        assert_eq!(moved.service_point_id, Some(f.sp_b));
        assert_eq!(moved.transferred_from, Some(t.ticket_id));

        let source = f.repo.stored(t.ticket_id).await.unwrap();
        assert_eq!(source.status, TicketStatus::Completed);
        assert!(source.transferred_at.is_some());

        // The next issued general ticket is unaffected by the continuation.
        let g2 = issue(&f, TicketType::General, None).await;
        assert_eq!(g2.number, 2);
    }

    #[tokio::test]
    async fn failed_transfer_leaves_ticket_in_place() {
        let f = fixture().await;
        let t = issue(&f, TicketType::General, Some(f.sp_a)).await;
        let called = f.queue.call_ticket(t.ticket_id, None).await.unwrap();

        f.repo.fail_transfer_insert(true);
        let err = f
            .queue
            .transfer_ticket(
                t.ticket_id,
                TransferRequest {
                    from_service_point_id: f.sp_a,
                    to_service_point_id: f.sp_b,
                    notes: None,
                    new_type: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Repository(_)));
        assert_eq!(f.repo.stored(t.ticket_id).await.unwrap(), called);
        assert_eq!(f.repo.ticket_count().await, 1);
        assert_eq!(
            f.queue.store().get(t.ticket_id).await.unwrap().status,
            TicketStatus::Active
        );
    }

    #[tokio::test]
    async fn transfer_validates_source_and_target() {
        let f = fixture().await;
        let t = issue(&f, TicketType::General, Some(f.sp_a)).await;
        let same = TransferRequest {
            from_service_point_id: f.sp_a,
            to_service_point_id: f.sp_a,
            notes: None,
            new_type: None,
        };
        assert!(matches!(
            f.queue.transfer_ticket(t.ticket_id, same).await,
            Err(QueueError::Validation(_))
        ));
        let wrong_source = TransferRequest {
            from_service_point_id: f.sp_b,
            to_service_point_id: f.sp_a,
            notes: None,
            new_type: None,
        };
        assert!(matches!(
            f.queue.transfer_ticket(t.ticket_id, wrong_source).await,
            Err(QueueError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn write_failure_leaves_cache_unchanged() {
        let f = fixture().await;
        let t = issue(&f, TicketType::General, Some(f.sp_a)).await;
        f.repo.fail_writes(true);
        let err = f.queue.call_ticket(t.ticket_id, None).await.unwrap_err();
        assert!(matches!(err, QueueError::Repository(_)));
        assert_eq!(
            f.queue.store().get(t.ticket_id).await.unwrap().status,
            TicketStatus::Waiting
        );
    }

    #[tokio::test]
    async fn call_next_follows_stored_policy() {
        let f = fixture().await;
        let general = issue(&f, TicketType::General, Some(f.sp_a)).await;
        let urgent = issue(&f, TicketType::Urgent, Some(f.sp_a)).await;

        let picked = f.queue.call_next(f.sp_a).await.unwrap().unwrap();
        assert_eq!(picked.ticket_id, general.ticket_id);
        f.queue.complete_ticket(picked.ticket_id).await.unwrap();

        // Under PRIORITY the urgent ticket beats a later general one.
        f.queue
            .set_scheduling(SchedulingConfig {
                policy: Policy::Priority,
                ..SchedulingConfig::default()
            })
            .await
            .unwrap();
        let late_general = issue(&f, TicketType::General, Some(f.sp_a)).await;
        let picked = f.queue.call_next(f.sp_a).await.unwrap().unwrap();
        assert_eq!(picked.ticket_id, urgent.ticket_id);
        assert_ne!(picked.ticket_id, late_general.ticket_id);
    }

    #[tokio::test]
    async fn call_next_on_empty_queue_is_none() {
        let f = fixture().await;
        assert!(f.queue.call_next(f.sp_a).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_scheduling_settings_are_rejected() {
        let f = fixture().await;
        let err = f
            .queue
            .set_scheduling(SchedulingConfig {
                policy: Policy::MultilevelFeedback {
                    aging: AgingConfig {
                        step_minutes: vec![],
                    },
                },
                ranking: Default::default(),
                held: HeldPlacement::Requeue,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
        assert_eq!(f.queue.scheduling().await, SchedulingConfig::default());
    }

    #[tokio::test]
    async fn garbage_settings_fall_back_to_default() {
        let f = fixture().await;
        f.repo
            .put_setting(
                SETTINGS_CATEGORY,
                SCHEDULING_KEY,
                serde_json::json!({"policy": "round-robin"}),
            )
            .await
            .unwrap();
        assert_eq!(f.queue.scheduling().await, SchedulingConfig::default());
    }

    #[tokio::test]
    async fn stored_settings_failing_validation_fall_back_to_default() {
        let f = fixture().await;
        f.repo
            .put_setting(
                SETTINGS_CATEGORY,
                SCHEDULING_KEY,
                serde_json::json!({
                    "policy": {"kind": "multilevel_feedback", "aging": {"step_minutes": [-5]}}
                }),
            )
            .await
            .unwrap();
        assert_eq!(f.queue.scheduling().await, SchedulingConfig::default());
    }

    #[tokio::test]
    async fn board_reloads_when_queue_day_changes() {
        let f = fixture().await;
        let today = issue(&f, TicketType::General, Some(f.sp_a)).await;

        // Cache still holding yesterday's leftovers.
        let yesterday = f.queue.today().pred_opt().unwrap();
        let mut stale = crate::queue::policy::tests::ticket(9, TicketType::General, 0);
        stale.queue_date = yesterday;
        stale.service_point_id = Some(f.sp_a);
        f.queue.store().rebuild(yesterday, vec![stale.clone()]).await;

        let board = f.queue.board(None).await.unwrap();
        let ids: Vec<Uuid> = board.up_next.iter().map(|t| t.ticket_id).collect();
        assert_eq!(ids, vec![today.ticket_id]);
        assert_eq!(f.queue.store().day().await, Some(f.queue.today()));
        assert!(f.queue.store().get(stale.ticket_id).await.is_none());
        assert_eq!(f.queue.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn call_sends_reminders_to_next_waiting() {
        let f = fixture().await;
        let first = issue(&f, TicketType::General, Some(f.sp_a)).await;
        for phone in ["+660001", "+660002"] {
            f.queue
                .issue_ticket(IssueTicket {
                    ticket_type: Some(TicketType::General),
                    service_point_id: Some(f.sp_a),
                    phone_number: Some(phone.into()),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        f.queue.call_ticket(first.ticket_id, None).await.unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let sent = f.notifier.sent.lock().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, Recipient::Sms("+660001".into()));
        assert!(sent[0].1.contains("you are next"));
        assert!(sent[1].1.contains("1 ahead"));
    }

    #[tokio::test]
    async fn reminder_failure_does_not_fail_call() {
        let f = fixture_with(RecordingNotifier {
            fail: true,
            ..Default::default()
        })
        .await;
        let first = issue(&f, TicketType::General, Some(f.sp_a)).await;
        f.queue
            .issue_ticket(IssueTicket {
                service_point_id: Some(f.sp_a),
                phone_number: Some("+660009".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let called = f.queue.call_ticket(first.ticket_id, None).await.unwrap();
        assert_eq!(called.status, TicketStatus::Active);
    }

    #[tokio::test]
    async fn call_emits_announcement() {
        let f = fixture().await;
        let mut events = f.queue.subscribe();
        let t = issue(&f, TicketType::Urgent, Some(f.sp_b)).await;
        f.queue.call_ticket(t.ticket_id, None).await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), QueueEvent::Issued { .. }));
        match events.recv().await.unwrap() {
            QueueEvent::Called {
                ticket,
                service_point,
            } => {
                assert_eq!(ticket.ticket_id, t.ticket_id);
                assert_eq!(service_point, "Counter 2");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn refresh_rebuilds_from_repository() {
        let f = fixture().await;
        let mut outside = crate::queue::policy::tests::ticket(5, TicketType::Elderly, 0);
        outside.queue_date = f.queue.today();
        f.repo.seed_ticket(outside.clone()).await;

        assert!(f.queue.store().get(outside.ticket_id).await.is_none());
        assert_eq!(f.queue.refresh().await.unwrap(), 1);
        assert!(f.queue.store().get(outside.ticket_id).await.is_some());
    }

    #[tokio::test]
    async fn board_orders_candidates_for_point() {
        let f = fixture().await;
        f.queue
            .set_scheduling(SchedulingConfig {
                policy: Policy::Multilevel,
                ..SchedulingConfig::default()
            })
            .await
            .unwrap();
        let g = issue(&f, TicketType::General, Some(f.sp_a)).await;
        let e = issue(&f, TicketType::Elderly, Some(f.sp_a)).await;
        issue(&f, TicketType::Urgent, Some(f.sp_b)).await;

        let board = f.queue.board(Some(f.sp_a)).await.unwrap();
        assert_eq!(board.policy, "MULTILEVEL");
        let ids: Vec<Uuid> = board.up_next.iter().map(|t| t.ticket_id).collect();
        assert_eq!(ids, vec![e.ticket_id, g.ticket_id]);
        assert_eq!(board.levels.len(), 2);
        assert_eq!(board.partitions.waiting.len(), 3);
    }
}
