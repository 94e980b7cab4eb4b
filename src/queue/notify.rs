//! Side channels: patient reminders (SMS / LINE) and the in-process queue
//! event feed used for announcements. Nothing here may fail a queue action.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::models::Ticket;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Sms(String),
    Line(String),
}

impl Recipient {
    /// LINE is preferred when the patient linked an account.
    pub fn for_ticket(ticket: &Ticket) -> Option<Self> {
        if let Some(id) = ticket.line_user_id.as_deref().filter(|s| !s.trim().is_empty()) {
            return Some(Recipient::Line(id.to_string()));
        }
        ticket
            .phone_number
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|p| Recipient::Sms(p.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("provider rejected message: {0}")]
    Rejected(String),
    #[error("provider unreachable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_text(&self, to: &Recipient, text: &str) -> Result<(), NotifyError>;
}

/// Writes messages to the log instead of a provider.
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn send_text(&self, to: &Recipient, text: &str) -> Result<(), NotifyError> {
        tracing::info!(recipient = ?to, %text, "notification");
        Ok(())
    }
}

/// Sends in the background; failures are logged and dropped.
pub fn dispatch(notifier: Arc<dyn Notifier>, to: Recipient, text: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = notifier.send_text(&to, &text).await {
            tracing::warn!(recipient = ?to, error = %e, "notification failed");
        }
    })
}

pub fn reminder_text(ticket: &Ticket, ahead: usize, service_point: &str) -> String {
    if ahead == 0 {
        format!(
            "Queue {}: you are next at {service_point}. Please be ready.",
            ticket.display_number()
        )
    } else {
        format!(
            "Queue {}: {ahead} ahead of you at {service_point}. Please be ready.",
            ticket.display_number()
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Issued { ticket: Ticket },
    Called { ticket: Ticket, service_point: String },
    Completed { ticket: Ticket },
    Skipped { ticket: Ticket },
    Held { ticket: Ticket },
    Returned { ticket: Ticket },
    Cancelled { ticket: Ticket },
    Transferred { from: Ticket, to: Ticket },
    Refreshed { tickets: usize },
}

/// Logs call announcements for the display/TTS collaborator.
pub fn spawn_announcer(mut events: broadcast::Receiver<QueueEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(QueueEvent::Called {
                    ticket,
                    service_point,
                }) => {
                    tracing::info!(
                        number = %ticket.display_number(),
                        %service_point,
                        "announce: now calling {} at {}",
                        ticket.display_number(),
                        service_point
                    );
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "announcer lagged behind queue events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::TicketType;
    use crate::queue::policy::tests::ticket;
    use tokio::sync::Mutex;

    /// Records messages; optionally fails every send.
    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub sent: Mutex<Vec<(Recipient, String)>>,
        pub fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_text(&self, to: &Recipient, text: &str) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::Unavailable("sms gateway down".into()));
            }
            self.sent.lock().await.push((to.clone(), text.to_string()));
            Ok(())
        }
    }

    #[test]
    fn recipient_prefers_line_then_sms() {
        let mut t = ticket(1, TicketType::General, 0);
        assert_eq!(Recipient::for_ticket(&t), None);
        t.phone_number = Some("+66812345678".into());
        assert_eq!(
            Recipient::for_ticket(&t),
            Some(Recipient::Sms("+66812345678".into()))
        );
        t.line_user_id = Some("U123".into());
        assert_eq!(Recipient::for_ticket(&t), Some(Recipient::Line("U123".into())));
    }

    #[test]
    fn reminder_mentions_position() {
        let t = ticket(7, TicketType::Elderly, 0);
        assert_eq!(
            reminder_text(&t, 2, "Counter 1"),
            "Queue E007: 2 ahead of you at Counter 1. Please be ready."
        );
        assert!(reminder_text(&t, 0, "Counter 1").contains("you are next"));
    }

    #[tokio::test]
    async fn dispatch_swallows_failures() {
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let handle = dispatch(notifier.clone(), Recipient::Sms("1".into()), "hi".into());
        assert!(handle.await.is_ok());
        assert!(notifier.sent.lock().await.is_empty());
    }
}
