//! Coalesces bursts of triggers into one action run.
//!
//! The debouncer knows nothing about where triggers come from; the Postgres
//! change listener is one producer, tests are another.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};

#[derive(Debug, Clone)]
pub struct DebounceHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl DebounceHandle {
    /// Returns false once the debouncer task is gone.
    pub fn trigger(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

pub struct Debouncer;

impl Debouncer {
    /// Runs `action` after `quiet` has passed with no new trigger, or after
    /// `max_delay` since the first trigger of a burst, whichever is first.
    /// The task ends when every handle is dropped.
    pub fn spawn<F, Fut>(
        quiet: Duration,
        max_delay: Duration,
        action: F,
    ) -> (DebounceHandle, JoinHandle<()>)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                let burst_deadline = Instant::now() + max_delay;
                let mut closed = false;

                loop {
                    let deadline = (Instant::now() + quiet).min(burst_deadline);
                    match timeout_at(deadline, rx.recv()).await {
                        Ok(Some(())) if Instant::now() < burst_deadline => continue,
                        Ok(Some(())) => break,
                        Ok(None) => {
                            closed = true;
                            break;
                        }
                        Err(_) => break,
                    }
                }

                action().await;
                if closed {
                    break;
                }
            }
        });

        (DebounceHandle { tx }, task)
    }
}
