//! Push wake-ups between processes.
//!
//! Every successful enqueue publishes a [`WakeHint`]. Each process runs one
//! [`Notifier`] subscriber loop that forwards received hints to its
//! schedulers. When the channel cannot deliver notifications the notifier
//! stops and the poller is left as the only wake-up source.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::errors::ErrorSink;
use crate::runtime::ShutdownToken;

/// Name of the publish/subscribe channel.
pub const WAKE_CHANNEL: &str = "quay";

const RECONNECT_MIN: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// "Work may be available" event.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct WakeHint {
    /// Queue that received work. `None` wakes every scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    /// Number of jobs enqueued together.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    /// Earliest time the new work may run, when it is in the future.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl WakeHint {
    pub fn queue(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: Some(queue_name.into()),
            ..Self::default()
        }
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_scheduled_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.scheduled_at = at;
        self
    }

    /// Whether the hinted work is not due yet at `now`.
    pub fn is_future(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_some_and(|at| at > now)
    }
}

/// Something woken by hints: a scheduler, or a group of them.
pub trait WakeRecipient: Send + Sync {
    /// Offer a hint, or `None` for an unconditional nudge. Returns whether
    /// the recipient acted on it.
    fn wake(&self, hint: Option<&WakeHint>) -> bool;
}

/// One live subscription.
#[async_trait]
pub trait WakeSubscription: Send {
    /// Wait up to `timeout` for the next hint. `Ok(None)` on timeout.
    async fn recv(&mut self, timeout: Duration) -> anyhow::Result<Option<WakeHint>>;
}

/// Transport for wake hints.
#[async_trait]
pub trait WakeChannel: Send + Sync {
    async fn publish(&self, hint: &WakeHint) -> anyhow::Result<()>;

    /// Subscribe. `Ok(None)` means the transport cannot deliver notifications.
    async fn listen(&self) -> anyhow::Result<Option<Box<dyn WakeSubscription>>>;
}

/// Wake channel for processes sharing one address space.
#[derive(Debug, Clone)]
pub struct InProcWakeChannel {
    sender: broadcast::Sender<WakeHint>,
}

impl InProcWakeChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InProcWakeChannel {
    fn default() -> Self {
        Self::new(1024)
    }
}

struct InProcSubscription {
    receiver: broadcast::Receiver<WakeHint>,
}

#[async_trait]
impl WakeSubscription for InProcSubscription {
    async fn recv(&mut self, timeout: Duration) -> anyhow::Result<Option<WakeHint>> {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(hint)) => Ok(Some(hint)),
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                tracing::warn!("wake subscriber lagged, skipped {skipped} hints");
                Ok(Some(WakeHint::default()))
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                Err(anyhow::anyhow!("wake channel closed"))
            }
        }
    }
}

#[async_trait]
impl WakeChannel for InProcWakeChannel {
    async fn publish(&self, hint: &WakeHint) -> anyhow::Result<()> {
        // No receivers is not an error: nobody is listening yet.
        if self.sender.send(hint.clone()).is_err() {
            tracing::trace!(queue = ?hint.queue_name, "wake hint dropped without listeners");
        }
        Ok(())
    }

    async fn listen(&self) -> anyhow::Result<Option<Box<dyn WakeSubscription>>> {
        Ok(Some(Box::new(InProcSubscription {
            receiver: self.sender.subscribe(),
        })))
    }
}

/// Wake channel that never delivers anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledWakeChannel;

#[async_trait]
impl WakeChannel for DisabledWakeChannel {
    async fn publish(&self, _hint: &WakeHint) -> anyhow::Result<()> {
        Ok(())
    }

    async fn listen(&self) -> anyhow::Result<Option<Box<dyn WakeSubscription>>> {
        Ok(None)
    }
}

/// Offer `hint` to every recipient. Returns whether any accepted it.
pub fn fan_out(recipients: &[Arc<dyn WakeRecipient>], hint: Option<&WakeHint>) -> bool {
    recipients
        .iter()
        .fold(false, |accepted, recipient| recipient.wake(hint) || accepted)
}

/// The per-process subscriber loop.
pub struct Notifier {
    channel: Arc<dyn WakeChannel>,
    recipients: Vec<Arc<dyn WakeRecipient>>,
    wait: Duration,
    shutdown: ShutdownToken,
    errors: ErrorSink,
    listening: AtomicBool,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("recipients", &self.recipients.len())
            .field("wait", &self.wait)
            .field("listening", &self.is_listening())
            .finish()
    }
}

impl Notifier {
    pub fn new(
        channel: Arc<dyn WakeChannel>,
        recipients: Vec<Arc<dyn WakeRecipient>>,
        wait: Duration,
        shutdown: ShutdownToken,
        errors: ErrorSink,
    ) -> Self {
        Self {
            channel,
            recipients,
            wait,
            shutdown,
            errors,
            listening: AtomicBool::new(false),
        }
    }

    /// Whether a subscription is currently open.
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Deliver one hint to every recipient.
    pub fn dispatch(&self, hint: &WakeHint) -> bool {
        crate::telemetry::record_notification(hint.queue_name.as_deref());
        fan_out(&self.recipients, Some(hint))
    }

    /// Run until shutdown, reconnecting with backoff after errors.
    pub async fn run(self: Arc<Self>) {
        let mut backoff = RECONNECT_MIN;

        while !self.shutdown.is_cancelled() {
            match self.channel.listen().await {
                Ok(None) => {
                    tracing::info!("wake notifications unavailable; relying on polling");
                    return;
                }
                Ok(Some(subscription)) => {
                    self.listening.store(true, Ordering::SeqCst);
                    backoff = RECONNECT_MIN;
                    // Wake everyone once: hints may have been missed while disconnected.
                    fan_out(&self.recipients, None);

                    let result = self.drain(subscription).await;
                    self.listening.store(false, Ordering::SeqCst);
                    match result {
                        Ok(()) => return,
                        Err(err) => self.errors.report(&err, "notifier"),
                    }
                }
                Err(err) => self.errors.report(&err, "notifier"),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
    }

    async fn drain(&self, mut subscription: Box<dyn WakeSubscription>) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                received = subscription.recv(self.wait) => {
                    if let Some(hint) = received? {
                        let span = crate::telemetry::notify_span(hint.queue_name.as_deref());
                        async { self.dispatch(&hint) }.instrument(span).await;
                    }
                }
            }
        }
    }
}
