use std::sync::Arc;
use std::time::Duration;

use crate::notifier::{WakeRecipient, fan_out};
use crate::runtime::ShutdownToken;

/// Fixed-interval nudge for every recipient.
///
/// Catches missed notifications, scheduled jobs coming due and deployments
/// without a notification channel.
pub struct Poller {
    recipients: Vec<Arc<dyn WakeRecipient>>,
    interval: Duration,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("recipients", &self.recipients.len())
            .field("interval", &self.interval)
            .finish()
    }
}

impl Poller {
    pub fn new(recipients: Vec<Arc<dyn WakeRecipient>>, interval: Duration) -> Self {
        Self {
            recipients,
            interval,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero() && !self.recipients.is_empty()
    }

    /// Poll until shutdown. Returns at once when disabled.
    pub async fn run(self, shutdown: ShutdownToken) {
        if !self.is_enabled() {
            tracing::debug!("poller disabled");
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; schedulers fill themselves at start.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    fan_out(&self.recipients, None);
                }
            }
        }
    }
}
