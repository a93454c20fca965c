use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::cleanup::Cleaner;
use crate::client::Client;
use crate::config::{QuayConfig, ShutdownTimeout};
use crate::cron::CronManager;
use crate::errors::ErrorSink;
use crate::job::ProcessId;
use crate::notifier::{Notifier, WakeRecipient};
use crate::poller::Poller;
use crate::process::ProcessTracker;
use crate::scheduler::{MultiScheduler, SchedulerStats};
use crate::settings::Settings;
use crate::store::Store;

use super::registry::{ProcessRegistry, RegisteredRuntime, RuntimeSummary};

/// Token for signaling graceful shutdown to workers.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a runtime runs, assembled by the builder.
pub(super) struct RuntimeParts<St, C> {
    pub config: QuayConfig,
    pub process_id: ProcessId,
    pub client: Client<St>,
    pub schedulers: Arc<MultiScheduler<St, C>>,
    pub notifier: Option<Arc<Notifier>>,
    pub cron: Option<Arc<CronManager<St>>>,
    pub tracker: Arc<ProcessTracker<St>>,
    pub cleaner: Arc<Cleaner<St>>,
    pub settings: Settings<St>,
    pub shutdown: ShutdownToken,
    pub errors: ErrorSink,
    pub registry: Arc<ProcessRegistry>,
}

struct RuntimeInner<St, C> {
    parts: RuntimeParts<St, C>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

/// One worker process: schedulers, wake-up sources, cron, heartbeat and
/// cleanup, started and stopped together.
pub struct Runtime<St, C> {
    inner: Arc<RuntimeInner<St, C>>,
}

impl<St, C> Clone for Runtime<St, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<St, C> fmt::Debug for Runtime<St, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = &self.inner.parts;
        f.debug_struct("Runtime")
            .field("process_id", &parts.process_id)
            .field("store_type", &type_name::<St>())
            .field("context_type", &type_name::<C>())
            .field("started", &self.inner.started.load(Ordering::SeqCst))
            .field("shutdown_cancelled", &parts.shutdown.is_cancelled())
            .finish()
    }
}

impl<St: Store, C: Clone + Send + Sync + 'static> Runtime<St, C> {
    pub(super) fn new(parts: RuntimeParts<St, C>) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                parts,
                handles: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.inner.parts.process_id
    }

    /// Enqueue client sharing this runtime's store and wake channel.
    pub fn client(&self) -> &Client<St> {
        &self.inner.parts.client
    }

    pub fn settings(&self) -> &Settings<St> {
        &self.inner.parts.settings
    }

    pub fn config(&self) -> &QuayConfig {
        &self.inner.parts.config
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.inner.parts.shutdown.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.parts.shutdown.is_cancelled()
    }

    pub fn scheduler_stats(&self) -> Vec<SchedulerStats> {
        self.inner.parts.schedulers.stats()
    }

    /// Nudge every scheduler once, as the poller would.
    pub fn wake(&self) -> bool {
        self.inner.parts.schedulers.wake(None)
    }

    /// Register the process and start every component.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            anyhow::bail!("runtime {} already started", self.process_id());
        }
        let parts = &self.inner.parts;

        #[cfg(feature = "metrics")]
        crate::metrics::init_metrics()?;

        parts.tracker.register().await?;

        for scheduler in parts.schedulers.schedulers() {
            if let Err(err) = scheduler.warm_cache().await {
                parts.errors.report(&err, "scheduler");
            }
        }
        parts.schedulers.start();

        let recipients: Vec<Arc<dyn WakeRecipient>> =
            vec![Arc::clone(&parts.schedulers) as Arc<dyn WakeRecipient>];
        let mut handles = Vec::new();

        if let Some(notifier) = &parts.notifier {
            handles.push(tokio::spawn(Arc::clone(notifier).run()));
        }

        let poller = Poller::new(recipients, parts.config.poll_interval());
        handles.push(tokio::spawn(poller.run(parts.shutdown.clone())));

        if let Some(cron) = &parts.cron {
            handles.push(tokio::spawn(Arc::clone(cron).run(parts.shutdown.clone())));
        }

        handles.push(tokio::spawn(
            Arc::clone(&parts.tracker).run(parts.shutdown.clone(), parts.errors.clone()),
        ));
        handles.push(tokio::spawn(
            Arc::clone(&parts.cleaner).run(parts.shutdown.clone(), parts.errors.clone()),
        ));

        self.inner.handles.lock().extend(handles);
        parts
            .registry
            .register(Arc::new(self.clone()) as Arc<dyn RegisteredRuntime>);

        tracing::info!(
            process_id = %parts.process_id,
            schedulers = parts.schedulers.schedulers().len(),
            cron = parts.cron.is_some(),
            "runtime started"
        );
        Ok(())
    }

    /// Stop wake-up sources, then the schedulers, then the heartbeat.
    pub async fn shutdown(&self, timeout: ShutdownTimeout) -> anyhow::Result<()> {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let parts = &self.inner.parts;
        parts.shutdown.cancel();

        let handles = std::mem::take(&mut *self.inner.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("runtime task failed: {e}");
            }
        }

        parts.schedulers.shutdown(timeout).await;

        let deregistered = if self.inner.started.load(Ordering::SeqCst) {
            parts.tracker.deregister().await
        } else {
            Ok(())
        };
        parts.registry.deregister(parts.process_id);

        tracing::info!(process_id = %parts.process_id, "runtime shutdown complete");
        deregistered
    }
}

#[async_trait]
impl<St: Store, C: Clone + Send + Sync + 'static> RegisteredRuntime for Runtime<St, C> {
    fn process_id(&self) -> ProcessId {
        self.inner.parts.process_id
    }

    fn summary(&self) -> RuntimeSummary {
        let parts = &self.inner.parts;
        RuntimeSummary {
            process_id: parts.process_id,
            schedulers: parts.schedulers.stats(),
            notifier_listening: parts
                .notifier
                .as_ref()
                .is_some_and(|notifier| notifier.is_listening()),
            poller_enabled: !parts.config.poll_interval().is_zero(),
            cron_entries: parts.cron.as_ref().map_or(0, |cron| cron.entries().count()),
        }
    }

    async fn shutdown(&self, timeout: ShutdownTimeout) -> anyhow::Result<()> {
        Runtime::shutdown(self, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_shutdown_token_shared_state() {
        let token = ShutdownToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        assert!(clone.is_cancelled());
        // Already cancelled: returns at once
        timeout(Duration::from_millis(100), clone.cancelled())
            .await
            .expect("cancelled() should not wait after cancel");
    }

    #[tokio::test]
    async fn test_shutdown_token_wakes_waiters() {
        let token = ShutdownToken::new();
        let waiter = tokio::spawn({
            let token = token.clone();
            async move { token.cancelled().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter was not woken")
            .unwrap();
    }
}
