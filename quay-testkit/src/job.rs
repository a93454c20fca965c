use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use quay::*;
use serde::{Deserialize, Serialize};

/// Shared state handed to every fixture job.
#[derive(Clone, Debug, Default)]
pub struct TestContext {
    events: Arc<Mutex<Vec<String>>>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn event_count(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.starts_with(prefix))
            .count()
    }

    /// Highest number of [`SleepJob`]s seen running at once.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn enter(&self) -> RunningGuard<'_> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        RunningGuard { ctx: self }
    }
}

struct RunningGuard<'a> {
    ctx: &'a TestContext,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.ctx.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Succeeds and records `record:<label>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordJob {
    pub label: String,
}

impl RecordJob {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

#[async_trait]
impl Job for RecordJob {
    const NAME: &'static str = "RecordJob";
    type Context = TestContext;

    async fn perform(&self, ctx: &ExecutionContext<TestContext>) -> anyhow::Result<()> {
        ctx.app().record(format!("record:{}", self.label));
        Ok(())
    }
}

/// Always fails without a retry policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailingJob {
    pub message: String,
}

#[async_trait]
impl Job for FailingJob {
    const NAME: &'static str = "FailingJob";
    type Context = TestContext;

    async fn perform(&self, ctx: &ExecutionContext<TestContext>) -> anyhow::Result<()> {
        ctx.app().record("failing");
        anyhow::bail!("{}", self.message)
    }
}

/// Fails its first `failures` attempts, retrying up to three executions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryingJob {
    pub failures: u32,
}

#[async_trait]
impl Job for RetryingJob {
    const NAME: &'static str = "RetryingJob";
    type Context = TestContext;

    fn retry_policy() -> RetryPolicy {
        RetryPolicy::attempts(3).with_backoff(Backoff::Fixed(chrono::Duration::zero()))
    }

    async fn perform(&self, ctx: &ExecutionContext<TestContext>) -> anyhow::Result<()> {
        ctx.app().record(format!("retrying:{}", ctx.attempt()));
        if ctx.attempt() <= self.failures {
            anyhow::bail!("attempt {} failed", ctx.attempt());
        }
        Ok(())
    }
}

/// Asks to be discarded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscardJob;

#[async_trait]
impl Job for DiscardJob {
    const NAME: &'static str = "DiscardJob";
    type Context = TestContext;

    async fn perform(&self, _ctx: &ExecutionContext<TestContext>) -> anyhow::Result<()> {
        Err(discard("bad input"))
    }
}

/// Fails, but rescues its own error.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RescuedJob;

#[async_trait]
impl Job for RescuedJob {
    const NAME: &'static str = "RescuedJob";
    type Context = TestContext;

    fn rescue(&self, _error: &anyhow::Error) -> bool {
        true
    }

    async fn perform(&self, _ctx: &ExecutionContext<TestContext>) -> anyhow::Result<()> {
        anyhow::bail!("handled elsewhere")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PanickingJob;

#[async_trait]
impl Job for PanickingJob {
    const NAME: &'static str = "PanickingJob";
    type Context = TestContext;

    async fn perform(&self, _ctx: &ExecutionContext<TestContext>) -> anyhow::Result<()> {
        panic!("job body panicked")
    }
}

/// Sleeps while counted as running.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SleepJob {
    pub millis: u64,
}

#[async_trait]
impl Job for SleepJob {
    const NAME: &'static str = "SleepJob";
    type Context = TestContext;

    async fn perform(&self, ctx: &ExecutionContext<TestContext>) -> anyhow::Result<()> {
        let _running = ctx.app().enter();
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        ctx.app().record("slept");
        Ok(())
    }
}

/// At most one performing per key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThrottledJob {
    pub key: String,
    pub millis: u64,
}

#[async_trait]
impl Job for ThrottledJob {
    const NAME: &'static str = "ThrottledJob";
    type Context = TestContext;

    fn concurrency() -> Option<ConcurrencyConfig> {
        Some(ConcurrencyConfig::default().with_perform_limit(1))
    }

    fn concurrency_key(&self) -> Option<String> {
        Some(self.key.clone())
    }

    async fn perform(&self, ctx: &ExecutionContext<TestContext>) -> anyhow::Result<()> {
        let _running = ctx.app().enter();
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        ctx.app().record(format!("throttled:{}", self.key));
        Ok(())
    }
}

/// Rejected at enqueue once `limit` unfinished jobs share its key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CappedJob {
    pub key: String,
}

#[async_trait]
impl Job for CappedJob {
    const NAME: &'static str = "CappedJob";
    type Context = TestContext;

    fn concurrency() -> Option<ConcurrencyConfig> {
        Some(ConcurrencyConfig::default().with_total_limit(2))
    }

    fn concurrency_key(&self) -> Option<String> {
        Some(self.key.clone())
    }

    async fn perform(&self, ctx: &ExecutionContext<TestContext>) -> anyhow::Result<()> {
        ctx.app().record("capped");
        Ok(())
    }
}

/// Enqueues a [`RecordJob`] from inside its own body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpawningJob {
    pub child: String,
}

#[async_trait]
impl Job for SpawningJob {
    const NAME: &'static str = "SpawningJob";
    type Context = TestContext;

    async fn perform(&self, ctx: &ExecutionContext<TestContext>) -> anyhow::Result<()> {
        ctx.enqueue_job(&RecordJob::new(self.child.clone())).await?;
        ctx.app().record("spawned");
        Ok(())
    }
}

/// Batch callback that records `callback:<event>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchCallbackJob(pub BatchCallbackArgs);

#[async_trait]
impl Job for BatchCallbackJob {
    const NAME: &'static str = "BatchCallbackJob";
    type Context = TestContext;

    async fn perform(&self, ctx: &ExecutionContext<TestContext>) -> anyhow::Result<()> {
        ctx.app().record(format!("callback:{}", self.0.event.as_str()));
        Ok(())
    }
}

/// Every fixture job, registered.
pub fn fixture_registry() -> JobRegistry<TestContext> {
    JobRegistry::new()
        .register::<RecordJob>()
        .register::<FailingJob>()
        .register::<RetryingJob>()
        .register::<DiscardJob>()
        .register::<RescuedJob>()
        .register::<PanickingJob>()
        .register::<SleepJob>()
        .register::<ThrottledJob>()
        .register::<CappedJob>()
        .register::<SpawningJob>()
        .register::<BatchCallbackJob>()
}
