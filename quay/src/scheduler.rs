//! Worker pools.
//!
//! A [`Scheduler`] owns one bounded pool of worker tasks for one queue group.
//! A wake-up spawns a worker if a permit is free; the worker performs jobs
//! until the backlog of its group is empty and then exits, returning the
//! permit. An idle timer and a cache of future scheduled times keep the pool
//! busy when no wake-up arrives.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::ShutdownTimeout;
use crate::errors::ErrorSink;
use crate::notifier::{WakeHint, WakeRecipient};
use crate::performer::{ClaimOutcome, Performer};
use crate::runtime::ShutdownToken;
use crate::store::Store;

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub max_threads: usize,
    /// Period of the idle-capacity timer. Zero disables it.
    pub idle_wake_interval: Duration,
    /// Future wake-ups remembered at once.
    pub max_cache: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_threads: 5,
            idle_wake_interval: Duration::from_secs(5),
            max_cache: 10_000,
        }
    }
}

/// Point-in-time counters of one scheduler.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub name: String,
    pub max_threads: usize,
    pub active: usize,
    pub idle_capacity: usize,
    pub executions: u64,
    pub failed_executions: u64,
    /// Infrastructure errors that ended a worker.
    pub errors: u64,
    pub cached_wakeups: usize,
}

struct Inner<St, C> {
    name: String,
    config: SchedulerConfig,
    performer: Arc<Performer<St, C>>,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    delayed: Mutex<BTreeSet<DateTime<Utc>>>,
    delayed_changed: Notify,
    stop: ShutdownToken,
    executions: AtomicU64,
    failed_executions: AtomicU64,
    error_count: AtomicU64,
    errors: ErrorSink,
}

/// Bounded worker pool for one queue group.
pub struct Scheduler<St, C> {
    inner: Arc<Inner<St, C>>,
}

impl<St, C> Clone for Scheduler<St, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<St, C> std::fmt::Debug for Scheduler<St, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("stopped", &self.inner.stop.is_cancelled())
            .finish()
    }
}

impl<St: Store, C: Clone + Send + Sync + 'static> Scheduler<St, C> {
    pub fn new(
        name: impl Into<String>,
        performer: Arc<Performer<St, C>>,
        config: SchedulerConfig,
        errors: ErrorSink,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                permits: Arc::new(Semaphore::new(config.max_threads)),
                config,
                performer,
                tasks: Mutex::new(JoinSet::new()),
                delayed: Mutex::new(BTreeSet::new()),
                delayed_changed: Notify::new(),
                stop: ShutdownToken::new(),
                executions: AtomicU64::new(0),
                failed_executions: AtomicU64::new(0),
                error_count: AtomicU64::new(0),
                errors,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_running(&self) -> bool {
        !self.inner.stop.is_cancelled()
    }

    /// Start the timers and fill the pool once.
    pub fn start(&self) {
        let timers = self.clone();
        self.inner.tasks.lock().spawn(timers.run_timers());
        self.create_thread(None);
    }

    /// Load upcoming scheduled times so their wake-ups need no hint.
    pub async fn warm_cache(&self) -> anyhow::Result<usize> {
        if self.inner.config.max_cache == 0 {
            return Ok(0);
        }
        let upcoming = self.inner.performer.upcoming(self.inner.config.max_cache).await?;
        let cached = upcoming.len();
        self.inner.delayed.lock().extend(upcoming);
        self.inner.delayed_changed.notify_one();
        tracing::debug!(scheduler = %self.inner.name, cached, "warmed scheduled wake-up cache");
        Ok(cached)
    }

    /// React to a wake-up. Returns whether this scheduler acted on it.
    pub fn create_thread(&self, hint: Option<&WakeHint>) -> bool {
        if !self.is_running() || !self.inner.performer.next_hint_matches(hint) {
            return false;
        }
        if let Some(at) = hint.and_then(|hint| hint.scheduled_at)
            && at > Utc::now()
        {
            return self.cache_wakeup(at);
        }
        self.spawn_worker()
    }

    pub fn stats(&self) -> SchedulerStats {
        let idle_capacity = self.inner.permits.available_permits();
        SchedulerStats {
            name: self.inner.name.clone(),
            max_threads: self.inner.config.max_threads,
            active: self.inner.config.max_threads.saturating_sub(idle_capacity),
            idle_capacity,
            executions: self.inner.executions.load(Ordering::Relaxed),
            failed_executions: self.inner.failed_executions.load(Ordering::Relaxed),
            errors: self.inner.error_count.load(Ordering::Relaxed),
            cached_wakeups: self.inner.delayed.lock().len(),
        }
    }

    /// Stop taking work and wait for running workers as `timeout` says.
    ///
    /// Workers finish the job they hold; an expired timeout aborts them,
    /// leaving their executions to be recovered as interrupted.
    pub async fn shutdown(&self, timeout: ShutdownTimeout) {
        self.inner.stop.cancel();
        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());

        match timeout {
            ShutdownTimeout::NoWait => tasks.detach_all(),
            ShutdownTimeout::Forever => self.join_all(&mut tasks).await,
            ShutdownTimeout::After(limit) => {
                if tokio::time::timeout(limit, self.join_all(&mut tasks))
                    .await
                    .is_err()
                {
                    tracing::warn!(
                        scheduler = %self.inner.name,
                        remaining = tasks.len(),
                        "shutdown timeout elapsed, aborting workers"
                    );
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                }
            }
        }
        crate::telemetry::set_active_workers(&self.inner.name, 0);
        tracing::info!(scheduler = %self.inner.name, "scheduler stopped");
    }

    async fn join_all(&self, tasks: &mut JoinSet<()>) {
        while let Some(joined) = tasks.join_next().await {
            self.report_join(joined);
        }
    }

    fn report_join(&self, joined: Result<(), tokio::task::JoinError>) {
        if let Err(err) = joined
            && err.is_panic()
        {
            self.inner.error_count.fetch_add(1, Ordering::Relaxed);
            self.inner
                .errors
                .report(&anyhow::anyhow!("worker task panicked: {err}"), "scheduler");
        }
    }

    fn cache_wakeup(&self, at: DateTime<Utc>) -> bool {
        let max_cache = self.inner.config.max_cache;
        if max_cache == 0 {
            return false;
        }
        {
            let mut delayed = self.inner.delayed.lock();
            if delayed.len() >= max_cache {
                match delayed.last() {
                    Some(latest) if at < *latest => {
                        delayed.pop_last();
                    }
                    _ => return false,
                }
            }
            delayed.insert(at);
        }
        self.inner.delayed_changed.notify_one();
        true
    }

    fn spawn_worker(&self) -> bool {
        let Ok(permit) = Arc::clone(&self.inner.permits).try_acquire_owned() else {
            return false;
        };

        let mut tasks = self.inner.tasks.lock();
        while let Some(joined) = tasks.try_join_next() {
            self.report_join(joined);
        }
        let worker = self.clone();
        tasks.spawn(async move { worker.work(permit).await });
        true
    }

    async fn work(self, permit: OwnedSemaphorePermit) {
        let inner = &self.inner;
        crate::telemetry::set_active_workers(&inner.name, self.stats().active);

        while !inner.stop.is_cancelled() {
            match inner.performer.perform_next().await {
                Ok(ClaimOutcome::Empty) => break,
                Ok(ClaimOutcome::Unexecutable(_)) => continue,
                Ok(ClaimOutcome::Executed(result)) => {
                    inner.executions.fetch_add(1, Ordering::Relaxed);
                    if !result.succeeded() {
                        inner.failed_executions.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(err) => {
                    inner.error_count.fetch_add(1, Ordering::Relaxed);
                    inner.errors.report(&err, "scheduler");
                    break;
                }
            }
        }

        drop(permit);
        crate::telemetry::set_active_workers(&inner.name, self.stats().active);
    }

    async fn run_timers(self) {
        let idle = self.inner.config.idle_wake_interval;
        let mut next_idle = Instant::now() + idle;

        loop {
            let next_delayed = self.inner.delayed.lock().first().copied();
            let delayed_wait =
                next_delayed.map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO));

            tokio::select! {
                _ = self.inner.stop.cancelled() => return,
                _ = self.inner.delayed_changed.notified() => {}
                _ = tokio::time::sleep(delayed_wait.unwrap_or_default()), if delayed_wait.is_some() => {
                    let now = Utc::now();
                    {
                        let mut delayed = self.inner.delayed.lock();
                        delayed.pop_first();
                        while delayed.first().is_some_and(|at| *at <= now) {
                            delayed.pop_first();
                        }
                    }
                    self.create_thread(None);
                }
                _ = tokio::time::sleep_until(next_idle), if !idle.is_zero() => {
                    next_idle = Instant::now() + idle;
                    if self.inner.permits.available_permits() > 0 {
                        self.create_thread(None);
                    }
                }
            }
        }
    }
}

impl<St: Store, C: Clone + Send + Sync + 'static> WakeRecipient for Scheduler<St, C> {
    fn wake(&self, hint: Option<&WakeHint>) -> bool {
        self.create_thread(hint)
    }
}

/// Every queue group of a process behind one wake-up entry point.
pub struct MultiScheduler<St, C> {
    schedulers: Vec<Scheduler<St, C>>,
}

impl<St, C> std::fmt::Debug for MultiScheduler<St, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(&self.schedulers).finish()
    }
}

impl<St: Store, C: Clone + Send + Sync + 'static> MultiScheduler<St, C> {
    pub fn new(schedulers: Vec<Scheduler<St, C>>) -> Self {
        Self { schedulers }
    }

    pub fn schedulers(&self) -> &[Scheduler<St, C>] {
        &self.schedulers
    }

    pub fn start(&self) {
        for scheduler in &self.schedulers {
            scheduler.start();
        }
    }

    pub fn stats(&self) -> Vec<SchedulerStats> {
        self.schedulers.iter().map(Scheduler::stats).collect()
    }

    /// Shut every scheduler down concurrently.
    pub async fn shutdown(&self, timeout: ShutdownTimeout) {
        futures::future::join_all(
            self.schedulers
                .iter()
                .map(|scheduler| scheduler.shutdown(timeout)),
        )
        .await;
    }
}

impl<St: Store, C: Clone + Send + Sync + 'static> WakeRecipient for MultiScheduler<St, C> {
    fn wake(&self, hint: Option<&WakeHint>) -> bool {
        self.schedulers
            .iter()
            .fold(false, |accepted, scheduler| scheduler.create_thread(hint) || accepted)
    }
}
