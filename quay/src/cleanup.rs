//! Retention of finished jobs.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::errors::ErrorSink;
use crate::job::{ErrorEvent, JobRecord};
use crate::runtime::ShutdownToken;
use crate::store::{BatchStore, JobStore, PurgeRequest, PurgeStats};

const PURGE_CHUNK: usize = 1000;

/// Which finished jobs are kept after they finish.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Delete finished jobs right away.
    Never,
    /// Keep everything until the cleaner purges it.
    Always,
    /// Keep only jobs whose last error went unhandled.
    #[default]
    OnUnhandledError,
}

impl RetentionPolicy {
    /// Whether `job` should be deleted as soon as it finishes.
    ///
    /// Batch members are left alone: the batch needs them until it finishes.
    /// Cron fires are left alone too: their `(cron_key, cron_at)` row is what
    /// stops another process, or a restart catch-up, from enqueueing the same
    /// fire again. Both are removed by [`Cleaner::purge`].
    pub fn should_delete(&self, job: &JobRecord) -> bool {
        if !job.is_finished() || job.batch_id.is_some() || job.cron_key.is_some() {
            return false;
        }
        match self {
            RetentionPolicy::Always => false,
            RetentionPolicy::Never => true,
            RetentionPolicy::OnUnhandledError => !matches!(
                job.error_event,
                Some(ErrorEvent::Unhandled | ErrorEvent::RetryStopped)
            ),
        }
    }
}

impl std::str::FromStr for RetentionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "never" | "false" => Ok(RetentionPolicy::Never),
            "always" | "true" => Ok(RetentionPolicy::Always),
            "on_unhandled_error" => Ok(RetentionPolicy::OnUnhandledError),
            other => Err(anyhow::anyhow!("unknown retention policy {other:?}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CleanupConfig {
    /// Purge jobs that finished with an error as well.
    pub include_discarded: bool,
    /// Age after which finished jobs are purged.
    pub preserved_for: Duration,
    /// Period of the purge timer. Zero disables it.
    pub interval: Duration,
    /// Purge after this many executions. Zero disables it.
    pub interval_jobs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            include_discarded: true,
            preserved_for: Duration::from_secs(14 * 24 * 60 * 60),
            interval: Duration::from_secs(10 * 60),
            interval_jobs: 1000,
        }
    }
}

/// Purges old finished jobs, batches and their executions.
pub struct Cleaner<St> {
    store: Arc<St>,
    config: CleanupConfig,
    executions: AtomicU64,
    due: Notify,
}

impl<St> std::fmt::Debug for Cleaner<St> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cleaner")
            .field("config", &self.config)
            .field("executions", &self.executions.load(Ordering::Relaxed))
            .finish()
    }
}

impl<St: JobStore + BatchStore + 'static> Cleaner<St> {
    pub fn new(store: Arc<St>, config: CleanupConfig) -> Self {
        Self {
            store,
            config,
            executions: AtomicU64::new(0),
            due: Notify::new(),
        }
    }

    /// Count one finished execution, waking the purge loop every
    /// `interval_jobs` executions.
    pub fn record_execution(&self) {
        let threshold = self.config.interval_jobs;
        if threshold == 0 {
            return;
        }
        if self.executions.fetch_add(1, Ordering::Relaxed) + 1 >= threshold {
            self.executions.store(0, Ordering::Relaxed);
            self.due.notify_one();
        }
    }

    /// Delete everything past the retention threshold.
    pub async fn purge(&self) -> anyhow::Result<PurgeStats> {
        let preserved = chrono::Duration::from_std(self.config.preserved_for)?;
        let finished_before = Utc::now() - preserved;
        let request = PurgeRequest {
            finished_before,
            include_discarded: self.config.include_discarded,
            limit: PURGE_CHUNK,
        };

        let mut total = PurgeStats::default();
        loop {
            let stats = self.store.purge_finished(request).await?;
            total.jobs += stats.jobs;
            total.executions += stats.executions;
            if stats.jobs < PURGE_CHUNK as u64 {
                break;
            }
        }
        total.batches = self.store.purge_batches(finished_before).await?;

        if total != PurgeStats::default() {
            tracing::info!(
                jobs = total.jobs,
                executions = total.executions,
                batches = total.batches,
                "purged finished records"
            );
        }
        Ok(total)
    }

    /// Purge on the timer and whenever enough executions have finished.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownToken, errors: ErrorSink) {
        let interval = self.config.interval;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = self.due.notified() => {}
                _ = tokio::time::sleep(interval), if !interval.is_zero() => {}
            }
            if let Err(err) = self.purge().await {
                errors.report(&err, "cleaner");
            }
        }
    }
}
