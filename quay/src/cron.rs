//! Recurring jobs.
//!
//! Each [`CronEntry`] runs in its own task: it sleeps until the next fire
//! time, computes the fire after that, and enqueues the job tagged with
//! `(key, fire_time)`. The store rejects a second job with the same pair,
//! so processes whose timers fire together enqueue it once.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::client::{EnqueueOutcome, Enqueuer};
use crate::errors::ErrorSink;
use crate::handler::Job;
use crate::job::NewJob;
use crate::runtime::ShutdownToken;
use crate::settings::Settings;
use crate::store::SettingStore;

/// Most missed fires enqueued per entry when catching up after a restart.
const MAX_CATCH_UP_FIRES: usize = 1_000;

/// When an entry fires.
#[derive(Clone)]
pub enum CronSchedule {
    Expression(Box<cron::Schedule>),
    /// Computes the next fire strictly after the given instant.
    Dynamic(Arc<dyn Fn(DateTime<Utc>) -> Option<DateTime<Utc>> + Send + Sync>),
}

impl std::fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CronSchedule::Expression(schedule) => write!(f, "Expression({schedule})"),
            CronSchedule::Dynamic(_) => f.write_str("Dynamic"),
        }
    }
}

impl CronSchedule {
    /// Parse a cron expression. Five-field expressions get a zero seconds
    /// column; `@hourly` style shortcuts are accepted as is.
    pub fn parse(expression: &str) -> anyhow::Result<Self> {
        let expression = expression.trim();
        let widened = if !expression.starts_with('@')
            && expression.split_whitespace().count() == 5
        {
            format!("0 {expression}")
        } else {
            expression.to_string()
        };
        let schedule = cron::Schedule::from_str(&widened)
            .map_err(|err| anyhow::anyhow!("invalid cron expression {expression:?}: {err}"))?;
        Ok(CronSchedule::Expression(Box::new(schedule)))
    }

    pub fn dynamic(
        next: impl Fn(DateTime<Utc>) -> Option<DateTime<Utc>> + Send + Sync + 'static,
    ) -> Self {
        CronSchedule::Dynamic(Arc::new(next))
    }

    /// First fire strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            CronSchedule::Expression(schedule) => schedule.after(&after).next(),
            CronSchedule::Dynamic(next) => next(after).filter(|at| *at > after),
        }
    }

    /// Fires in `(from, to]`, at most `limit` of them, oldest first.
    pub fn fires_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Vec<DateTime<Utc>> {
        let mut fires = Vec::new();
        let mut cursor = from;
        while fires.len() < limit {
            match self.next_after(cursor) {
                Some(at) if at <= to => {
                    fires.push(at);
                    cursor = at;
                }
                _ => break,
            }
        }
        fires
    }
}

impl FromStr for CronSchedule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// One recurring job.
#[derive(Clone, Debug)]
pub struct CronEntry {
    pub key: String,
    pub schedule: CronSchedule,
    pub job_class: String,
    pub args: serde_json::Value,
    pub queue: Option<String>,
    pub priority: Option<i32>,
    pub labels: BTreeSet<String>,
    pub description: Option<String>,
    /// Whether the entry fires when no administrative override exists.
    pub enabled_by_default: bool,
}

impl CronEntry {
    pub fn new(
        key: impl Into<String>,
        schedule: CronSchedule,
        job_class: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            schedule,
            job_class: job_class.into(),
            args: serde_json::Value::Object(Default::default()),
            queue: None,
            priority: None,
            labels: BTreeSet::new(),
            description: None,
            enabled_by_default: true,
        }
    }

    /// Entry that enqueues `job` with its class-level queue, priority and labels.
    pub fn for_job<J: Job>(
        key: impl Into<String>,
        schedule: CronSchedule,
        job: &J,
    ) -> anyhow::Result<Self> {
        let template = NewJob::from_job(job)?;
        Ok(Self {
            args: template.serialized_params,
            queue: Some(template.queue_name),
            priority: template.priority,
            labels: template.labels,
            ..Self::new(key, schedule, J::NAME)
        })
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn disabled_by_default(mut self) -> Self {
        self.enabled_by_default = false;
        self
    }

    /// The job enqueued for the fire at `at`.
    pub fn new_job(&self, at: DateTime<Utc>) -> NewJob {
        let mut job = NewJob::new(self.job_class.clone(), self.args.clone()).cron(&self.key, at);
        if let Some(queue) = &self.queue {
            job = job.queue(queue.clone());
        }
        if let Some(priority) = self.priority {
            job = job.priority(priority);
        }
        job.labels = self.labels.clone();
        job
    }
}

/// Drives every cron entry of a process.
pub struct CronManager<St> {
    entries: Vec<Arc<CronEntry>>,
    enqueuer: Arc<dyn Enqueuer>,
    settings: Settings<St>,
    graceful_restart_period: Option<Duration>,
    errors: ErrorSink,
}

impl<St> std::fmt::Debug for CronManager<St> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self.entries.iter().map(|e| e.key.as_str()).collect();
        f.debug_struct("CronManager")
            .field("entries", &keys)
            .field("graceful_restart_period", &self.graceful_restart_period)
            .finish()
    }
}

impl<St: SettingStore + 'static> CronManager<St> {
    pub fn new(entries: Vec<CronEntry>, enqueuer: Arc<dyn Enqueuer>, settings: Settings<St>) -> Self {
        Self {
            entries: entries.into_iter().map(Arc::new).collect(),
            enqueuer,
            settings,
            graceful_restart_period: None,
            errors: ErrorSink::default(),
        }
    }

    pub fn with_graceful_restart_period(mut self, period: Option<Duration>) -> Self {
        self.graceful_restart_period = period;
        self
    }

    pub fn with_error_sink(mut self, errors: ErrorSink) -> Self {
        self.errors = errors;
        self
    }

    pub fn entries(&self) -> impl Iterator<Item = &CronEntry> {
        self.entries.iter().map(Arc::as_ref)
    }

    /// Enqueue the fire of `entry` at `at` unless the entry is disabled.
    ///
    /// Returns `None` when disabled; a fire already enqueued by another
    /// process comes back as [`EnqueueOutcome::Duplicate`].
    pub async fn fire(
        &self,
        entry: &CronEntry,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Option<EnqueueOutcome>> {
        if !self
            .settings
            .cron_enabled(&entry.key, entry.enabled_by_default)
            .await?
        {
            tracing::debug!(cron_key = %entry.key, "cron entry disabled, skipping fire");
            return Ok(None);
        }

        let outcome = self.enqueuer.enqueue(entry.new_job(at)).await?;
        let duplicate = matches!(outcome, EnqueueOutcome::Duplicate);
        crate::telemetry::record_cron_fire(&entry.key, at, duplicate);
        Ok(Some(outcome))
    }

    /// Enqueue fires missed within the graceful restart period before `now`.
    pub async fn enqueue_missed(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let Some(period) = self.graceful_restart_period else {
            return Ok(0);
        };
        let from = now - chrono::Duration::from_std(period)?;

        let mut enqueued = 0;
        for entry in &self.entries {
            for at in entry.schedule.fires_between(from, now, MAX_CATCH_UP_FIRES) {
                if let Some(EnqueueOutcome::Enqueued(_)) = self.fire(entry, at).await? {
                    enqueued += 1;
                }
            }
        }
        if enqueued > 0 {
            tracing::info!(enqueued, "enqueued cron fires missed during restart");
        }
        Ok(enqueued)
    }

    /// Catch up on missed fires, then run every entry until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownToken) {
        if let Err(err) = self.enqueue_missed(Utc::now()).await {
            self.errors.report(&err, "cron");
        }

        let mut tasks = JoinSet::new();
        for entry in &self.entries {
            tasks.spawn(Arc::clone(&self).run_entry(Arc::clone(entry), shutdown.clone()));
        }
        while tasks.join_next().await.is_some() {}
    }

    async fn run_entry(self: Arc<Self>, entry: Arc<CronEntry>, shutdown: ShutdownToken) {
        let mut next = entry.schedule.next_after(Utc::now());

        while let Some(at) = next {
            let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            // Schedule the following fire before enqueueing this one.
            next = entry.schedule.next_after(at);

            let manager = Arc::clone(&self);
            let fired = Arc::clone(&entry);
            tokio::spawn(
                async move {
                    if let Err(err) = manager.fire(&fired, at).await {
                        manager.errors.report(&err, "cron");
                    }
                }
                .instrument(crate::telemetry::cron_span(&entry.key, at)),
            );
        }

        tracing::info!(cron_key = %entry.key, "cron entry has no further fire times");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_five_field_expressions_are_widened() {
        let schedule = CronSchedule::parse("*/15 * * * *").unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 10, 7, 30).unwrap();
        let next = schedule.next_after(base).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (10, 15, 0));
    }

    #[test]
    fn test_shortcuts_and_invalid_expressions() {
        let hourly = CronSchedule::parse("@hourly").unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 10, 7, 0).unwrap();
        assert_eq!(
            hourly.next_after(base),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap())
        );
        assert!(CronSchedule::parse("every tuesday").is_err());
    }

    #[test]
    fn test_fires_between_is_bounded() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let to = from + chrono::Duration::minutes(5);

        let fires = schedule.fires_between(from, to, 100);
        assert_eq!(fires.len(), 5);
        assert_eq!(fires.last(), Some(&to));
        assert_eq!(schedule.fires_between(from, to, 2).len(), 2);
    }

    #[test]
    fn test_dynamic_schedule_must_move_forward() {
        let every_ten = CronSchedule::dynamic(|after| Some(after + chrono::Duration::seconds(10)));
        let now = Utc::now();
        assert_eq!(every_ten.next_after(now), Some(now + chrono::Duration::seconds(10)));

        let stuck = CronSchedule::dynamic(Some);
        assert_eq!(stuck.next_after(now), None);
    }

    #[test]
    fn test_entry_builds_cron_tagged_job() {
        let entry = CronEntry::new("nightly", CronSchedule::parse("@daily").unwrap(), "Report")
            .queue("reports")
            .priority(3)
            .label("ops");
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let job = entry.new_job(at);

        assert_eq!(job.cron_key.as_deref(), Some("nightly"));
        assert_eq!(job.cron_at, Some(at));
        assert_eq!(job.queue_name, "reports");
        assert_eq!(job.priority, Some(3));
        assert!(job.labels.contains("ops"));
    }
}
