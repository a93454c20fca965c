//! Concurrency and throttle admission control.
//!
//! Limits apply to jobs sharing a concurrency key. Enqueue-time limits
//! refuse the insert; perform-time limits fail the attempt with a
//! retryable [`JobError`]. Every check counts rows while holding the
//! advisory lock of the key, so concurrent checks for one key serialize.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::JobError;
use crate::lock::{LockSession, concurrency_lock_key, with_blocking_lock};
use crate::store::{ConcurrencyCount, JobStore};

/// At most `limit` events per trailing `period`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Throttle {
    pub limit: u64,
    pub period: Duration,
}

impl Throttle {
    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let period = chrono::Duration::from_std(self.period).unwrap_or(chrono::Duration::MAX);
        now.checked_sub_signed(period)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Limits for one job class.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Unfinished jobs, running or not.
    pub total_limit: Option<u64>,
    /// Unfinished jobs waiting to run.
    pub enqueue_limit: Option<u64>,
    /// Jobs running at once.
    pub perform_limit: Option<u64>,
    pub enqueue_throttle: Option<Throttle>,
    pub perform_throttle: Option<Throttle>,
}

impl ConcurrencyConfig {
    pub fn with_total_limit(mut self, limit: u64) -> Self {
        self.total_limit = Some(limit);
        self
    }

    pub fn with_enqueue_limit(mut self, limit: u64) -> Self {
        self.enqueue_limit = Some(limit);
        self
    }

    pub fn with_perform_limit(mut self, limit: u64) -> Self {
        self.perform_limit = Some(limit);
        self
    }

    pub fn with_enqueue_throttle(mut self, limit: u64, period: Duration) -> Self {
        self.enqueue_throttle = Some(Throttle { limit, period });
        self
    }

    pub fn with_perform_throttle(mut self, limit: u64, period: Duration) -> Self {
        self.perform_throttle = Some(Throttle { limit, period });
        self
    }

    pub fn checks_enqueue(&self) -> bool {
        self.total_limit.is_some() || self.enqueue_limit.is_some() || self.enqueue_throttle.is_some()
    }

    pub fn checks_perform(&self) -> bool {
        self.perform_limit.is_some() || self.perform_throttle.is_some()
    }
}

/// The limit a check tripped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LimitKind {
    Total,
    Enqueue,
    EnqueueThrottle,
    Perform,
    PerformThrottle,
}

impl LimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::Total => "total_limit",
            LimitKind::Enqueue => "enqueue_limit",
            LimitKind::EnqueueThrottle => "enqueue_throttle",
            LimitKind::Perform => "perform_limit",
            LimitKind::PerformThrottle => "perform_throttle",
        }
    }
}

/// Whether inserting one more job for `key` would break an enqueue limit.
///
/// The caller must hold the concurrency lock of `key` across this check and
/// the insert it guards.
pub async fn enqueue_violation<St: JobStore + ?Sized>(
    store: &St,
    key: &str,
    config: &ConcurrencyConfig,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<LimitKind>> {
    if let Some(limit) = config.total_limit
        && store.count_concurrency(key, ConcurrencyCount::Unfinished).await? >= limit
    {
        return Ok(Some(LimitKind::Total));
    }

    if let Some(limit) = config.enqueue_limit
        && store.count_concurrency(key, ConcurrencyCount::Enqueued).await? >= limit
    {
        return Ok(Some(LimitKind::Enqueue));
    }

    if let Some(throttle) = config.enqueue_throttle {
        let since = throttle.window_start(now);
        if store
            .count_concurrency(key, ConcurrencyCount::CreatedSince(since))
            .await?
            >= throttle.limit
        {
            return Ok(Some(LimitKind::EnqueueThrottle));
        }
    }

    Ok(None)
}

/// Whether the claimed job, already counted as performing, exceeds a perform limit.
pub async fn perform_violation<St: JobStore + ?Sized>(
    store: &St,
    key: &str,
    config: &ConcurrencyConfig,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<LimitKind>> {
    if let Some(limit) = config.perform_limit
        && store.count_concurrency(key, ConcurrencyCount::Performing).await? > limit
    {
        return Ok(Some(LimitKind::Perform));
    }

    if let Some(throttle) = config.perform_throttle {
        let since = throttle.window_start(now);
        if store
            .count_concurrency(key, ConcurrencyCount::PerformedSince(since))
            .await?
            > throttle.limit
        {
            return Ok(Some(LimitKind::PerformThrottle));
        }
    }

    Ok(None)
}

/// Run the perform-time check for `key` under its concurrency lock.
///
/// Returns the retryable error the attempt must fail with, if any.
pub async fn admit_perform<St, S>(
    store: &St,
    session: &mut S,
    key: &str,
    config: &ConcurrencyConfig,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<JobError>>
where
    St: JobStore + ?Sized,
    S: LockSession + ?Sized,
{
    if !config.checks_perform() {
        return Ok(None);
    }

    let violation = with_blocking_lock(session, &concurrency_lock_key(key), || {
        perform_violation(store, key, config, now)
    })
    .await?;

    Ok(violation.map(|kind| {
        crate::telemetry::record_concurrency_rejected(key, kind.as_str());
        match kind {
            LimitKind::PerformThrottle => JobError::ThrottleExceeded {
                key: key.to_string(),
            },
            _ => JobError::ConcurrencyExceeded {
                key: key.to_string(),
            },
        }
    }))
}
