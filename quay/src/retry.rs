use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use crate::errors::{JobError, is_rejection_message};
use crate::job::{ErrorEvent, ExecutionId, ExecutionRecord};

/// Predicate over a job error.
pub type ErrorMatcher = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Delay curve between attempts.
#[derive(Clone, Debug, PartialEq)]
pub enum Backoff {
    /// Same delay every time.
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
    /// `attempt^4 + 2` seconds, optionally capped.
    Polynomial { max: Option<Duration> },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            base: Duration::seconds(1),
            max: Duration::minutes(5),
        }
    }
}

/// Delay before the attempt that follows attempt number `attempt` (1-based).
pub fn compute_backoff(attempt: u32, backoff: &Backoff) -> Duration {
    if attempt == 0 {
        return Duration::zero();
    }

    match backoff {
        Backoff::Fixed(delay) => *delay,
        Backoff::Exponential { base, max } => {
            let exp = attempt.saturating_sub(1).min(62) as i32;
            let scaled = (base.num_milliseconds() as f64) * 2f64.powi(exp);
            let capped = scaled.min(max.num_milliseconds() as f64);
            Duration::milliseconds(capped.max(0.0) as i64)
        }
        Backoff::Polynomial { max } => {
            let secs = (attempt as f64).powi(4) + 2.0;
            let delay = Duration::milliseconds((secs * 1000.0).min(i64::MAX as f64 / 2.0) as i64);
            match max {
                Some(max) => delay.min(*max),
                None => delay,
            }
        }
    }
}

/// Add up to `ratio * delay` of random extra delay.
pub fn apply_jitter(delay: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 || delay <= Duration::zero() {
        return delay;
    }

    let spread = (delay.num_milliseconds() as f64 * ratio) as i64;
    if spread <= 0 {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0..=spread);
    delay + Duration::milliseconds(extra)
}

/// How many executions a job may have in total.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Attempts {
    Limited(u32),
    Unlimited,
}

impl Attempts {
    /// Whether another attempt may follow attempt number `attempt`.
    pub fn allows_after(&self, attempt: u32) -> bool {
        match self {
            Attempts::Limited(max) => attempt < *max,
            Attempts::Unlimited => true,
        }
    }
}

/// Per-job-class retry and discard rules.
///
/// The default policy retries nothing: an error that no rule matches ends
/// the job as `unhandled`.
#[derive(Clone)]
pub struct RetryPolicy {
    pub attempts: Attempts,
    pub backoff: Backoff,
    /// Ratio of random extra delay added to each backoff.
    pub jitter: f64,
    retry_on: Option<ErrorMatcher>,
    discard_on: Option<ErrorMatcher>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("attempts", &self.attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("retry_on", &self.retry_on.is_some())
            .field("discard_on", &self.discard_on.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            attempts: Attempts::Limited(1),
            backoff: Backoff::default(),
            jitter: 0.0,
            retry_on: None,
            discard_on: None,
        }
    }

    /// Retry any error until `max` executions have happened.
    pub fn attempts(max: u32) -> Self {
        Self {
            attempts: Attempts::Limited(max),
            retry_on: Some(Arc::new(|_| true)),
            ..Self::none()
        }
    }

    /// Retry any error forever.
    pub fn unlimited() -> Self {
        Self {
            attempts: Attempts::Unlimited,
            retry_on: Some(Arc::new(|_| true)),
            ..Self::none()
        }
    }

    /// Policy applied to concurrency and throttle rejections.
    pub fn concurrency_rejection() -> Self {
        Self::unlimited()
            .with_backoff(Backoff::Polynomial {
                max: Some(Duration::minutes(10)),
            })
            .with_jitter(0.15)
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter = ratio;
        self
    }

    /// Only retry errors matching `matcher`.
    pub fn retry_on(
        mut self,
        matcher: impl Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_on = Some(Arc::new(matcher));
        self
    }

    /// Discard the job on errors matching `matcher`, ahead of any retry.
    pub fn discard_on(
        mut self,
        matcher: impl Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.discard_on = Some(Arc::new(matcher));
        self
    }

    pub fn matches_retry(&self, error: &anyhow::Error) -> bool {
        self.retry_on.as_ref().is_some_and(|m| m(error))
    }

    pub fn matches_discard(&self, error: &anyhow::Error) -> bool {
        self.discard_on.as_ref().is_some_and(|m| m(error))
    }

    /// Delay before the attempt following `attempt`, jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        apply_jitter(compute_backoff(attempt, &self.backoff), self.jitter)
    }
}

/// What happens to a job after a failed attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum Disposition {
    /// Run again no earlier than `at`.
    Retry { at: DateTime<Utc> },
    /// Finish the job with the given tag.
    Finish(ErrorEvent),
}

impl Disposition {
    pub fn error_event(&self) -> ErrorEvent {
        match self {
            Disposition::Retry { .. } => ErrorEvent::Retried,
            Disposition::Finish(event) => *event,
        }
    }
}

/// Attempt numbers of the failing execution, counted per kind of failure.
///
/// Concurrency rejections and interrupted attempts never spend the retry
/// budget, so they are tallied apart from ordinary retried failures.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AttemptCount {
    /// 1-based number of this failure among failures retried by policy.
    pub failure: u32,
    /// 1-based number of this rejection among concurrency rejections.
    pub rejection: u32,
}

impl AttemptCount {
    pub fn first() -> Self {
        Self::new(1, 1)
    }

    pub fn new(failure: u32, rejection: u32) -> Self {
        Self { failure, rejection }
    }

    /// Count the finished executions of one job that precede `current`.
    pub fn from_executions(executions: &[ExecutionRecord], current: ExecutionId) -> Self {
        let mut count = Self::first();
        for execution in executions.iter().filter(|e| e.id != current) {
            if execution.error_event != Some(ErrorEvent::Retried) {
                continue;
            }
            if execution.error.as_deref().is_some_and(is_rejection_message) {
                count.rejection = count.rejection.saturating_add(1);
            } else {
                count.failure = count.failure.saturating_add(1);
            }
        }
        count
    }
}

/// Decide the fate of an attempt that failed with `error`.
///
/// Precedence: explicit discard, concurrency rejection, `discard_on`,
/// `retry_on` (retry or stop), the job's own rescue, and finally unhandled.
pub fn classify(
    error: &anyhow::Error,
    attempt: AttemptCount,
    policy: &RetryPolicy,
    rescued: bool,
    now: DateTime<Utc>,
) -> Disposition {
    if let Some(job_error) = error.downcast_ref::<JobError>() {
        match job_error {
            JobError::Discard(_) => return Disposition::Finish(ErrorEvent::Discarded),
            JobError::UnknownJobClass(_) => return Disposition::Finish(ErrorEvent::Unhandled),
            rejection if rejection.is_concurrency_rejection() => {
                let delay = RetryPolicy::concurrency_rejection().delay_for(attempt.rejection);
                return Disposition::Retry { at: now + delay };
            }
            _ => {}
        }
    }

    if policy.matches_discard(error) {
        return Disposition::Finish(ErrorEvent::Discarded);
    }

    if policy.matches_retry(error) {
        return if policy.attempts.allows_after(attempt.failure) {
            Disposition::Retry {
                at: now + policy.delay_for(attempt.failure),
            }
        } else {
            Disposition::Finish(ErrorEvent::RetryStopped)
        };
    }

    if rescued {
        return Disposition::Finish(ErrorEvent::Handled);
    }

    Disposition::Finish(ErrorEvent::Unhandled)
}
