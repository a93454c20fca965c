//! Errors the execution machinery recognises by type.
//!
//! Job bodies return `anyhow::Error`; the variants here are detected by
//! downcasting so that a body can ask for a discard explicitly and so that
//! concurrency rejections are kept apart from ordinary job errors.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Distinguished failures of a job attempt.
#[derive(Debug, Error)]
pub enum JobError {
    /// Abandon the job without retrying it.
    #[error("discarded: {0}")]
    Discard(String),

    /// The perform-time concurrency limit for the key is reached.
    #[error("concurrency limit exceeded for key {key}")]
    ConcurrencyExceeded { key: String },

    /// The perform-time throttle window for the key is full.
    #[error("throttle exceeded for key {key}")]
    ThrottleExceeded { key: String },

    /// The process running the previous attempt stopped before it finished.
    #[error("interrupted: execution was started but never finished")]
    Interrupted,

    /// No handler is registered for the job class.
    #[error("no job registered under class {0}")]
    UnknownJobClass(String),

    /// The job body panicked.
    #[error("job panicked: {0}")]
    Panicked(String),
}

impl JobError {
    /// Rejections by the concurrency guard, retried without limit.
    pub fn is_concurrency_rejection(&self) -> bool {
        matches!(
            self,
            JobError::ConcurrencyExceeded { .. } | JobError::ThrottleExceeded { .. }
        )
    }
}

/// Shorthand for returning a discard from a job body.
pub fn discard(reason: impl Into<String>) -> anyhow::Error {
    JobError::Discard(reason.into()).into()
}

/// Whether a stored error message records a concurrency or throttle rejection.
pub fn is_rejection_message(message: &str) -> bool {
    message.starts_with("JobError: concurrency limit exceeded")
        || message.starts_with("JobError: throttle exceeded")
}

/// Reasons an enqueue did not produce a job.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The enqueue-time concurrency guard refused the job.
    #[error("enqueue limit reached for concurrency key {key}")]
    ConcurrencyLimit { key: String },

    #[error("failed to serialize job arguments: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cron-produced jobs carry both halves of the de-duplication pair.
    #[error("cron key and cron time must be set together")]
    IncompleteCronPair,

    #[error("job class must not be empty")]
    EmptyJobClass,
}

/// Render an error chain the way it is stored on job and execution rows.
pub fn format_error(error: &anyhow::Error) -> String {
    match error.downcast_ref::<JobError>() {
        Some(job_error) => format!("JobError: {job_error}"),
        None => format!("{error:#}"),
    }
}

/// Process-wide destination for infrastructure errors that no caller can
/// handle: lost notifier connections, failed claims, cron enqueue failures.
#[derive(Clone)]
pub struct ErrorSink {
    report: Arc<dyn Fn(&anyhow::Error, &str) + Send + Sync>,
}

impl fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorSink").finish_non_exhaustive()
    }
}

impl Default for ErrorSink {
    fn default() -> Self {
        Self::logging()
    }
}

impl ErrorSink {
    /// Route errors to `report`, called with the error and the reporting component.
    pub fn new(report: impl Fn(&anyhow::Error, &str) + Send + Sync + 'static) -> Self {
        Self {
            report: Arc::new(report),
        }
    }

    /// Log every error at `error` level.
    pub fn logging() -> Self {
        Self::new(|error, source| {
            tracing::error!(source, "{}", format_error(error));
        })
    }

    pub fn report(&self, error: &anyhow::Error, source: &str) {
        (self.report)(error, source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discard_helper_downcasts() {
        let err = discard("bad input");
        assert!(matches!(
            err.downcast_ref::<JobError>(),
            Some(JobError::Discard(reason)) if reason == "bad input"
        ));
    }

    #[test]
    fn test_concurrency_rejection_kinds() {
        assert!(JobError::ConcurrencyExceeded { key: "k".into() }.is_concurrency_rejection());
        assert!(JobError::ThrottleExceeded { key: "k".into() }.is_concurrency_rejection());
        assert!(!JobError::Interrupted.is_concurrency_rejection());
    }

    #[test]
    fn test_rejection_messages_are_recognised() {
        let stored = format_error(&JobError::ThrottleExceeded { key: "k".into() }.into());
        assert!(is_rejection_message(&stored));
        let stored = format_error(&JobError::ConcurrencyExceeded { key: "k".into() }.into());
        assert!(is_rejection_message(&stored));
        assert!(!is_rejection_message("JobError: discarded: nope"));
    }

    #[test]
    fn test_error_sink_forwards_reports() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = ErrorSink::new({
            let seen = Arc::clone(&seen);
            move |error, source| seen.lock().push(format!("{source}: {error}"))
        });

        sink.report(&anyhow::anyhow!("connection reset"), "notifier");
        assert_eq!(seen.lock().as_slice(), ["notifier: connection reset"]);
    }

    #[test]
    fn test_format_error_keeps_context_chain() {
        let err = anyhow::anyhow!("socket closed").context("fetching report");
        assert_eq!(format_error(&err), "fetching report: socket closed");
        assert_eq!(
            format_error(&JobError::Interrupted.into()),
            "JobError: interrupted: execution was started but never finished"
        );
    }
}
