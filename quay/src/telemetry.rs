//! Tracing and telemetry instrumentation for quay.
//!
//! Span constructors for the job lifecycle and `record_*` helpers that log an
//! event and, with the `metrics` feature, update the Prometheus collectors.
//! The library never installs a subscriber.
//!
//! # Example
//!
//! ```ignore
//! use quay::telemetry::{perform_span, record_job_enqueued};
//! use tracing::Instrument;
//!
//! async { /* run the job */ }.instrument(perform_span("SendEmail", job_id, 1)).await;
//! record_job_enqueued("SendEmail", "default");
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{Span, info_span};

use crate::batch::BatchEvent;
use crate::job::{BatchId, ErrorEvent, JobId};
use crate::queue::QueueFilter;

/// Span around one enqueue call.
#[must_use]
pub fn enqueue_span(job_class: &str, queue: &str) -> Span {
    info_span!("quay.enqueue", job_class = %job_class, queue = %queue)
}

/// Span around one dequeue query.
#[must_use]
pub fn claim_span(filter: &QueueFilter) -> Span {
    info_span!("quay.claim", queues = %filter)
}

/// Span around one attempt, from execution start to persisted finish.
#[must_use]
pub fn perform_span(job_class: &str, job_id: JobId, attempt: u32) -> Span {
    info_span!(
        "quay.perform",
        job_class = %job_class,
        job_id = %job_id,
        attempt = attempt,
    )
}

#[must_use]
pub fn batch_span(batch_id: BatchId, operation: &str) -> Span {
    info_span!("quay.batch", batch_id = %batch_id, operation = %operation)
}

#[must_use]
pub fn cron_span(cron_key: &str, fire_at: DateTime<Utc>) -> Span {
    info_span!("quay.cron", cron_key = %cron_key, fire_at = %fire_at)
}

/// Span around dispatching one received wake hint.
#[must_use]
pub fn notify_span(queue: Option<&str>) -> Span {
    info_span!("quay.notify", queue = queue.unwrap_or("*"))
}

pub fn record_job_enqueued(job_class: &str, queue: &str) {
    tracing::debug!(job_class, queue, "job enqueued");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_enqueued(queue, job_class);
}

/// Record a persisted finish. `event` is `None` for success.
pub fn record_execution_finished(job_class: &str, event: Option<ErrorEvent>, duration: Duration) {
    let outcome = event.map_or("succeeded", |event| event.as_str());
    tracing::debug!(
        job_class,
        outcome,
        duration_secs = duration.as_secs_f64(),
        "execution finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_execution_finished(job_class, outcome, duration.as_secs_f64());
}

/// Record a refusal by the concurrency guard. `limit` names the tripped limit.
pub fn record_concurrency_rejected(key: &str, limit: &str) {
    tracing::info!(concurrency_key = %key, limit, "concurrency limit reached");

    #[cfg(feature = "metrics")]
    crate::metrics::record_concurrency_rejected(limit);
}

pub fn record_cron_fire(cron_key: &str, fire_at: DateTime<Utc>, duplicate: bool) {
    if duplicate {
        tracing::debug!(cron_key, %fire_at, "cron fire already enqueued elsewhere");
    } else {
        tracing::info!(cron_key, %fire_at, "cron fire enqueued");
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_cron_fire(cron_key, duplicate);
}

pub fn record_notification(queue: Option<&str>) {
    let queue = queue.unwrap_or("*");
    tracing::trace!(queue, "wake hint received");

    #[cfg(feature = "metrics")]
    crate::metrics::record_notification(queue);
}

pub fn record_batch_event(batch_id: BatchId, event: BatchEvent) {
    tracing::info!(batch_id = %batch_id, event = event.as_str(), "batch transition");

    #[cfg(feature = "metrics")]
    crate::metrics::record_batch_event(event.as_str());
}

pub fn set_active_workers(scheduler: &str, active: usize) {
    tracing::trace!(scheduler, active, "active workers updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_active_workers(scheduler, active as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_names() {
        let id = JobId::new();
        assert_eq!(
            enqueue_span("Example", "default").metadata().unwrap().name(),
            "quay.enqueue"
        );
        assert_eq!(
            claim_span(&QueueFilter::All).metadata().unwrap().name(),
            "quay.claim"
        );
        assert_eq!(
            perform_span("Example", id, 1).metadata().unwrap().name(),
            "quay.perform"
        );
        assert_eq!(
            batch_span(BatchId::new(), "check").metadata().unwrap().name(),
            "quay.batch"
        );
        assert_eq!(
            cron_span("nightly", Utc::now()).metadata().unwrap().name(),
            "quay.cron"
        );
        assert_eq!(notify_span(None).metadata().unwrap().name(), "quay.notify");
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_job_enqueued("Example", "default");
        record_execution_finished("Example", Some(ErrorEvent::Retried), Duration::from_millis(3));
        record_execution_finished("Example", None, Duration::ZERO);
        record_concurrency_rejected("tenant-1", "perform_limit");
        record_cron_fire("nightly", Utc::now(), true);
        record_notification(Some("mice"));
        record_batch_event(BatchId::new(), BatchEvent::Finish);
        set_active_workers("*:5", 3);
    }
}
