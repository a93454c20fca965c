//! Prometheus metrics for quay.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag
//! and registered in a dedicated [`REGISTRY`].
//!
//! # Metrics
//!
//! ## Counters
//! - `quay_jobs_enqueued_total` - Jobs inserted, by queue and class
//! - `quay_executions_finished_total` - Finished attempts, by class and outcome
//! - `quay_concurrency_rejected_total` - Admission control rejections, by limit
//! - `quay_cron_fires_total` - Cron fires, enqueued or duplicate
//! - `quay_notifications_total` - Wake hints received
//! - `quay_batch_events_total` - Batch discard and finish transitions
//!
//! ## Gauges
//! - `quay_active_workers` - Busy workers per scheduler
//!
//! ## Histograms
//! - `quay_execution_duration_seconds` - Job body duration
#![cfg(feature = "metrics")]

use prometheus::{CounterVec, GaugeVec, HistogramVec, Opts, Registry, exponential_buckets};
use std::sync::LazyLock;

/// Registry holding every quay collector.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static JOBS_ENQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("quay_jobs_enqueued_total", "Total number of jobs enqueued");
    CounterVec::new(opts, &["queue", "job_class"])
        .expect("quay_jobs_enqueued_total metric creation failed")
});

/// Labels:
/// - `job_class`: The job class
/// - `outcome`: `succeeded` or the error event
pub static EXECUTIONS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "quay_executions_finished_total",
        "Total number of finished executions",
    );
    CounterVec::new(opts, &["job_class", "outcome"])
        .expect("quay_executions_finished_total metric creation failed")
});

pub static CONCURRENCY_REJECTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "quay_concurrency_rejected_total",
        "Enqueues and attempts refused by concurrency limits",
    );
    CounterVec::new(opts, &["limit"])
        .expect("quay_concurrency_rejected_total metric creation failed")
});

/// Labels:
/// - `cron_key`: The cron entry key
/// - `result`: `enqueued` or `duplicate`
pub static CRON_FIRES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("quay_cron_fires_total", "Total number of cron fires");
    CounterVec::new(opts, &["cron_key", "result"])
        .expect("quay_cron_fires_total metric creation failed")
});

pub static NOTIFICATIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("quay_notifications_total", "Wake hints received");
    CounterVec::new(opts, &["queue"]).expect("quay_notifications_total metric creation failed")
});

pub static BATCH_EVENTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("quay_batch_events_total", "Batch state transitions");
    CounterVec::new(opts, &["event"]).expect("quay_batch_events_total metric creation failed")
});

pub static ACTIVE_WORKERS: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("quay_active_workers", "Workers currently performing jobs");
    GaugeVec::new(opts, &["scheduler"]).expect("quay_active_workers metric creation failed")
});

pub static EXECUTION_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "quay_execution_duration_seconds",
        "Job execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["job_class", "outcome"])
        .expect("quay_execution_duration_seconds metric creation failed")
});

/// Register every collector with [`REGISTRY`]. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_ENQUEUED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(EXECUTIONS_FINISHED_TOTAL.clone()),
        Box::new(CONCURRENCY_REJECTED_TOTAL.clone()),
        Box::new(CRON_FIRES_TOTAL.clone()),
        Box::new(NOTIFICATIONS_TOTAL.clone()),
        Box::new(BATCH_EVENTS_TOTAL.clone()),
        Box::new(ACTIVE_WORKERS.clone()),
        Box::new(EXECUTION_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_enqueued(queue: &str, job_class: &str) {
    JOBS_ENQUEUED_TOTAL
        .with_label_values(&[queue, job_class])
        .inc();
}

pub fn record_execution_finished(job_class: &str, outcome: &str, duration_secs: f64) {
    EXECUTIONS_FINISHED_TOTAL
        .with_label_values(&[job_class, outcome])
        .inc();
    EXECUTION_DURATION_SECONDS
        .with_label_values(&[job_class, outcome])
        .observe(duration_secs);
}

pub fn record_concurrency_rejected(limit: &str) {
    CONCURRENCY_REJECTED_TOTAL.with_label_values(&[limit]).inc();
}

pub fn record_cron_fire(cron_key: &str, duplicate: bool) {
    let result = if duplicate { "duplicate" } else { "enqueued" };
    CRON_FIRES_TOTAL
        .with_label_values(&[cron_key, result])
        .inc();
}

pub fn record_notification(queue: &str) {
    NOTIFICATIONS_TOTAL.with_label_values(&[queue]).inc();
}

pub fn record_batch_event(event: &str) {
    BATCH_EVENTS_TOTAL.with_label_values(&[event]).inc();
}

pub fn set_active_workers(scheduler: &str, active: f64) {
    ACTIVE_WORKERS.with_label_values(&[scheduler]).set(active);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should be a no-op");
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_job_enqueued("default", "SendEmail");
        record_execution_finished("SendEmail", "succeeded", 0.02);
        record_cron_fire("nightly", true);
        set_active_workers("*:5", 2.0);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("quay_jobs_enqueued_total"));
        assert!(output.contains("quay_execution_duration_seconds"));
        assert!(output.contains(r#"result="duplicate""#));
        assert!(output.contains("quay_active_workers"));
    }
}
