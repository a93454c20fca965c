use std::collections::BTreeSet;
use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lock::job_lock_key;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl $name {
            /// Create a new id using UUID v7.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

uuid_id!(
    /// Stable external id of a job.
    JobId
);
uuid_id!(
    /// Id of one execution attempt.
    ExecutionId
);
uuid_id!(
    /// Id of a batch.
    BatchId
);
uuid_id!(
    /// Id of a live worker process.
    ProcessId
);

/// Queue used when a job does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Priority stored when a job does not set one.
pub const DEFAULT_PRIORITY: i32 = 0;

/// How an execution ended when it did not simply succeed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorEvent {
    /// The process died while the execution was running.
    Interrupted,
    /// The job raised and nothing rescued or retried it.
    Unhandled,
    /// The job raised and its rescue hook accepted the error.
    Handled,
    /// The job will run again later.
    Retried,
    /// The retry budget ran out.
    RetryStopped,
    /// The job was abandoned and will not run again.
    Discarded,
}

impl ErrorEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorEvent::Interrupted => "interrupted",
            ErrorEvent::Unhandled => "unhandled",
            ErrorEvent::Handled => "handled",
            ErrorEvent::Retried => "retried",
            ErrorEvent::RetryStopped => "retry_stopped",
            ErrorEvent::Discarded => "discarded",
        }
    }
}

impl Display for ErrorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorEvent {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interrupted" => Ok(ErrorEvent::Interrupted),
            "unhandled" => Ok(ErrorEvent::Unhandled),
            "handled" => Ok(ErrorEvent::Handled),
            "retried" => Ok(ErrorEvent::Retried),
            "retry_stopped" => Ok(ErrorEvent::RetryStopped),
            "discarded" => Ok(ErrorEvent::Discarded),
            other => Err(anyhow::anyhow!("invalid error event: {other}")),
        }
    }
}

/// Status of a job derived from its timestamps.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a future `scheduled_at`.
    Scheduled,
    /// Due and waiting for a worker.
    Queued,
    /// Claimed and performing.
    Running,
    /// Failed and waiting for its next attempt.
    Retried,
    /// Finished without error, or with a handled error.
    Succeeded,
    /// Finished with an error.
    Discarded,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Retried => "retried",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Discarded => "discarded",
        }
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(JobStatus::Scheduled),
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "retried" => Ok(JobStatus::Retried),
            "succeeded" => Ok(JobStatus::Succeeded),
            "discarded" => Ok(JobStatus::Discarded),
            other => Err(anyhow::anyhow!("invalid job status: {other}")),
        }
    }
}

/// Which end of the priority range is served first.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityOrder {
    /// Smaller numbers run first.
    #[default]
    SmallerFirst,
    /// Larger numbers run first.
    LargerFirst,
}

impl PriorityOrder {
    /// Ordering between two priorities, where `Less` means `a` runs first.
    pub fn compare(&self, a: i32, b: i32) -> std::cmp::Ordering {
        match self {
            PriorityOrder::SmallerFirst => a.cmp(&b),
            PriorityOrder::LargerFirst => b.cmp(&a),
        }
    }
}

/// A job row: the logical unit of work and the state of its head execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue_name: String,
    pub priority: i32,
    pub job_class: String,
    pub serialized_params: serde_json::Value,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub performed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub error_event: Option<ErrorEvent>,
    pub concurrency_key: Option<String>,
    pub labels: Vec<String>,
    pub cron_key: Option<String>,
    pub cron_at: Option<DateTime<Utc>>,
    pub batch_id: Option<BatchId>,
    pub batch_callback_id: Option<BatchId>,
    pub locked_by_id: Option<ProcessId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub executions_count: i32,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// Advisory lock key of this row.
    pub fn lock_key(&self) -> String {
        job_lock_key(self.id)
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// A previous attempt started and never recorded its end.
    pub fn was_interrupted(&self) -> bool {
        self.performed_at.is_some() && self.finished_at.is_none()
    }

    /// Whether the job may run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|at| at <= now)
    }

    pub fn status(&self, now: DateTime<Utc>) -> JobStatus {
        if self.finished_at.is_some() {
            return if self.error.is_none() || self.error_event == Some(ErrorEvent::Handled) {
                JobStatus::Succeeded
            } else {
                JobStatus::Discarded
            };
        }
        if self.performed_at.is_some() {
            return JobStatus::Running;
        }
        if !self.is_due(now) {
            return if self.error_event == Some(ErrorEvent::Retried) {
                JobStatus::Retried
            } else {
                JobStatus::Scheduled
            };
        }
        JobStatus::Queued
    }
}

/// One attempt to run a job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub job_id: JobId,
    pub job_class: String,
    pub queue_name: String,
    pub serialized_params: serde_json::Value,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub performed_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub error_event: Option<ErrorEvent>,
    pub process_id: Option<ProcessId>,
    pub duration: Option<Duration>,
    /// Execution that replaced this one after a retry.
    pub retried_execution_id: Option<ExecutionId>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Whether this is the current attempt of its job.
    pub fn is_head(&self) -> bool {
        self.retried_execution_id.is_none()
    }
}

/// A job to be inserted.
///
/// Build one from a typed job with [`NewJob::from_job`], or by class name
/// for jobs registered elsewhere.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewJob {
    pub id: JobId,
    pub job_class: String,
    pub serialized_params: serde_json::Value,
    pub queue_name: String,
    pub priority: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub concurrency_key: Option<String>,
    pub labels: BTreeSet<String>,
    pub cron_key: Option<String>,
    pub cron_at: Option<DateTime<Utc>>,
    pub batch_id: Option<BatchId>,
    pub batch_callback_id: Option<BatchId>,
}

impl NewJob {
    /// A job of `job_class` with the given arguments on the default queue.
    pub fn new(job_class: impl Into<String>, serialized_params: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            job_class: job_class.into(),
            serialized_params,
            queue_name: DEFAULT_QUEUE.to_string(),
            priority: None,
            scheduled_at: None,
            concurrency_key: None,
            labels: BTreeSet::new(),
            cron_key: None,
            cron_at: None,
            batch_id: None,
            batch_callback_id: None,
        }
    }

    pub fn queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Run no earlier than `wait` from now.
    pub fn wait(mut self, wait: Duration) -> Self {
        self.scheduled_at = Some(Utc::now() + wait);
        self
    }

    pub fn concurrency_key(mut self, key: impl Into<String>) -> Self {
        self.concurrency_key = Some(key.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    pub fn cron(mut self, key: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.cron_key = Some(key.into());
        self.cron_at = Some(at);
        self
    }

    pub fn batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn batch_callback(mut self, batch_id: BatchId) -> Self {
        self.batch_callback_id = Some(batch_id);
        self
    }

    /// Priority that will be stored for this job.
    pub fn effective_priority(&self) -> i32 {
        self.priority.unwrap_or(DEFAULT_PRIORITY)
    }

    /// Materialize the row this job becomes once inserted at `now`.
    pub fn into_record(self, now: DateTime<Utc>) -> JobRecord {
        let priority = self.effective_priority();
        JobRecord {
            id: self.id,
            queue_name: self.queue_name,
            priority,
            job_class: self.job_class,
            serialized_params: self.serialized_params,
            scheduled_at: self.scheduled_at,
            performed_at: None,
            finished_at: None,
            error: None,
            error_event: None,
            concurrency_key: self.concurrency_key,
            labels: self.labels.into_iter().collect(),
            cron_key: self.cron_key,
            cron_at: self.cron_at,
            batch_id: self.batch_id,
            batch_callback_id: self.batch_callback_id,
            locked_by_id: None,
            locked_at: None,
            executions_count: 0,
            created_at: now,
        }
    }
}
