//! Storage traits.
//!
//! Every backend implements the four traits below. The Postgres backend
//! lives in `persistence::postgres`; the in-memory one ships in the testkit.
//! Row-level exclusivity is provided by the backend's [`LockSession`], and
//! the claim operation takes the job locks on the caller's session.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::{BatchRecord, BatchTransition};
use crate::job::{
    BatchId, ErrorEvent, ExecutionId, ExecutionRecord, JobId, JobRecord, NewJob, PriorityOrder,
    ProcessId,
};
use crate::lock::LockSession;
use crate::process::ProcessRecord;
use crate::queue::{QueueFilter, QueueSnapshot};

/// Parameters of one dequeue call.
#[derive(Clone, Debug)]
pub struct ClaimRequest {
    pub filter: QueueFilter,
    pub order: PriorityOrder,
    /// Rows to lock and return.
    pub limit: usize,
    /// Candidate rows considered before locking. `None` considers all.
    pub select_limit: Option<usize>,
    pub now: DateTime<Utc>,
}

impl ClaimRequest {
    pub fn new(filter: QueueFilter, order: PriorityOrder) -> Self {
        Self {
            filter,
            order,
            limit: 1,
            select_limit: None,
            now: Utc::now(),
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_select_limit(mut self, select_limit: Option<usize>) -> Self {
        self.select_limit = select_limit;
        self
    }
}

/// Result of inserting one job.
#[derive(Clone, Debug)]
pub enum InsertOutcome {
    Inserted(JobRecord),
    /// A job with the same cron key and fire time already exists.
    Duplicate,
}

/// Start of an attempt on a claimed job.
#[derive(Clone, Debug)]
pub struct BeginExecution {
    pub job_id: JobId,
    pub execution_id: ExecutionId,
    pub process_id: Option<ProcessId>,
    pub performed_at: DateTime<Utc>,
}

/// End of an attempt.
#[derive(Clone, Debug)]
pub struct FinishExecution {
    pub job_id: JobId,
    pub execution_id: ExecutionId,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub error: Option<String>,
    pub error_event: Option<ErrorEvent>,
    /// Set when the job runs again: the job row is rescheduled instead of finished.
    pub retry_at: Option<DateTime<Utc>>,
}

/// Rows counted by the concurrency guard for one key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConcurrencyCount {
    /// Unfinished jobs.
    Unfinished,
    /// Unfinished jobs that no process is performing.
    Enqueued,
    /// Unfinished jobs a process is performing.
    Performing,
    /// Jobs created at or after the instant.
    CreatedSince(DateTime<Utc>),
    /// Executions started at or after the instant, rejected attempts excluded.
    PerformedSince(DateTime<Utc>),
}

/// Which finished jobs a purge removes.
#[derive(Clone, Copy, Debug)]
pub struct PurgeRequest {
    pub finished_before: DateTime<Utc>,
    /// Also purge jobs that finished with an error.
    pub include_discarded: bool,
    pub limit: usize,
}

/// Counts removed by one purge call.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PurgeStats {
    pub jobs: u64,
    pub executions: u64,
    pub batches: u64,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    type Session: LockSession + Send + 'static;

    /// Open a new lock session (a dedicated connection for Postgres).
    async fn session(&self) -> anyhow::Result<Self::Session>;

    async fn insert_job(&self, job: NewJob) -> anyhow::Result<InsertOutcome>;

    /// Insert many jobs in one round trip; cron duplicates are skipped.
    async fn insert_jobs(&self, jobs: Vec<NewJob>) -> anyhow::Result<Vec<InsertOutcome>>;

    async fn find_job(&self, id: JobId) -> anyhow::Result<Option<JobRecord>>;

    /// Lock and return up to `request.limit` due, unfinished, unpaused jobs
    /// on `session`, in dequeue order. Returned rows are locked on the
    /// session; every other candidate stays unlocked.
    async fn claim(
        &self,
        session: &mut Self::Session,
        request: &ClaimRequest,
    ) -> anyhow::Result<Vec<JobRecord>>;

    /// Create the execution row of a new attempt and mark the job performed.
    /// The previous head execution gets its forward pointer.
    async fn begin_execution(
        &self,
        begin: BeginExecution,
    ) -> anyhow::Result<(JobRecord, ExecutionRecord)>;

    /// Finish the head execution of a job whose process died mid-attempt.
    async fn interrupt_execution(
        &self,
        job_id: JobId,
        error: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<JobRecord>;

    async fn finish_execution(&self, finish: FinishExecution) -> anyhow::Result<JobRecord>;

    /// Attempts of a job, oldest first.
    async fn executions(&self, job_id: JobId) -> anyhow::Result<Vec<ExecutionRecord>>;

    /// Delete a job and its executions.
    async fn delete_job(&self, job_id: JobId) -> anyhow::Result<bool>;

    async fn count_concurrency(&self, key: &str, count: ConcurrencyCount) -> anyhow::Result<u64>;

    /// Scheduled times of upcoming jobs matching `filter`, soonest first.
    async fn upcoming_scheduled(
        &self,
        filter: &QueueFilter,
        after: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<DateTime<Utc>>>;

    async fn queue_snapshot(&self, now: DateTime<Utc>) -> anyhow::Result<QueueSnapshot>;

    /// Delete finished jobs matching the request, skipping members of
    /// batches that have not finished.
    async fn purge_finished(&self, request: PurgeRequest) -> anyhow::Result<PurgeStats>;
}

#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn insert_batch(&self, batch: BatchRecord) -> anyhow::Result<BatchRecord>;

    async fn find_batch(&self, id: BatchId) -> anyhow::Result<Option<BatchRecord>>;

    async fn save_batch_properties(
        &self,
        id: BatchId,
        properties: serde_json::Value,
    ) -> anyhow::Result<()>;

    /// Set one of the batch timestamps if it is still unset. Returns whether
    /// this call made the change.
    async fn transition_batch(
        &self,
        id: BatchId,
        transition: BatchTransition,
        at: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    async fn count_unfinished_in_batch(&self, id: BatchId) -> anyhow::Result<u64>;

    async fn batch_jobs(&self, id: BatchId) -> anyhow::Result<Vec<JobRecord>>;

    /// Delete finished batches older than `finished_before` that have no jobs left.
    async fn purge_batches(&self, finished_before: DateTime<Utc>) -> anyhow::Result<u64>;
}

#[async_trait]
pub trait ProcessStore: Send + Sync {
    async fn register_process(&self, process: ProcessRecord) -> anyhow::Result<()>;

    /// Refresh the heartbeat. Returns false if the row no longer exists.
    async fn heartbeat(&self, id: ProcessId, at: DateTime<Utc>) -> anyhow::Result<bool>;

    async fn deregister_process(&self, id: ProcessId) -> anyhow::Result<()>;

    async fn list_processes(&self) -> anyhow::Result<Vec<ProcessRecord>>;

    /// Delete rows whose heartbeat is older than `before`.
    async fn delete_stale_processes(&self, before: DateTime<Utc>) -> anyhow::Result<u64>;
}

#[async_trait]
pub trait SettingStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>>;

    async fn put_setting(&self, key: &str, value: serde_json::Value) -> anyhow::Result<()>;

    async fn delete_setting(&self, key: &str) -> anyhow::Result<bool>;
}

/// A complete backend.
pub trait Store: JobStore + BatchStore + ProcessStore + SettingStore + 'static {}

impl<T> Store for T where T: JobStore + BatchStore + ProcessStore + SettingStore + 'static {}
