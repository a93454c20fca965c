//! Typed jobs and the dispatch table that runs them.
//!
//! A job type implements [`Job`] and is registered by name in a
//! [`JobRegistry`] when the runtime is assembled. Workers only ever see
//! stored rows; the registry turns a row's `job_class` back into a typed
//! value and runs it with an explicit [`ExecutionContext`].

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::client::{EnqueueOutcome, Enqueuer};
use crate::errors::{EnqueueError, JobError};
use crate::job::{BatchId, DEFAULT_QUEUE, ExecutionRecord, JobId, JobRecord, NewJob};
use crate::retry::RetryPolicy;
use crate::throttle::ConcurrencyConfig;

/// A unit of work that can be stored and executed later.
///
/// The value itself is the job's arguments: it is serialized on enqueue and
/// deserialized again by the worker that claims it.
#[async_trait]
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Class name stored on the row. Must be unique within a registry.
    const NAME: &'static str;

    /// Application state handed to every execution.
    type Context: Clone + Send + Sync + 'static;

    async fn perform(&self, ctx: &ExecutionContext<Self::Context>) -> anyhow::Result<()>;

    fn queue() -> &'static str {
        DEFAULT_QUEUE
    }

    fn priority() -> Option<i32> {
        None
    }

    fn retry_policy() -> RetryPolicy {
        RetryPolicy::none()
    }

    /// Limits applied to jobs sharing a concurrency key.
    fn concurrency() -> Option<ConcurrencyConfig> {
        None
    }

    /// Concurrency key for this instance. Defaults to the class name when
    /// [`Job::concurrency`] is configured.
    fn concurrency_key(&self) -> Option<String> {
        None
    }

    fn labels(&self) -> Vec<String> {
        Vec::new()
    }

    /// Return true to record `error` as handled instead of unhandled.
    fn rescue(&self, _error: &anyhow::Error) -> bool {
        false
    }
}

impl NewJob {
    /// Build an insertable job from a typed job and its class defaults.
    pub fn from_job<J: Job>(job: &J) -> Result<Self, EnqueueError> {
        let params = serde_json::to_value(job)?;
        let mut new_job = NewJob::new(J::NAME, params).queue(J::queue());
        if let Some(priority) = J::priority() {
            new_job = new_job.priority(priority);
        }
        new_job.concurrency_key = job
            .concurrency_key()
            .or_else(|| J::concurrency().map(|_| J::NAME.to_string()));
        new_job.labels.extend(job.labels());
        Ok(new_job)
    }
}

/// Everything a job body can see about the attempt it is running.
pub struct ExecutionContext<C> {
    app: C,
    job: JobRecord,
    execution: ExecutionRecord,
    enqueuer: Arc<dyn Enqueuer>,
}

impl<C> fmt::Debug for ExecutionContext<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("app_type", &type_name::<C>())
            .field("job_id", &self.job.id)
            .field("execution_id", &self.execution.id)
            .field("job_class", &self.job.job_class)
            .finish()
    }
}

impl<C> ExecutionContext<C> {
    pub fn new(
        app: C,
        job: JobRecord,
        execution: ExecutionRecord,
        enqueuer: Arc<dyn Enqueuer>,
    ) -> Self {
        Self {
            app,
            job,
            execution,
            enqueuer,
        }
    }

    pub fn app(&self) -> &C {
        &self.app
    }

    pub fn job(&self) -> &JobRecord {
        &self.job
    }

    pub fn execution(&self) -> &ExecutionRecord {
        &self.execution
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        u32::try_from(self.job.executions_count.max(1)).unwrap_or(u32::MAX)
    }

    /// Schedule key and fire time when the job was produced by cron.
    pub fn cron(&self) -> Option<(&str, DateTime<Utc>)> {
        match (&self.job.cron_key, self.job.cron_at) {
            (Some(key), Some(at)) => Some((key.as_str(), at)),
            _ => None,
        }
    }

    pub fn batch_id(&self) -> Option<BatchId> {
        self.job.batch_id
    }

    pub fn batch_callback_id(&self) -> Option<BatchId> {
        self.job.batch_callback_id
    }

    /// Error left by the previous attempt, if this is a retry.
    pub fn previous_error(&self) -> Option<&str> {
        self.job.error.as_deref()
    }

    /// The unscoped enqueuer, for opening new batches.
    pub fn enqueuer(&self) -> &Arc<dyn Enqueuer> {
        &self.enqueuer
    }

    /// Enqueue a follow-up job. Inside a batch member the job joins the
    /// same batch unless it names one itself.
    pub async fn enqueue(&self, job: NewJob) -> anyhow::Result<EnqueueOutcome> {
        self.enqueuer.enqueue(self.scope(job)).await
    }

    pub async fn enqueue_job<J: Job>(&self, job: &J) -> anyhow::Result<EnqueueOutcome> {
        self.enqueue(NewJob::from_job(job)?).await
    }

    fn scope(&self, mut job: NewJob) -> NewJob {
        if job.batch_id.is_none() && job.batch_callback_id.is_none() {
            job.batch_id = self.job.batch_id;
        }
        job
    }
}

/// Outcome of running a job body once.
#[derive(Debug)]
pub struct JobRun {
    pub result: anyhow::Result<()>,
    /// The job's rescue hook accepted the error.
    pub rescued: bool,
}

/// Type-erased entry of the dispatch table.
#[async_trait]
pub trait JobHandler<C>: Send + Sync {
    fn job_class(&self) -> &'static str;

    fn retry_policy(&self) -> RetryPolicy;

    fn concurrency(&self) -> Option<ConcurrencyConfig>;

    async fn run(&self, ctx: &ExecutionContext<C>) -> JobRun;
}

struct TypedHandler<J>(PhantomData<fn() -> J>);

#[async_trait]
impl<J: Job> JobHandler<J::Context> for TypedHandler<J> {
    fn job_class(&self) -> &'static str {
        J::NAME
    }

    fn retry_policy(&self) -> RetryPolicy {
        J::retry_policy()
    }

    fn concurrency(&self) -> Option<ConcurrencyConfig> {
        J::concurrency()
    }

    async fn run(&self, ctx: &ExecutionContext<J::Context>) -> JobRun {
        let job: J = match serde_json::from_value(ctx.job().serialized_params.clone()) {
            Ok(job) => job,
            Err(err) => {
                return JobRun {
                    result: Err(anyhow::Error::new(err)
                        .context(format!("failed to deserialize {} arguments", J::NAME))),
                    rescued: false,
                };
            }
        };

        let result = match AssertUnwindSafe(job.perform(ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(JobError::Panicked(panic_message(panic.as_ref())).into()),
        };
        let rescued = match &result {
            Err(err) => job.rescue(err),
            Ok(()) => false,
        };
        JobRun { result, rescued }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Class-level job metadata needed without an application context.
pub trait JobCatalog: Send + Sync {
    fn concurrency(&self, job_class: &str) -> Option<ConcurrencyConfig>;
}

/// Dispatch table from class name to handler, built once at startup.
pub struct JobRegistry<C> {
    handlers: HashMap<&'static str, Arc<dyn JobHandler<C>>>,
}

impl<C> fmt::Debug for JobRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut classes: Vec<_> = self.handlers.keys().collect();
        classes.sort();
        f.debug_struct("JobRegistry")
            .field("context_type", &type_name::<C>())
            .field("classes", &classes)
            .finish()
    }
}

impl<C> Default for JobRegistry<C> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<C: Clone + Send + Sync + 'static> JobRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `J` under [`Job::NAME`]. A later registration of the same
    /// name replaces the earlier one.
    pub fn register<J: Job<Context = C>>(mut self) -> Self {
        let handler: Arc<dyn JobHandler<C>> = Arc::new(TypedHandler::<J>(PhantomData));
        if self.handlers.insert(J::NAME, handler).is_some() {
            tracing::warn!("job class {} registered twice; keeping the last", J::NAME);
        }
        self
    }

    pub fn get(&self, job_class: &str) -> Option<Arc<dyn JobHandler<C>>> {
        self.handlers.get(job_class).cloned()
    }

    pub fn contains(&self, job_class: &str) -> bool {
        self.handlers.contains_key(job_class)
    }

    pub fn classes(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<C: Clone + Send + Sync + 'static> JobCatalog for JobRegistry<C> {
    fn concurrency(&self, job_class: &str) -> Option<ConcurrencyConfig> {
        self.handlers
            .get(job_class)
            .and_then(|handler| handler.concurrency())
    }
}
