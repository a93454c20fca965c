//! Claim one job and run it to a recorded finish.
//!
//! A [`Performer`] serves one queue group. Each call to
//! [`Performer::perform_next`] opens a lock session, claims the best due job,
//! recovers a crashed previous attempt if there was one, runs the body
//! through the dispatch table, classifies the outcome and persists it before
//! the row lock is released.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::Instrument;

use crate::batch::BatchCoordinator;
use crate::cleanup::{Cleaner, RetentionPolicy};
use crate::client::{Client, Enqueuer};
use crate::errors::{ErrorSink, JobError, format_error};
use crate::handler::{ExecutionContext, JobRegistry, JobRun};
use crate::job::{ErrorEvent, ExecutionId, JobId, JobRecord, PriorityOrder, ProcessId};
use crate::lock::LockSession;
use crate::notifier::WakeHint;
use crate::queue::QueueFilter;
use crate::retry::{AttemptCount, Disposition, RetryPolicy, classify};
use crate::store::{BeginExecution, ClaimRequest, FinishExecution, Store};
use crate::throttle::admit_perform;

/// Result of one claim attempt.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// Nothing was due.
    Empty,
    /// The claimed row had finished, vanished or stopped being due by the
    /// time its lock was held; the lock was released untouched.
    Unexecutable(JobId),
    Executed(ExecutionResult),
}

impl ClaimOutcome {
    pub fn is_empty(&self) -> bool {
        matches!(self, ClaimOutcome::Empty)
    }
}

/// What one attempt did.
#[derive(Clone, Debug)]
pub struct ExecutionResult {
    pub job_id: JobId,
    pub job_class: String,
    pub error: Option<String>,
    pub error_event: Option<ErrorEvent>,
    /// The error was dealt with: rescued or discarded.
    pub handled: bool,
    /// The error ended the job without anything handling it.
    pub unhandled: bool,
    /// When the job runs again, if it was retried.
    pub retried_at: Option<DateTime<Utc>>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

pub struct Performer<St, C> {
    store: Arc<St>,
    registry: Arc<JobRegistry<C>>,
    app: C,
    enqueuer: Arc<dyn Enqueuer>,
    batches: BatchCoordinator<St>,
    filter: QueueFilter,
    order: PriorityOrder,
    select_limit: Option<usize>,
    process_id: Option<ProcessId>,
    retention: RetentionPolicy,
    cleaner: Option<Arc<Cleaner<St>>>,
    errors: ErrorSink,
}

impl<St, C> std::fmt::Debug for Performer<St, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Performer")
            .field("filter", &self.filter)
            .field("order", &self.order)
            .field("select_limit", &self.select_limit)
            .field("process_id", &self.process_id)
            .field("retention", &self.retention)
            .finish()
    }
}

impl<St: Store, C: Clone + Send + Sync + 'static> Performer<St, C> {
    pub fn new(
        client: Client<St>,
        registry: Arc<JobRegistry<C>>,
        app: C,
        filter: QueueFilter,
    ) -> Self {
        Self {
            store: Arc::clone(client.store()),
            batches: client.batches().clone(),
            enqueuer: Arc::new(client),
            registry,
            app,
            filter,
            order: PriorityOrder::default(),
            select_limit: None,
            process_id: None,
            retention: RetentionPolicy::default(),
            cleaner: None,
            errors: ErrorSink::default(),
        }
    }

    pub fn with_order(mut self, order: PriorityOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_select_limit(mut self, select_limit: Option<usize>) -> Self {
        self.select_limit = select_limit;
        self
    }

    pub fn with_process_id(mut self, process_id: ProcessId) -> Self {
        self.process_id = Some(process_id);
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_cleaner(mut self, cleaner: Arc<Cleaner<St>>) -> Self {
        self.cleaner = Some(cleaner);
        self
    }

    pub fn with_error_sink(mut self, errors: ErrorSink) -> Self {
        self.errors = errors;
        self
    }

    pub fn filter(&self) -> &QueueFilter {
        &self.filter
    }

    /// Whether a hint concerns this performer's queues.
    pub fn next_hint_matches(&self, hint: Option<&WakeHint>) -> bool {
        match hint.and_then(|hint| hint.queue_name.as_deref()) {
            Some(queue_name) => self.filter.matches(queue_name),
            None => true,
        }
    }

    /// Scheduled times of upcoming jobs this performer will serve.
    pub async fn upcoming(&self, limit: usize) -> anyhow::Result<Vec<DateTime<Utc>>> {
        self.store
            .upcoming_scheduled(&self.filter, Utc::now(), limit)
            .await
    }

    /// Claim and run the next due job.
    pub async fn perform_next(&self) -> anyhow::Result<ClaimOutcome> {
        let mut session = self.store.session().await?;
        let request = ClaimRequest::new(self.filter.clone(), self.order)
            .with_select_limit(self.select_limit);

        let claimed = self
            .store
            .claim(&mut session, &request)
            .instrument(crate::telemetry::claim_span(&self.filter))
            .await?;
        let Some(job) = claimed.into_iter().next() else {
            return Ok(ClaimOutcome::Empty);
        };

        let lock_key = job.lock_key();
        let outcome = match self.reload_claimed(job.id).await {
            Ok(Some(job)) => self.execute(&mut session, job).await,
            Ok(None) => Ok(ClaimOutcome::Unexecutable(job.id)),
            Err(err) => Err(err),
        };

        // Release even when execution failed; the row must not stay locked.
        let released = session.unlock(&lock_key).await;
        let outcome = outcome?;
        if !released? {
            tracing::warn!("job lock {lock_key} was not held at release");
        }
        Ok(outcome)
    }

    /// Read the claimed row again now that its lock is held.
    ///
    /// The candidate was selected before the lock was taken, so another
    /// worker may have finished, deleted or rescheduled it in between.
    async fn reload_claimed(&self, id: JobId) -> anyhow::Result<Option<JobRecord>> {
        match self.store.find_job(id).await? {
            None => {
                tracing::debug!(job_id = %id, "claimed job no longer exists");
                Ok(None)
            }
            Some(job) if job.is_finished() => {
                tracing::debug!(job_id = %id, "claimed job already finished");
                Ok(None)
            }
            Some(job) if !job.is_due(Utc::now()) => {
                tracing::debug!(job_id = %id, "claimed job is no longer due");
                Ok(None)
            }
            Some(job) => Ok(Some(job)),
        }
    }

    async fn execute(
        &self,
        session: &mut St::Session,
        mut job: JobRecord,
    ) -> anyhow::Result<ClaimOutcome> {
        if job.was_interrupted() {
            let message = format_error(&JobError::Interrupted.into());
            job = self
                .store
                .interrupt_execution(job.id, &message, Utc::now())
                .await?;
            tracing::warn!(job_id = %job.id, job_class = %job.job_class, "recovered interrupted execution");
        }

        let (job, execution) = self
            .store
            .begin_execution(BeginExecution {
                job_id: job.id,
                execution_id: ExecutionId::new(),
                process_id: self.process_id,
                performed_at: Utc::now(),
            })
            .await?;
        let attempt = u32::try_from(job.executions_count.max(1)).unwrap_or(1);
        let span = crate::telemetry::perform_span(&job.job_class, job.id, attempt);

        async {
            let started = Instant::now();
            let (run, policy) = match self.registry.get(&job.job_class) {
                None => (
                    JobRun {
                        result: Err(JobError::UnknownJobClass(job.job_class.clone()).into()),
                        rescued: false,
                    },
                    RetryPolicy::none(),
                ),
                Some(handler) => {
                    let rejection = match (handler.concurrency(), job.concurrency_key.as_deref()) {
                        (Some(config), Some(key)) => {
                            admit_perform(self.store.as_ref(), session, key, &config, Utc::now())
                                .await?
                        }
                        _ => None,
                    };
                    let run = match rejection {
                        Some(rejection) => JobRun {
                            result: Err(rejection.into()),
                            rescued: false,
                        },
                        None => {
                            let ctx = ExecutionContext::new(
                                self.app.clone(),
                                job.clone(),
                                execution.clone(),
                                Arc::clone(&self.enqueuer),
                            );
                            handler.run(&ctx).await
                        }
                    };
                    (run, handler.retry_policy())
                }
            };

            let elapsed = started.elapsed();
            let finished_at = Utc::now();
            let (error, disposition) = match &run.result {
                Ok(()) => (None, None),
                Err(err) => {
                    let executions = self.store.executions(job.id).await?;
                    let count = AttemptCount::from_executions(&executions, execution.id);
                    (
                        Some(format_error(err)),
                        Some(classify(err, count, &policy, run.rescued, finished_at)),
                    )
                }
            };
            let retried_at = match disposition {
                Some(Disposition::Retry { at }) => Some(at),
                _ => None,
            };
            let error_event = disposition.as_ref().map(Disposition::error_event);

            let finished = self
                .store
                .finish_execution(FinishExecution {
                    job_id: job.id,
                    execution_id: execution.id,
                    finished_at,
                    duration: chrono::Duration::from_std(elapsed)
                        .unwrap_or(chrono::Duration::zero()),
                    error: error.clone(),
                    error_event,
                    retry_at: retried_at,
                })
                .await?;

            crate::telemetry::record_execution_finished(&job.job_class, error_event, elapsed);
            match (&error, error_event) {
                (None, _) => tracing::info!(job_id = %job.id, "job succeeded"),
                (Some(error), Some(ErrorEvent::Retried)) => {
                    tracing::info!(job_id = %job.id, retried_at = ?retried_at, "job will retry: {error}")
                }
                (Some(error), event) => tracing::warn!(
                    job_id = %job.id,
                    error_event = event.map(|e| e.as_str()),
                    "job failed: {error}"
                ),
            }

            self.after_finish(&finished).await;

            Ok(ClaimOutcome::Executed(ExecutionResult {
                job_id: job.id,
                job_class: job.job_class.clone(),
                error,
                error_event,
                handled: matches!(
                    error_event,
                    Some(ErrorEvent::Handled | ErrorEvent::Discarded)
                ),
                unhandled: matches!(
                    error_event,
                    Some(ErrorEvent::Unhandled | ErrorEvent::RetryStopped)
                ),
                retried_at,
            }))
        }
        .instrument(span)
        .await
    }

    /// Batch bookkeeping and retention for a persisted finish. Failures here
    /// do not undo the finish, so they go to the error sink.
    async fn after_finish(&self, job: &JobRecord) {
        if let Err(err) = self
            .batches
            .after_execution(job, self.enqueuer.as_ref())
            .await
        {
            self.errors.report(&err, "batch");
        }

        if self.retention.should_delete(job) {
            match self.store.delete_job(job.id).await {
                Ok(_) => tracing::debug!(job_id = %job.id, "deleted finished job"),
                Err(err) => self.errors.report(&err, "retention"),
            }
        }

        if let Some(cleaner) = &self.cleaner {
            cleaner.record_execution();
        }
    }
}
