//! Enqueue side of the system.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::Instrument;

use crate::batch::{Batch, BatchCoordinator, BatchRecord};
use crate::errors::EnqueueError;
use crate::handler::{Job, JobCatalog};
use crate::job::{BatchId, JobRecord, NewJob};
use crate::lock::{concurrency_lock_key, with_blocking_lock};
use crate::notifier::{WakeChannel, WakeHint};
use crate::store::{InsertOutcome, Store};
use crate::throttle::{ConcurrencyConfig, enqueue_violation};

/// What became of one enqueue request.
#[derive(Clone, Debug)]
pub enum EnqueueOutcome {
    Enqueued(JobRecord),
    /// The enqueue-time concurrency guard refused the job.
    Rejected { key: String },
    /// The cron key and fire time were already enqueued.
    Duplicate,
}

impl EnqueueOutcome {
    pub fn is_enqueued(&self) -> bool {
        matches!(self, EnqueueOutcome::Enqueued(_))
    }

    pub fn job(&self) -> Option<&JobRecord> {
        match self {
            EnqueueOutcome::Enqueued(job) => Some(job),
            _ => None,
        }
    }

    /// The inserted job, treating a rejection as an error and a duplicate as nothing.
    pub fn into_job(self) -> Result<Option<JobRecord>, EnqueueError> {
        match self {
            EnqueueOutcome::Enqueued(job) => Ok(Some(job)),
            EnqueueOutcome::Rejected { key } => Err(EnqueueError::ConcurrencyLimit { key }),
            EnqueueOutcome::Duplicate => Ok(None),
        }
    }
}

impl From<InsertOutcome> for EnqueueOutcome {
    fn from(outcome: InsertOutcome) -> Self {
        match outcome {
            InsertOutcome::Inserted(job) => EnqueueOutcome::Enqueued(job),
            InsertOutcome::Duplicate => EnqueueOutcome::Duplicate,
        }
    }
}

/// Object-safe enqueue interface handed to job bodies and callbacks.
#[async_trait]
pub trait Enqueuer: Send + Sync {
    async fn enqueue(&self, job: NewJob) -> anyhow::Result<EnqueueOutcome>;

    /// Insert many jobs at once. Outcomes are in input order.
    async fn enqueue_many(&self, jobs: Vec<NewJob>) -> anyhow::Result<Vec<EnqueueOutcome>>;

    async fn open_batch(&self, batch: Batch) -> anyhow::Result<BatchRecord>;

    /// Add jobs to a batch without closing its membership.
    async fn add_to_batch(
        &self,
        batch_id: BatchId,
        jobs: Vec<NewJob>,
    ) -> anyhow::Result<Vec<EnqueueOutcome>>;

    /// Add jobs, then mark the batch enqueued.
    async fn enqueue_batch(
        &self,
        batch_id: BatchId,
        jobs: Vec<NewJob>,
    ) -> anyhow::Result<Vec<EnqueueOutcome>>;
}

fn validate(job: &NewJob) -> Result<(), EnqueueError> {
    if job.job_class.trim().is_empty() {
        return Err(EnqueueError::EmptyJobClass);
    }
    if job.cron_key.is_some() != job.cron_at.is_some() {
        return Err(EnqueueError::IncompleteCronPair);
    }
    Ok(())
}

#[derive(Default)]
struct QueueHints {
    due: u32,
    earliest_future: Option<DateTime<Utc>>,
}

/// Inserts jobs, applies enqueue-time limits and publishes wake hints.
pub struct Client<St> {
    store: Arc<St>,
    wake: Arc<dyn WakeChannel>,
    catalog: Option<Arc<dyn JobCatalog>>,
    batches: BatchCoordinator<St>,
}

impl<St> Clone for Client<St> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            wake: Arc::clone(&self.wake),
            catalog: self.catalog.clone(),
            batches: self.batches.clone(),
        }
    }
}

impl<St> fmt::Debug for Client<St> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("store_type", &std::any::type_name::<St>())
            .field("catalog_set", &self.catalog.is_some())
            .finish()
    }
}

impl<St: Store> Client<St> {
    pub fn new(store: Arc<St>, wake: Arc<dyn WakeChannel>) -> Self {
        let batches = BatchCoordinator::new(Arc::clone(&store));
        Self {
            store,
            wake,
            catalog: None,
            batches,
        }
    }

    /// Resolve class-level concurrency limits through `catalog`.
    pub fn with_catalog(mut self, catalog: Arc<dyn JobCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn store(&self) -> &Arc<St> {
        &self.store
    }

    pub fn batches(&self) -> &BatchCoordinator<St> {
        &self.batches
    }

    pub async fn enqueue_job<J: Job>(&self, job: &J) -> anyhow::Result<EnqueueOutcome> {
        self.enqueue_one(NewJob::from_job(job)?).await
    }

    async fn enqueue_one(&self, job: NewJob) -> anyhow::Result<EnqueueOutcome> {
        validate(&job)?;
        let span = crate::telemetry::enqueue_span(&job.job_class, &job.queue_name);

        async {
            let outcome = self.insert_guarded(job).await?;
            match &outcome {
                EnqueueOutcome::Enqueued(record) => {
                    crate::telemetry::record_job_enqueued(&record.job_class, &record.queue_name);
                    self.publish(&[record]).await;
                }
                EnqueueOutcome::Rejected { key } => {
                    tracing::debug!(concurrency_key = %key, "enqueue rejected by concurrency limit");
                }
                EnqueueOutcome::Duplicate => {
                    tracing::debug!("cron fire already enqueued");
                }
            }
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    fn enqueue_limits(&self, job: &NewJob) -> Option<(String, ConcurrencyConfig)> {
        let key = job.concurrency_key.as_ref()?;
        let config = self.catalog.as_ref()?.concurrency(&job.job_class)?;
        config.checks_enqueue().then(|| (key.clone(), config))
    }

    async fn insert_guarded(&self, job: NewJob) -> anyhow::Result<EnqueueOutcome> {
        let Some((key, config)) = self.enqueue_limits(&job) else {
            return Ok(self.store.insert_job(job).await?.into());
        };

        let mut session = self.store.session().await?;
        let lock_key = concurrency_lock_key(&key);
        with_blocking_lock(&mut session, &lock_key, move || async move {
            if let Some(kind) =
                enqueue_violation(self.store.as_ref(), &key, &config, Utc::now()).await?
            {
                crate::telemetry::record_concurrency_rejected(&key, kind.as_str());
                return Ok(EnqueueOutcome::Rejected { key });
            }
            Ok(self.store.insert_job(job).await?.into())
        })
        .await
    }

    async fn enqueue_all(&self, jobs: Vec<NewJob>) -> anyhow::Result<Vec<EnqueueOutcome>> {
        for job in &jobs {
            validate(job)?;
        }

        let mut outcomes: Vec<Option<EnqueueOutcome>> = vec![None; jobs.len()];
        let mut plain = Vec::new();
        let mut plain_slots = Vec::new();
        for (slot, job) in jobs.into_iter().enumerate() {
            if self.enqueue_limits(&job).is_some() {
                outcomes[slot] = Some(self.insert_guarded(job).await?);
            } else {
                plain_slots.push(slot);
                plain.push(job);
            }
        }

        if !plain.is_empty() {
            let inserted = self.store.insert_jobs(plain).await?;
            if inserted.len() != plain_slots.len() {
                anyhow::bail!(
                    "bulk insert returned {} outcomes for {} jobs",
                    inserted.len(),
                    plain_slots.len()
                );
            }
            for (slot, outcome) in plain_slots.into_iter().zip(inserted) {
                outcomes[slot] = Some(outcome.into());
            }
        }

        let outcomes: Vec<EnqueueOutcome> = outcomes.into_iter().flatten().collect();
        let records: Vec<&JobRecord> = outcomes.iter().filter_map(EnqueueOutcome::job).collect();
        for record in &records {
            crate::telemetry::record_job_enqueued(&record.job_class, &record.queue_name);
        }
        self.publish(&records).await;
        Ok(outcomes)
    }

    /// Publish one hint per queue for due work and one for the earliest future job.
    async fn publish(&self, records: &[&JobRecord]) {
        let now = Utc::now();
        let mut queues: BTreeMap<&str, QueueHints> = BTreeMap::new();
        for record in records {
            let entry = queues.entry(record.queue_name.as_str()).or_default();
            match record.scheduled_at {
                Some(at) if at > now => {
                    entry.earliest_future = Some(entry.earliest_future.map_or(at, |e| e.min(at)));
                }
                _ => entry.due += 1,
            }
        }

        for (queue_name, hints) in queues {
            let mut outgoing = Vec::with_capacity(2);
            if hints.due > 0 {
                outgoing.push(WakeHint::queue(queue_name).with_count(hints.due));
            }
            if let Some(at) = hints.earliest_future {
                outgoing.push(WakeHint::queue(queue_name).with_scheduled_at(Some(at)));
            }
            for hint in outgoing {
                if let Err(err) = self.wake.publish(&hint).await {
                    tracing::warn!("failed to publish wake hint for {queue_name}: {err}");
                }
            }
        }
    }
}

#[async_trait]
impl<St: Store> Enqueuer for Client<St> {
    async fn enqueue(&self, job: NewJob) -> anyhow::Result<EnqueueOutcome> {
        self.enqueue_one(job).await
    }

    async fn enqueue_many(&self, jobs: Vec<NewJob>) -> anyhow::Result<Vec<EnqueueOutcome>> {
        self.enqueue_all(jobs).await
    }

    async fn open_batch(&self, batch: Batch) -> anyhow::Result<BatchRecord> {
        self.batches.open(batch).await
    }

    async fn add_to_batch(
        &self,
        batch_id: BatchId,
        jobs: Vec<NewJob>,
    ) -> anyhow::Result<Vec<EnqueueOutcome>> {
        if self.batches.find(batch_id).await?.is_none() {
            anyhow::bail!("batch {batch_id} does not exist");
        }
        let jobs = jobs
            .into_iter()
            .map(|job| NewJob {
                batch_id: Some(batch_id),
                batch_callback_id: None,
                ..job
            })
            .collect();
        self.enqueue_all(jobs).await
    }

    async fn enqueue_batch(
        &self,
        batch_id: BatchId,
        jobs: Vec<NewJob>,
    ) -> anyhow::Result<Vec<EnqueueOutcome>> {
        let outcomes = self.add_to_batch(batch_id, jobs).await?;
        self.batches.mark_enqueued(batch_id, self).await?;
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_incomplete_cron_pair() {
        let mut job = NewJob::new("Nightly", serde_json::json!({}));
        job.cron_key = Some("nightly".into());
        assert!(matches!(validate(&job), Err(EnqueueError::IncompleteCronPair)));

        job.cron_at = Some(Utc::now());
        assert!(validate(&job).is_ok());

        let empty = NewJob::new(" ", serde_json::json!({}));
        assert!(matches!(validate(&empty), Err(EnqueueError::EmptyJobClass)));
    }

    #[test]
    fn test_outcome_into_job() {
        let record = NewJob::new("Example", serde_json::json!({})).into_record(Utc::now());
        let id = record.id;
        assert_eq!(
            EnqueueOutcome::Enqueued(record).into_job().unwrap().map(|j| j.id),
            Some(id)
        );
        assert!(EnqueueOutcome::Duplicate.into_job().unwrap().is_none());
        assert!(matches!(
            EnqueueOutcome::Rejected { key: "k".into() }.into_job(),
            Err(EnqueueError::ConcurrencyLimit { key }) if key == "k"
        ));
    }
}
