//! Job groups with completion callbacks.
//!
//! A batch is open while jobs are being added to it and becomes enqueued
//! once its builder declares the membership complete. After any member
//! finishes, the coordinator re-checks the batch under the batch lock:
//! an unrecovered member error marks it discarded, and zero unfinished
//! members after enqueue marks it finished. Each transition is a
//! conditional update, so one callback job is enqueued per event no matter
//! how many members finish at once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::client::Enqueuer;
use crate::handler::Job;
use crate::job::{BatchId, ErrorEvent, JobRecord, NewJob};
use crate::lock::{batch_lock_key, with_blocking_lock};
use crate::store::{BatchStore, JobStore};

/// Batch events that can trigger a callback job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchEvent {
    /// A member finished with an unrecovered error.
    Discard,
    /// Every member finished and none was discarded.
    Success,
    /// Every member finished.
    Finish,
}

impl BatchEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchEvent::Discard => "discard",
            BatchEvent::Success => "success",
            BatchEvent::Finish => "finish",
        }
    }
}

/// Arguments every batch callback job receives.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BatchCallbackArgs {
    pub batch_id: BatchId,
    pub event: BatchEvent,
}

/// Which batch timestamp a transition sets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BatchTransition {
    Enqueued,
    Discarded,
    Finished,
}

/// A stored batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: BatchId,
    pub description: Option<String>,
    pub serialized_properties: serde_json::Value,
    pub on_finish: Option<String>,
    pub on_success: Option<String>,
    pub on_discard: Option<String>,
    pub callback_queue_name: Option<String>,
    pub callback_priority: Option<i32>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub discarded_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl BatchRecord {
    pub fn is_enqueued(&self) -> bool {
        self.enqueued_at.is_some()
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded_at.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Registered job class to run for `event`.
    pub fn callback_for(&self, event: BatchEvent) -> Option<&str> {
        match event {
            BatchEvent::Discard => self.on_discard.as_deref(),
            BatchEvent::Success => self.on_success.as_deref(),
            BatchEvent::Finish => self.on_finish.as_deref(),
        }
    }

    pub fn apply(&mut self, transition: BatchTransition, at: DateTime<Utc>) -> bool {
        let slot = match transition {
            BatchTransition::Enqueued => &mut self.enqueued_at,
            BatchTransition::Discarded => &mut self.discarded_at,
            BatchTransition::Finished => &mut self.finished_at,
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(at);
        true
    }
}

/// Builder for a new batch.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    description: Option<String>,
    properties: serde_json::Map<String, serde_json::Value>,
    on_finish: Option<String>,
    on_success: Option<String>,
    on_discard: Option<String>,
    callback_queue: Option<String>,
    callback_priority: Option<i32>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Group-level value readable by callbacks through the batch record.
    pub fn property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Run `J` once every member has finished.
    pub fn on_finish<J: Job>(self) -> Self {
        self.on_finish_class(J::NAME)
    }

    /// Run `J` once every member has finished, if none was discarded.
    pub fn on_success<J: Job>(self) -> Self {
        self.on_success_class(J::NAME)
    }

    /// Run `J` the first time a member finishes with an unrecovered error.
    pub fn on_discard<J: Job>(self) -> Self {
        self.on_discard_class(J::NAME)
    }

    pub fn on_finish_class(mut self, job_class: impl Into<String>) -> Self {
        self.on_finish = Some(job_class.into());
        self
    }

    pub fn on_success_class(mut self, job_class: impl Into<String>) -> Self {
        self.on_success = Some(job_class.into());
        self
    }

    pub fn on_discard_class(mut self, job_class: impl Into<String>) -> Self {
        self.on_discard = Some(job_class.into());
        self
    }

    pub fn callback_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.callback_queue = Some(queue_name.into());
        self
    }

    pub fn callback_priority(mut self, priority: i32) -> Self {
        self.callback_priority = Some(priority);
        self
    }

    pub fn into_record(self, now: DateTime<Utc>) -> BatchRecord {
        BatchRecord {
            id: BatchId::new(),
            description: self.description,
            serialized_properties: serde_json::Value::Object(self.properties),
            on_finish: self.on_finish,
            on_success: self.on_success,
            on_discard: self.on_discard,
            callback_queue_name: self.callback_queue,
            callback_priority: self.callback_priority,
            enqueued_at: None,
            discarded_at: None,
            finished_at: None,
            created_at: now,
        }
    }
}

/// Whether a finished member counts against its batch.
pub fn member_failed(job: &JobRecord) -> bool {
    job.is_finished() && job.error.is_some() && job.error_event != Some(ErrorEvent::Handled)
}

/// Runs the batch state machine against a store.
#[derive(Debug)]
pub struct BatchCoordinator<St> {
    store: Arc<St>,
}

impl<St> Clone for BatchCoordinator<St> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<St: JobStore + BatchStore> BatchCoordinator<St> {
    pub fn new(store: Arc<St>) -> Self {
        Self { store }
    }

    pub async fn open(&self, batch: Batch) -> anyhow::Result<BatchRecord> {
        let record = self.store.insert_batch(batch.into_record(Utc::now())).await?;
        tracing::debug!(batch_id = %record.id, "batch opened");
        Ok(record)
    }

    pub async fn find(&self, id: BatchId) -> anyhow::Result<Option<BatchRecord>> {
        self.store.find_batch(id).await
    }

    /// Replace the batch properties.
    pub async fn update_properties(
        &self,
        id: BatchId,
        properties: serde_json::Value,
    ) -> anyhow::Result<()> {
        self.store.save_batch_properties(id, properties).await
    }

    /// Close membership. A batch with no unfinished members finishes now.
    pub async fn mark_enqueued(&self, id: BatchId, enqueuer: &dyn Enqueuer) -> anyhow::Result<()> {
        let now = Utc::now();
        if !self
            .store
            .transition_batch(id, BatchTransition::Enqueued, now)
            .await?
        {
            tracing::debug!(batch_id = %id, "batch already enqueued");
        }
        self.check(id, false, enqueuer).await
    }

    /// Post-execution hook for a finished job.
    pub async fn after_execution(&self, job: &JobRecord, enqueuer: &dyn Enqueuer) -> anyhow::Result<()> {
        match job.batch_id {
            Some(batch_id) if job.is_finished() => {
                self.check(batch_id, member_failed(job), enqueuer).await
            }
            _ => Ok(()),
        }
    }

    /// Re-evaluate the batch and enqueue any callbacks that became due.
    pub async fn check(
        &self,
        id: BatchId,
        member_failed: bool,
        enqueuer: &dyn Enqueuer,
    ) -> anyhow::Result<()> {
        let mut session = self.store.session().await?;
        with_blocking_lock(&mut session, &batch_lock_key(id), || {
            self.check_locked(id, member_failed, enqueuer)
        })
        .instrument(crate::telemetry::batch_span(id, "check"))
        .await
    }

    async fn check_locked(
        &self,
        id: BatchId,
        member_failed: bool,
        enqueuer: &dyn Enqueuer,
    ) -> anyhow::Result<()> {
        let Some(batch) = self.store.find_batch(id).await? else {
            tracing::warn!(batch_id = %id, "batch disappeared before its check");
            return Ok(());
        };
        let now = Utc::now();

        let mut discarded = batch.is_discarded();
        if member_failed
            && !discarded
            && self
                .store
                .transition_batch(id, BatchTransition::Discarded, now)
                .await?
        {
            discarded = true;
            crate::telemetry::record_batch_event(id, BatchEvent::Discard);
            self.enqueue_callback(&batch, BatchEvent::Discard, enqueuer).await?;
        }

        if batch.is_enqueued()
            && !batch.is_finished()
            && self.store.count_unfinished_in_batch(id).await? == 0
            && self
                .store
                .transition_batch(id, BatchTransition::Finished, now)
                .await?
        {
            crate::telemetry::record_batch_event(id, BatchEvent::Finish);
            if !discarded {
                self.enqueue_callback(&batch, BatchEvent::Success, enqueuer).await?;
            }
            self.enqueue_callback(&batch, BatchEvent::Finish, enqueuer).await?;
        }

        Ok(())
    }

    async fn enqueue_callback(
        &self,
        batch: &BatchRecord,
        event: BatchEvent,
        enqueuer: &dyn Enqueuer,
    ) -> anyhow::Result<()> {
        let Some(job_class) = batch.callback_for(event) else {
            return Ok(());
        };

        let args = BatchCallbackArgs {
            batch_id: batch.id,
            event,
        };
        let mut job = NewJob::new(job_class, serde_json::to_value(args)?).batch_callback(batch.id);
        if let Some(queue_name) = &batch.callback_queue_name {
            job = job.queue(queue_name.clone());
        }
        if let Some(priority) = batch.callback_priority {
            job = job.priority(priority);
        }

        enqueuer.enqueue(job).await?;
        tracing::debug!(
            batch_id = %batch.id,
            event = event.as_str(),
            job_class,
            "batch callback enqueued"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_fills_record() {
        let record = Batch::new()
            .description("import")
            .property("source", serde_json::json!("s3"))
            .on_finish_class("ImportDone")
            .on_discard_class("ImportFailed")
            .callback_queue("callbacks")
            .callback_priority(-1)
            .into_record(Utc::now());

        assert_eq!(record.description.as_deref(), Some("import"));
        assert_eq!(record.serialized_properties["source"], "s3");
        assert_eq!(record.callback_for(BatchEvent::Finish), Some("ImportDone"));
        assert_eq!(record.callback_for(BatchEvent::Success), None);
        assert_eq!(record.callback_for(BatchEvent::Discard), Some("ImportFailed"));
        assert!(!record.is_enqueued());
    }

    #[test]
    fn test_transitions_apply_once() {
        let mut record = Batch::new().into_record(Utc::now());
        let now = Utc::now();
        assert!(record.apply(BatchTransition::Enqueued, now));
        assert!(!record.apply(BatchTransition::Enqueued, now));
        assert!(record.apply(BatchTransition::Finished, now));
        assert!(record.is_finished());
        assert!(!record.is_discarded());
    }

    #[test]
    fn test_member_failed_ignores_handled_errors() {
        let mut job = NewJob::new("Member", serde_json::json!({})).into_record(Utc::now());
        job.error = Some("boom".into());
        job.error_event = Some(ErrorEvent::Unhandled);
        assert!(!member_failed(&job));

        job.finished_at = Some(Utc::now());
        assert!(member_failed(&job));

        job.error_event = Some(ErrorEvent::Handled);
        assert!(!member_failed(&job));
    }

    #[test]
    fn test_callback_args_shape() {
        let args = BatchCallbackArgs {
            batch_id: BatchId::new(),
            event: BatchEvent::Success,
        };
        let value = serde_json::to_value(args).unwrap();
        assert_eq!(value["event"], "success");
        assert_eq!(value["batch_id"], args.batch_id.to_string());
    }
}
