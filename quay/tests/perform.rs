//! Claim-and-run tests for the performer against the in-memory store.
//!
//! Covers the execution lifecycle: success, retries, discards, rescues,
//! panics, interrupted attempts, pauses, ordering, concurrency limits and
//! many performers sharing one store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use quay::*;
use quay_testkit::{
    CappedJob, DiscardJob, FailingJob, MemoryStore, PanickingJob, RecordJob, RescuedJob,
    RetryingJob, SpawningJob, TestContext, ThrottledJob, fixture_registry,
};
use serde_json::json;
use tokio::time::timeout;

struct Harness {
    store: Arc<MemoryStore>,
    ctx: TestContext,
    client: Client<MemoryStore>,
    performer: Arc<Performer<MemoryStore, TestContext>>,
}

fn harness_with(retention: RetentionPolicy) -> Harness {
    quay_testkit::init_tracing();
    let store = MemoryStore::new();
    let ctx = TestContext::new();
    let registry = Arc::new(fixture_registry());
    let client = Client::new(Arc::clone(&store), Arc::new(DisabledWakeChannel))
        .with_catalog(registry.clone());
    let performer = Performer::new(client.clone(), registry, ctx.clone(), QueueFilter::All)
        .with_retention(retention);
    Harness {
        store,
        ctx,
        client,
        performer: Arc::new(performer),
    }
}

fn harness() -> Harness {
    harness_with(RetentionPolicy::Always)
}

impl Harness {
    async fn enqueue<J: Job>(&self, job: &J) -> JobRecord {
        self.client
            .enqueue_job(job)
            .await
            .expect("enqueue")
            .into_job()
            .expect("not rejected")
            .expect("not a duplicate")
    }

    async fn perform(&self) -> ExecutionResult {
        match self.performer.perform_next().await.expect("perform") {
            ClaimOutcome::Executed(result) => result,
            other => panic!("expected an execution, got {other:?}"),
        }
    }

    /// Perform until nothing is due.
    async fn drain(&self) -> Vec<ExecutionResult> {
        let mut results = Vec::new();
        loop {
            match self.performer.perform_next().await.expect("perform") {
                ClaimOutcome::Empty => return results,
                ClaimOutcome::Executed(result) => results.push(result),
                ClaimOutcome::Unexecutable(_) => {}
            }
        }
    }

    fn job(&self, id: JobId) -> JobRecord {
        self.store.job(id).expect("job exists")
    }
}

#[tokio::test]
async fn performs_job_and_records_execution() {
    let h = harness();
    let job = h.enqueue(&RecordJob::new("a")).await;

    let result = h.perform().await;
    assert!(result.succeeded());
    assert_eq!(result.job_id, job.id);
    assert_eq!(h.ctx.events(), vec!["record:a"]);

    let stored = h.job(job.id);
    assert!(stored.is_finished());
    assert_eq!(stored.status(Utc::now()), JobStatus::Succeeded);
    assert_eq!(stored.executions_count, 1);
    assert!(stored.locked_by_id.is_none());

    let executions = h.store.executions(job.id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert!(executions[0].finished_at.is_some());
    assert!(executions[0].duration.is_some());
    assert!(executions[0].error.is_none());

    assert!(h.performer.perform_next().await.unwrap().is_empty());
    assert_eq!(h.store.lock_table().held(), 0);
}

#[tokio::test]
async fn default_retention_deletes_successful_jobs() {
    let h = harness_with(RetentionPolicy::OnUnhandledError);
    let ok = h.enqueue(&RecordJob::new("kept?")).await;
    let failed = h
        .enqueue(&FailingJob {
            message: "boom".into(),
        })
        .await;

    h.drain().await;
    assert!(h.store.job(ok.id).is_none());
    let failed = h.job(failed.id);
    assert_eq!(failed.error_event, Some(ErrorEvent::Unhandled));
    assert_eq!(failed.error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn retries_until_the_job_succeeds() {
    let h = harness();
    let job = h.enqueue(&RetryingJob { failures: 2 }).await;

    let results = h.drain().await;
    let events: Vec<_> = results.iter().map(|r| r.error_event).collect();
    assert_eq!(
        events,
        vec![Some(ErrorEvent::Retried), Some(ErrorEvent::Retried), None]
    );
    assert_eq!(
        h.ctx.events(),
        vec!["retrying:1", "retrying:2", "retrying:3"]
    );

    let stored = h.job(job.id);
    assert_eq!(stored.status(Utc::now()), JobStatus::Succeeded);
    assert_eq!(stored.executions_count, 3);

    // Each attempt points at the one that replaced it
    let executions = h.store.executions(job.id).await.unwrap();
    assert_eq!(executions.len(), 3);
    assert_eq!(executions[0].retried_execution_id, Some(executions[1].id));
    assert_eq!(executions[1].retried_execution_id, Some(executions[2].id));
    assert!(executions[2].is_head());
    assert_eq!(executions[0].error.as_deref(), Some("attempt 1 failed"));
}

#[tokio::test]
async fn stops_retrying_after_the_last_attempt() {
    let h = harness();
    let job = h.enqueue(&RetryingJob { failures: 10 }).await;

    let results = h.drain().await;
    assert_eq!(results.len(), 3);
    let last = results.last().unwrap();
    assert_eq!(last.error_event, Some(ErrorEvent::RetryStopped));
    assert!(last.unhandled);

    let stored = h.job(job.id);
    assert!(stored.is_finished());
    assert_eq!(stored.status(Utc::now()), JobStatus::Discarded);
}

#[tokio::test]
async fn explicit_discard_is_handled() {
    let h = harness();
    let job = h.enqueue(&DiscardJob).await;

    let result = h.perform().await;
    assert_eq!(result.error_event, Some(ErrorEvent::Discarded));
    assert!(result.handled);
    assert!(!result.unhandled);
    assert!(h.job(job.id).error.unwrap().contains("bad input"));
}

#[tokio::test]
async fn rescued_error_counts_as_success() {
    let h = harness();
    let job = h.enqueue(&RescuedJob).await;

    let result = h.perform().await;
    assert_eq!(result.error_event, Some(ErrorEvent::Handled));
    assert_eq!(h.job(job.id).status(Utc::now()), JobStatus::Succeeded);
}

#[tokio::test]
async fn panic_fails_the_attempt_without_killing_the_worker() {
    let h = harness();
    h.enqueue(&PanickingJob).await;
    h.enqueue(&RecordJob::new("after")).await;

    let results = h.drain().await;
    assert_eq!(results.len(), 2);
    assert!(
        results[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("job body panicked"))
    );
    assert_eq!(results[0].error_event, Some(ErrorEvent::Unhandled));
    assert!(results[1].succeeded());
}

#[tokio::test]
async fn unknown_job_class_is_unhandled() {
    let h = harness();
    h.client
        .enqueue(NewJob::new("NoSuchJob", json!({})))
        .await
        .unwrap();

    let result = h.perform().await;
    assert_eq!(result.error_event, Some(ErrorEvent::Unhandled));
    assert!(result.error.unwrap().contains("NoSuchJob"));
}

#[tokio::test]
async fn recovers_an_interrupted_attempt() {
    let h = harness();
    let job = h.enqueue(&RecordJob::new("again")).await;

    // A process started the job and died: the row is marked performed but
    // nobody holds its lock.
    h.store
        .begin_execution(BeginExecution {
            job_id: job.id,
            execution_id: ExecutionId::new(),
            process_id: Some(ProcessId::new()),
            performed_at: Utc::now(),
        })
        .await
        .unwrap();

    let result = h.perform().await;
    assert!(result.succeeded());

    let executions = h.store.executions(job.id).await.unwrap();
    assert_eq!(executions.len(), 2);
    assert_eq!(executions[0].error_event, Some(ErrorEvent::Interrupted));
    assert_eq!(executions[0].retried_execution_id, Some(executions[1].id));
    assert!(executions[1].error.is_none());
    assert_eq!(h.job(job.id).executions_count, 2);
}

#[tokio::test]
async fn claims_in_priority_then_age_order() {
    let h = harness();
    for (label, priority) in [("low", 10), ("first", -5), ("mid", 0), ("second", -5)] {
        let job = NewJob::from_job(&RecordJob::new(label))
            .unwrap()
            .priority(priority);
        h.client.enqueue(job).await.unwrap();
    }

    h.drain().await;
    assert_eq!(
        h.ctx.events(),
        vec!["record:first", "record:second", "record:mid", "record:low"]
    );
}

#[tokio::test]
async fn future_jobs_wait_for_their_time() {
    let h = harness();
    let job = NewJob::from_job(&RecordJob::new("later"))
        .unwrap()
        .wait(chrono::Duration::hours(1));
    let job = h.client.enqueue(job).await.unwrap().into_job().unwrap().unwrap();

    assert!(h.performer.perform_next().await.unwrap().is_empty());
    assert_eq!(h.job(job.id).status(Utc::now()), JobStatus::Scheduled);

    h.store
        .update_job(job.id, |job| job.scheduled_at = Some(Utc::now()));
    assert!(h.perform().await.succeeded());
}

#[tokio::test]
async fn paused_queue_is_skipped_until_resumed() {
    let h = harness();
    h.enqueue(&RecordJob::new("held")).await;
    let settings = Settings::new(Arc::clone(&h.store));

    assert!(
        settings
            .pause(PauseTarget::Queue(DEFAULT_QUEUE.into()))
            .await
            .unwrap()
    );
    assert!(h.performer.perform_next().await.unwrap().is_empty());

    assert!(
        settings
            .unpause(PauseTarget::Queue(DEFAULT_QUEUE.into()))
            .await
            .unwrap()
    );
    assert!(h.perform().await.succeeded());
}

#[tokio::test]
async fn paused_job_class_leaves_other_classes_running() {
    let h = harness();
    h.enqueue(&DiscardJob).await;
    h.enqueue(&RecordJob::new("free")).await;
    Settings::new(Arc::clone(&h.store))
        .pause(PauseTarget::JobClass(DiscardJob::NAME.into()))
        .await
        .unwrap();

    let results = h.drain().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].job_class, RecordJob::NAME);
    assert_eq!(h.store.unfinished_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn perform_limit_rejects_second_job_with_same_key() {
    let h = harness();
    let first = h
        .enqueue(&ThrottledJob {
            key: "tenant-1".into(),
            millis: 300,
        })
        .await;
    let second = h
        .enqueue(&ThrottledJob {
            key: "tenant-1".into(),
            millis: 0,
        })
        .await;

    let performer = Arc::clone(&h.performer);
    let running = tokio::spawn(async move { performer.perform_next().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let rejected = h.perform().await;
    assert_eq!(rejected.job_id, second.id);
    assert_eq!(rejected.error_event, Some(ErrorEvent::Retried));
    assert!(is_rejection_message(rejected.error.as_deref().unwrap()));
    assert!(rejected.retried_at.unwrap() > Utc::now());

    let finished = timeout(Duration::from_secs(5), running)
        .await
        .expect("first job finished")
        .unwrap()
        .unwrap();
    match finished {
        ClaimOutcome::Executed(result) => {
            assert_eq!(result.job_id, first.id);
            assert!(result.succeeded());
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    // Make the rescheduled job due; with the key free it now runs
    h.store.update_job(second.id, |job| job.scheduled_at = None);
    assert!(h.perform().await.succeeded());
    assert_eq!(h.ctx.event_count("throttled:tenant-1"), 2);
    assert_eq!(h.ctx.max_running(), 1);
}

#[tokio::test]
async fn enqueue_limit_rejects_jobs_over_the_total() {
    let h = harness();
    let capped = |key: &str| CappedJob { key: key.into() };

    assert!(h.client.enqueue_job(&capped("a")).await.unwrap().is_enqueued());
    assert!(h.client.enqueue_job(&capped("a")).await.unwrap().is_enqueued());
    let third = h.client.enqueue_job(&capped("a")).await.unwrap();
    assert!(matches!(&third, EnqueueOutcome::Rejected { key } if key == "a"));
    assert!(matches!(
        third.into_job(),
        Err(EnqueueError::ConcurrencyLimit { .. })
    ));

    // Other keys are independent
    assert!(h.client.enqueue_job(&capped("b")).await.unwrap().is_enqueued());

    // Finishing one frees a slot
    h.perform().await;
    assert!(h.client.enqueue_job(&capped("a")).await.unwrap().is_enqueued());
}

#[tokio::test]
async fn job_body_can_enqueue_follow_up_work() {
    let h = harness();
    h.enqueue(&SpawningJob {
        child: "child".into(),
    })
    .await;

    let results = h.drain().await;
    assert_eq!(results.len(), 2);
    assert_eq!(h.ctx.events(), vec!["spawned", "record:child"]);
}

#[tokio::test]
async fn enqueue_validates_cron_pair() {
    let h = harness();
    let mut job = NewJob::new(RecordJob::NAME, json!({"label": "x"}));
    job.cron_key = Some("half".into());

    let err = h.client.enqueue(job).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EnqueueError>(),
        Some(EnqueueError::IncompleteCronPair)
    ));
    assert!(h.store.jobs().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_performers_run_each_job_once() {
    let h = harness_with(RetentionPolicy::OnUnhandledError);
    let jobs = (0..400)
        .map(|idx| NewJob::from_job(&RecordJob::new(format!("j{idx}"))).unwrap())
        .collect();
    h.client.enqueue_many(jobs).await.unwrap();

    let workers: Vec<_> = (0..16)
        .map(|_| {
            let performer = Arc::clone(&h.performer);
            tokio::spawn(async move {
                while !performer.perform_next().await.unwrap().is_empty() {}
            })
        })
        .collect();
    timeout(Duration::from_secs(30), async {
        for worker in workers {
            worker.await.unwrap();
        }
    })
    .await
    .expect("performers finished");

    let events = h.ctx.events();
    let distinct: std::collections::HashSet<_> = events.iter().collect();
    assert_eq!(distinct.len(), 400);
    assert_eq!(events.len(), 400, "some jobs ran more than once");
    assert_eq!(h.store.unfinished_count(), 0);
    assert_eq!(h.store.lock_table().held(), 0);
}

#[tokio::test]
async fn rejections_and_interruptions_do_not_spend_retries() {
    let h = harness();
    let job = h.enqueue(&RetryingJob { failures: 10 }).await;

    // One attempt refused by the concurrency guard
    let (_, rejected) = h
        .store
        .begin_execution(BeginExecution {
            job_id: job.id,
            execution_id: ExecutionId::new(),
            process_id: None,
            performed_at: Utc::now(),
        })
        .await
        .unwrap();
    h.store
        .finish_execution(FinishExecution {
            job_id: job.id,
            execution_id: rejected.id,
            finished_at: Utc::now(),
            duration: chrono::Duration::zero(),
            error: Some("JobError: concurrency limit exceeded for key k".into()),
            error_event: Some(ErrorEvent::Retried),
            retry_at: Some(Utc::now()),
        })
        .await
        .unwrap();
    // And one attempt whose process died
    h.store
        .begin_execution(BeginExecution {
            job_id: job.id,
            execution_id: ExecutionId::new(),
            process_id: Some(ProcessId::new()),
            performed_at: Utc::now(),
        })
        .await
        .unwrap();

    let results = h.drain().await;
    let events: Vec<_> = results.iter().map(|r| r.error_event).collect();
    assert_eq!(
        events,
        vec![
            Some(ErrorEvent::Retried),
            Some(ErrorEvent::Retried),
            Some(ErrorEvent::RetryStopped)
        ]
    );
    assert_eq!(h.ctx.event_count("retrying:"), 3);
    assert_eq!(h.store.executions(job.id).await.unwrap().len(), 5);
}
