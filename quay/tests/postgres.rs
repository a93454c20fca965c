//! Integration tests against a real Postgres database.
//!
//! Requires a running Postgres instance; the schema is migrated on connect.
//! Run with: `DATABASE_URL=... cargo test --test postgres -- --ignored`

#![cfg(feature = "postgres")]

use std::sync::Arc;

use chrono::Utc;
use quay::persistence::{PgStore, connect, migrate};
use quay::*;
use quay_testkit::RecordJob;
use serde_json::json;

async fn store() -> Arc<PgStore> {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = connect(&PersistenceConfig::new(url).with_max_connections(8))
        .await
        .expect("connect");
    migrate(&pool).await.expect("migrate");
    Arc::new(PgStore::new(pool))
}

/// A queue name nobody else uses, so tests can share one database.
fn scoped_queue(name: &str) -> String {
    format!("{name}-{}", uuid::Uuid::new_v4())
}

async fn insert(store: &PgStore, job: NewJob) -> JobRecord {
    match store.insert_job(job).await.expect("insert") {
        InsertOutcome::Inserted(job) => job,
        InsertOutcome::Duplicate => panic!("unexpected duplicate"),
    }
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn lock_id_matches_the_sql_expression() {
    let store = store().await;
    for key in ["quay_jobs-1", "quay_concurrency-tenant", ""] {
        let from_sql: i64 = sqlx::query_scalar(
            "SELECT ('x' || substr(md5($1), 1, 16))::bit(64)::bigint",
        )
        .bind(key)
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(from_sql, lock_id(key), "key {key:?}");
    }
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn concurrent_sessions_claim_distinct_jobs() {
    let store = store().await;
    let queue = scoped_queue("claim");
    let first = insert(&store, NewJob::new("A", json!({})).queue(&queue)).await;
    let second = insert(&store, NewJob::new("A", json!({})).queue(&queue)).await;
    let request = ClaimRequest::new(
        QueueFilter::Include(vec![queue.clone()]),
        PriorityOrder::SmallerFirst,
    );

    let mut a = store.session().await.unwrap();
    let mut b = store.session().await.unwrap();
    let claimed_a = store.claim(&mut a, &request).await.unwrap();
    let claimed_b = store.claim(&mut b, &request).await.unwrap();
    assert_eq!(claimed_a[0].id, first.id);
    assert_eq!(claimed_b[0].id, second.id);
    assert!(a.is_locked(&first.lock_key()).await.unwrap());
    assert!(!b.owned_by_current_session(&first.lock_key()).await.unwrap());

    // Returning the connection to the pool releases what it held
    drop(a);
    let mut c = store.session().await.unwrap();
    let reclaimed = store.claim(&mut c, &request).await.unwrap();
    assert_eq!(reclaimed[0].id, first.id);

    store.delete_job(first.id).await.unwrap();
    store.delete_job(second.id).await.unwrap();
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn cron_fire_is_inserted_once() {
    let store = store().await;
    let key = scoped_queue("cron");
    let at = Utc::now();

    let first = store
        .insert_job(NewJob::new("Tick", json!({})).cron(&key, at))
        .await
        .unwrap();
    let again = store
        .insert_job(NewJob::new("Tick", json!({})).cron(&key, at))
        .await
        .unwrap();
    assert!(matches!(again, InsertOutcome::Duplicate));

    if let InsertOutcome::Inserted(job) = first {
        store.delete_job(job.id).await.unwrap();
    }
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn execution_chain_and_concurrency_counts() {
    let store = store().await;
    let queue = scoped_queue("exec");
    let key = scoped_queue("key");
    let job = insert(
        &store,
        NewJob::from_job(&RecordJob::new("pg"))
            .unwrap()
            .queue(&queue)
            .concurrency_key(&key),
    )
    .await;

    let request = ClaimRequest::new(
        QueueFilter::Include(vec![queue.clone()]),
        PriorityOrder::SmallerFirst,
    );
    let mut session = store.session().await.unwrap();
    assert_eq!(store.claim(&mut session, &request).await.unwrap().len(), 1);
    assert_eq!(
        store
            .count_concurrency(&key, ConcurrencyCount::Performing)
            .await
            .unwrap(),
        1
    );

    let (_, first) = store
        .begin_execution(BeginExecution {
            job_id: job.id,
            execution_id: ExecutionId::new(),
            process_id: None,
            performed_at: Utc::now(),
        })
        .await
        .unwrap();
    store
        .finish_execution(FinishExecution {
            job_id: job.id,
            execution_id: first.id,
            finished_at: Utc::now(),
            duration: chrono::Duration::milliseconds(5),
            error: Some("JobError: concurrency limit exceeded for key k".into()),
            error_event: Some(ErrorEvent::Retried),
            retry_at: Some(Utc::now()),
        })
        .await
        .unwrap();

    let (_, second) = store
        .begin_execution(BeginExecution {
            job_id: job.id,
            execution_id: ExecutionId::new(),
            process_id: None,
            performed_at: Utc::now(),
        })
        .await
        .unwrap();
    let finished = store
        .finish_execution(FinishExecution {
            job_id: job.id,
            execution_id: second.id,
            finished_at: Utc::now(),
            duration: chrono::Duration::milliseconds(5),
            error: None,
            error_event: None,
            retry_at: None,
        })
        .await
        .unwrap();
    assert!(finished.is_finished());
    assert_eq!(finished.executions_count, 2);

    let executions = store.executions(job.id).await.unwrap();
    assert_eq!(executions.len(), 2);
    assert_eq!(executions[0].retried_execution_id, Some(executions[1].id));

    // The rejected attempt does not count against the throttle window
    let performed = store
        .count_concurrency(
            &key,
            ConcurrencyCount::PerformedSince(Utc::now() - chrono::Duration::minutes(1)),
        )
        .await
        .unwrap();
    assert_eq!(performed, 1);

    session.unlock(&job.lock_key()).await.unwrap();
    store.delete_job(job.id).await.unwrap();
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn settings_round_trip_and_pause_claims() {
    let store = store().await;
    let queue = scoped_queue("paused");
    let job = insert(&store, NewJob::new("A", json!({})).queue(&queue)).await;
    let settings = Settings::new(Arc::clone(&store));
    let request = ClaimRequest::new(
        QueueFilter::Include(vec![queue.clone()]),
        PriorityOrder::SmallerFirst,
    );

    settings
        .pause(PauseTarget::Queue(queue.clone()))
        .await
        .unwrap();
    let mut session = store.session().await.unwrap();
    assert!(store.claim(&mut session, &request).await.unwrap().is_empty());

    settings.unpause(PauseTarget::Queue(queue)).await.unwrap();
    assert_eq!(store.claim(&mut session, &request).await.unwrap().len(), 1);

    session.unlock_all().await.unwrap();
    store.delete_job(job.id).await.unwrap();
}
