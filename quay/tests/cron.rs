//! Recurring job tests: de-duplicated fires, switches and restart catch-up.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use quay::*;
use quay_testkit::{MemoryStore, RecordJob, TestContext, fixture_registry};

fn manager(store: &Arc<MemoryStore>, entries: Vec<CronEntry>) -> CronManager<MemoryStore> {
    let client = Client::new(Arc::clone(store), Arc::new(DisabledWakeChannel));
    CronManager::new(entries, Arc::new(client), Settings::new(Arc::clone(store)))
}

fn every_minute(key: &str) -> CronEntry {
    CronEntry::for_job(
        key,
        CronSchedule::parse("* * * * *").unwrap(),
        &RecordJob::new(key),
    )
    .unwrap()
}

#[tokio::test]
async fn same_fire_is_enqueued_once() {
    let store = MemoryStore::new();
    let cron = manager(&store, vec![every_minute("tick")]);
    let entry = cron.entries().next().unwrap().clone();
    let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

    let first = cron.fire(&entry, at).await.unwrap().unwrap();
    assert!(first.is_enqueued());
    let job = first.job().unwrap();
    assert_eq!(job.cron_key.as_deref(), Some("tick"));
    assert_eq!(job.cron_at, Some(at));
    assert_eq!(job.job_class, RecordJob::NAME);

    // A second process racing for the same fire loses
    let second = cron.fire(&entry, at).await.unwrap().unwrap();
    assert!(matches!(second, EnqueueOutcome::Duplicate));

    let next = cron
        .fire(&entry, at + chrono::Duration::minutes(1))
        .await
        .unwrap()
        .unwrap();
    assert!(next.is_enqueued());
    assert_eq!(store.jobs().len(), 2);
}

#[tokio::test]
async fn switched_off_entries_do_not_fire() {
    let store = MemoryStore::new();
    let settings = Settings::new(Arc::clone(&store));
    let cron = manager(
        &store,
        vec![every_minute("on"), every_minute("off").disabled_by_default()],
    );
    let entries: Vec<CronEntry> = cron.entries().cloned().collect();
    let at = Utc::now();

    settings.disable_cron("on").await.unwrap();
    assert!(cron.fire(&entries[0], at).await.unwrap().is_none());
    assert!(cron.fire(&entries[1], at).await.unwrap().is_none());

    settings.enable_cron("off").await.unwrap();
    assert!(cron.fire(&entries[1], at).await.unwrap().is_some());
    assert!(!settings.cron_enabled("on", true).await.unwrap());
    assert_eq!(store.jobs().len(), 1);
}

#[tokio::test]
async fn missed_fires_are_caught_up_once() {
    let store = MemoryStore::new();
    let cron = manager(&store, vec![every_minute("catchup")])
        .with_graceful_restart_period(Some(Duration::from_secs(5 * 60)));
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 30).unwrap();

    // Fires at 11:56 through 12:00
    assert_eq!(cron.enqueue_missed(now).await.unwrap(), 5);
    // Everything is already there on the next start
    assert_eq!(cron.enqueue_missed(now).await.unwrap(), 0);
    assert_eq!(store.jobs().len(), 5);
}

#[tokio::test]
async fn no_catch_up_without_a_restart_period() {
    let store = MemoryStore::new();
    let cron = manager(&store, vec![every_minute("plain")]);
    assert_eq!(cron.enqueue_missed(Utc::now()).await.unwrap(), 0);
    assert!(store.jobs().is_empty());
}

#[tokio::test]
async fn run_fires_dynamic_entries_until_shutdown() {
    let store = MemoryStore::new();
    let schedule = CronSchedule::dynamic(|after| Some(after + chrono::Duration::milliseconds(50)));
    let entry = CronEntry::new("fast", schedule, RecordJob::NAME)
        .with_args(serde_json::json!({"label": "fast"}));
    let cron = Arc::new(manager(&store, vec![entry]));
    let shutdown = ShutdownToken::new();

    let handle = tokio::spawn(Arc::clone(&cron).run(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(400)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("cron loop stopped")
        .unwrap();

    let fired = store.jobs_of_class(RecordJob::NAME).len();
    assert!(fired >= 3, "expected several fires, got {fired}");
    assert!(
        store
            .jobs()
            .iter()
            .all(|job| job.cron_key.as_deref() == Some("fast"))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn performed_fire_still_blocks_a_second_enqueue() {
    let store = MemoryStore::new();
    let ctx = TestContext::new();
    let cron = manager(&store, vec![every_minute("tick")])
        .with_graceful_restart_period(Some(Duration::from_secs(60)));
    let entry = cron.entries().next().unwrap().clone();
    let client = Client::new(Arc::clone(&store), Arc::new(DisabledWakeChannel));
    // Default retention deletes successful jobs, but not cron fires
    let performer = Performer::new(
        client,
        Arc::new(fixture_registry()),
        ctx.clone(),
        QueueFilter::All,
    );
    let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

    assert!(cron.fire(&entry, at).await.unwrap().unwrap().is_enqueued());
    assert!(matches!(
        performer.perform_next().await.unwrap(),
        ClaimOutcome::Executed(result) if result.succeeded()
    ));
    assert_eq!(store.jobs().len(), 1);

    let again = cron.fire(&entry, at).await.unwrap().unwrap();
    assert!(matches!(again, EnqueueOutcome::Duplicate));

    // A restart right after the fire does not enqueue it again either
    let restarted_at = at + chrono::Duration::seconds(30);
    assert_eq!(cron.enqueue_missed(restarted_at).await.unwrap(), 0);

    assert!(performer.perform_next().await.unwrap().is_empty());
    assert_eq!(ctx.event_count("record:tick"), 1);
}
