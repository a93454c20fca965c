//! Runtime integration tests for quay worker processes.
//!
//! Tests assembly, wake-ups from the notifier, poller and scheduled-time
//! cache, pool bounds, process registration and shutdown behaviour.

use std::sync::Arc;
use std::time::Duration;

use quay::*;
use quay_testkit::{MemoryStore, RecordJob, SleepJob, TestContext, fixture_registry};
use tokio::time::{sleep, timeout};

fn fast_config() -> QuayConfig {
    QuayConfig::default()
        .with_poll_interval(Duration::from_millis(50))
        .with_idle_wake_interval(Duration::from_millis(50))
        .with_retention(RetentionPolicy::Always)
}

fn build_runtime(
    config: QuayConfig,
    store: &Arc<MemoryStore>,
    ctx: &TestContext,
) -> Runtime<MemoryStore, TestContext> {
    quay_testkit::init_tracing();
    RuntimeBuilder::new(config)
        .with_store(Arc::clone(store))
        .with_jobs(fixture_registry())
        .with_context(ctx.clone())
        .build()
        .expect("build runtime")
}

async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    timeout(Duration::from_secs(5), async {
        while !done() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

const STOP: ShutdownTimeout = ShutdownTimeout::After(Duration::from_secs(5));

#[tokio::test]
async fn runtime_performs_enqueued_jobs() {
    let store = MemoryStore::new();
    let ctx = TestContext::new();
    let runtime = build_runtime(fast_config(), &store, &ctx);
    runtime.start().await.expect("start runtime");

    for idx in 0..10 {
        runtime
            .client()
            .enqueue_job(&RecordJob::new(format!("job-{idx}")))
            .await
            .unwrap();
    }

    assert!(
        wait_until(|| ctx.event_count("record:") == 10).await,
        "timed out waiting for jobs"
    );
    assert!(wait_until(|| store.unfinished_count() == 0).await);

    let executed: u64 = runtime
        .scheduler_stats()
        .iter()
        .map(|stats| stats.executions)
        .sum();
    assert_eq!(executed, 10);
    runtime.shutdown(STOP).await.expect("shutdown runtime");
}

#[tokio::test]
async fn notify_wakes_workers_without_the_poller() {
    let store = MemoryStore::new();
    let ctx = TestContext::new();
    let config = fast_config()
        .with_poll_interval(Duration::ZERO)
        .with_idle_wake_interval(Duration::ZERO);
    let runtime = build_runtime(config, &store, &ctx);
    runtime.start().await.unwrap();
    // Let the startup pass find the queue empty
    sleep(Duration::from_millis(100)).await;

    runtime
        .client()
        .enqueue_job(&RecordJob::new("hinted"))
        .await
        .unwrap();
    assert!(wait_until(|| ctx.event_count("record:hinted") == 1).await);
    runtime.shutdown(STOP).await.unwrap();
}

#[tokio::test]
async fn poller_picks_up_work_when_notify_is_off() {
    let store = MemoryStore::new();
    let ctx = TestContext::new();
    let runtime = build_runtime(fast_config().with_listen_notify(false), &store, &ctx);
    runtime.start().await.unwrap();
    sleep(Duration::from_millis(100)).await;

    runtime
        .client()
        .enqueue_job(&RecordJob::new("polled"))
        .await
        .unwrap();
    assert!(wait_until(|| ctx.event_count("record:polled") == 1).await);
    runtime.shutdown(STOP).await.unwrap();
}

#[tokio::test]
async fn scheduled_job_runs_when_due() {
    let store = MemoryStore::new();
    let ctx = TestContext::new();
    let config = fast_config()
        .with_poll_interval(Duration::ZERO)
        .with_idle_wake_interval(Duration::ZERO);
    let runtime = build_runtime(config, &store, &ctx);
    runtime.start().await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let job = NewJob::from_job(&RecordJob::new("later"))
        .unwrap()
        .wait(chrono::Duration::milliseconds(300));
    runtime.client().enqueue(job).await.unwrap();

    sleep(Duration::from_millis(100)).await;
    assert_eq!(ctx.event_count("record:later"), 0);
    assert!(wait_until(|| ctx.event_count("record:later") == 1).await);
    runtime.shutdown(STOP).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_never_exceeds_max_threads() {
    let store = MemoryStore::new();
    let ctx = TestContext::new();
    let runtime = build_runtime(fast_config().with_max_threads(2), &store, &ctx);
    runtime.start().await.unwrap();

    let jobs = (0..6)
        .map(|_| NewJob::from_job(&SleepJob { millis: 100 }).unwrap())
        .collect();
    runtime.client().enqueue_many(jobs).await.unwrap();

    assert!(wait_until(|| ctx.event_count("slept") == 6).await);
    assert!(ctx.max_running() <= 2, "ran {} at once", ctx.max_running());
    assert_eq!(ctx.max_running(), 2);
    runtime.shutdown(STOP).await.unwrap();
}

#[tokio::test]
async fn queue_groups_only_serve_their_queues() {
    let store = MemoryStore::new();
    let ctx = TestContext::new();
    let runtime = build_runtime(fast_config().with_queues("mail:1"), &store, &ctx);
    runtime.start().await.unwrap();

    let mail = NewJob::from_job(&RecordJob::new("mail")).unwrap().queue("mail");
    let other = NewJob::from_job(&RecordJob::new("other")).unwrap().queue("reports");
    runtime.client().enqueue(mail).await.unwrap();
    runtime.client().enqueue(other).await.unwrap();

    assert!(wait_until(|| ctx.event_count("record:mail") == 1).await);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(ctx.event_count("record:other"), 0);
    assert_eq!(store.unfinished_count(), 1);
    runtime.shutdown(STOP).await.unwrap();
}

#[tokio::test]
async fn paused_queue_resumes_after_unpause() {
    let store = MemoryStore::new();
    let ctx = TestContext::new();
    let runtime = build_runtime(fast_config(), &store, &ctx);
    runtime
        .settings()
        .pause(PauseTarget::Queue(DEFAULT_QUEUE.into()))
        .await
        .unwrap();
    runtime.start().await.unwrap();

    runtime
        .client()
        .enqueue_job(&RecordJob::new("held"))
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(ctx.event_count("record:held"), 0);

    runtime
        .settings()
        .unpause(PauseTarget::Queue(DEFAULT_QUEUE.into()))
        .await
        .unwrap();
    runtime.wake();
    assert!(wait_until(|| ctx.event_count("record:held") == 1).await);
    runtime.shutdown(STOP).await.unwrap();
}

#[tokio::test]
async fn process_row_lives_as_long_as_the_runtime() {
    let store = MemoryStore::new();
    let ctx = TestContext::new();
    let registry = ProcessRegistry::new();
    let runtime = RuntimeBuilder::new(fast_config().with_queues("a:1;b:2"))
        .with_store(Arc::clone(&store))
        .with_jobs(fixture_registry())
        .with_context(ctx.clone())
        .with_process_registry(Arc::clone(&registry))
        .build()
        .unwrap();
    assert!(registry.is_empty());

    runtime.start().await.unwrap();
    let processes = store.list_processes().await.unwrap();
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0].id, runtime.process_id());
    assert_eq!(processes[0].schedulers.len(), 2);

    let summaries = registry.summaries();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].schedulers.len(), 2);
    assert!(summaries[0].poller_enabled);

    registry.shutdown_all(STOP).await.unwrap();
    assert!(registry.is_empty());
    assert!(!runtime.is_running());
    assert!(store.list_processes().await.unwrap().is_empty());
}

#[tokio::test]
async fn start_twice_fails_and_shutdown_is_idempotent() {
    let store = MemoryStore::new();
    let ctx = TestContext::new();
    let runtime = build_runtime(fast_config(), &store, &ctx);

    runtime.start().await.unwrap();
    assert!(runtime.start().await.is_err());
    runtime.shutdown(STOP).await.unwrap();
    runtime.shutdown(STOP).await.unwrap();
    assert!(runtime.shutdown_token().is_cancelled());
}

#[tokio::test]
async fn shutdown_waits_for_running_jobs() {
    let store = MemoryStore::new();
    let ctx = TestContext::new();
    let runtime = build_runtime(fast_config(), &store, &ctx);
    runtime.start().await.unwrap();

    runtime
        .client()
        .enqueue_job(&SleepJob { millis: 300 })
        .await
        .unwrap();
    assert!(wait_until(|| ctx.max_running() == 1).await);

    runtime.shutdown(ShutdownTimeout::Forever).await.unwrap();
    assert_eq!(ctx.event_count("slept"), 1);
    assert_eq!(store.unfinished_count(), 0);
}

#[tokio::test]
async fn cron_entries_fire_through_the_runtime() {
    let store = MemoryStore::new();
    let ctx = TestContext::new();
    let schedule =
        CronSchedule::dynamic(|after| Some(after + chrono::Duration::milliseconds(100)));
    let runtime = RuntimeBuilder::new(fast_config().with_cron(true))
        .with_store(Arc::clone(&store))
        .with_jobs(fixture_registry())
        .with_context(ctx.clone())
        .with_cron_entry(CronEntry::for_job("beat", schedule, &RecordJob::new("beat")).unwrap())
        .build()
        .unwrap();
    runtime.start().await.unwrap();

    assert!(wait_until(|| ctx.event_count("record:beat") >= 2).await);
    runtime.shutdown(STOP).await.unwrap();
}

#[tokio::test]
async fn build_rejects_incomplete_or_inconsistent_setup() {
    let store = MemoryStore::new();

    let missing = RuntimeBuilder::<MemoryStore, TestContext>::new(QuayConfig::default())
        .with_store(Arc::clone(&store))
        .with_jobs(fixture_registry())
        .build();
    assert!(missing.unwrap_err().to_string().contains("context"));

    let every_minute = || CronSchedule::parse("* * * * *").unwrap();
    let duplicate = RuntimeBuilder::new(QuayConfig::default())
        .with_store(Arc::clone(&store))
        .with_jobs(fixture_registry())
        .with_context(TestContext::new())
        .with_cron_entry(CronEntry::new("dup", every_minute(), RecordJob::NAME))
        .with_cron_entry(CronEntry::new("dup", every_minute(), RecordJob::NAME))
        .build();
    assert!(duplicate.is_err());

    let unknown = RuntimeBuilder::new(QuayConfig::default())
        .with_store(Arc::clone(&store))
        .with_jobs(fixture_registry())
        .with_context(TestContext::new())
        .with_cron_entry(CronEntry::new("ghost", every_minute(), "Ghost"))
        .build();
    assert!(unknown.unwrap_err().to_string().contains("Ghost"));

    let bad_queues = RuntimeBuilder::new(QuayConfig::default().with_queues("a:x"))
        .with_store(store)
        .with_jobs(fixture_registry())
        .with_context(TestContext::new())
        .build();
    assert!(bad_queues.is_err());
}
