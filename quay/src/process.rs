//! Heartbeat rows of live worker processes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ErrorSink;
use crate::job::ProcessId;
use crate::runtime::ShutdownToken;
use crate::store::ProcessStore;

/// One live (or recently dead) worker process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub id: ProcessId,
    pub hostname: String,
    pub pid: u32,
    pub process_title: String,
    /// The queue groups the process runs, e.g. `mice:2`.
    pub schedulers: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl ProcessRecord {
    /// Describe the current OS process.
    pub fn current(id: ProcessId, schedulers: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            pid: std::process::id(),
            process_title: std::env::args()
                .next()
                .unwrap_or_else(|| "quay".to_string()),
            schedulers,
            created_at: now,
            last_heartbeat_at: now,
        }
    }

    /// Whether the heartbeat is older than `expiry` at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, expiry: Duration) -> bool {
        match chrono::Duration::from_std(expiry) {
            Ok(expiry) => self.last_heartbeat_at + expiry < now,
            Err(_) => false,
        }
    }
}

/// Keeps this process's heartbeat row fresh.
pub struct ProcessTracker<St> {
    store: Arc<St>,
    record: ProcessRecord,
    interval: Duration,
    expiry: Duration,
}

impl<St> std::fmt::Debug for ProcessTracker<St> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTracker")
            .field("id", &self.record.id)
            .field("interval", &self.interval)
            .field("expiry", &self.expiry)
            .finish()
    }
}

impl<St: ProcessStore + 'static> ProcessTracker<St> {
    pub fn new(store: Arc<St>, record: ProcessRecord, interval: Duration, expiry: Duration) -> Self {
        Self {
            store,
            record,
            interval,
            expiry,
        }
    }

    pub fn id(&self) -> ProcessId {
        self.record.id
    }

    pub fn record(&self) -> &ProcessRecord {
        &self.record
    }

    pub async fn register(&self) -> anyhow::Result<()> {
        self.store.register_process(self.record.clone()).await?;
        tracing::info!(
            process_id = %self.record.id,
            hostname = %self.record.hostname,
            pid = self.record.pid,
            "process registered"
        );
        Ok(())
    }

    /// Refresh the heartbeat, re-registering if the row was reaped, and
    /// delete rows of processes that stopped heartbeating.
    pub async fn beat(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        if !self.store.heartbeat(self.record.id, now).await? {
            tracing::warn!(process_id = %self.record.id, "process row missing, registering again");
            let mut record = self.record.clone();
            record.last_heartbeat_at = now;
            self.store.register_process(record).await?;
        }

        let before = now - chrono::Duration::from_std(self.expiry)?;
        let reaped = self.store.delete_stale_processes(before).await?;
        if reaped > 0 {
            tracing::info!(reaped, "deleted stale process rows");
        }
        Ok(())
    }

    pub async fn deregister(&self) -> anyhow::Result<()> {
        self.store.deregister_process(self.record.id).await?;
        tracing::info!(process_id = %self.record.id, "process deregistered");
        Ok(())
    }

    /// Heartbeat until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownToken, errors: ErrorSink) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.beat().await {
                        errors.report(&err, "heartbeat");
                    }
                }
            }
        }
    }
}
