use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::ShutdownTimeout;
use crate::job::ProcessId;
use crate::scheduler::SchedulerStats;

/// Introspection view of one running runtime.
#[derive(Clone, Debug, Serialize)]
pub struct RuntimeSummary {
    pub process_id: ProcessId,
    pub schedulers: Vec<SchedulerStats>,
    pub notifier_listening: bool,
    pub poller_enabled: bool,
    pub cron_entries: usize,
}

/// What the registry needs from a runtime, independent of its store and
/// application context types.
#[async_trait]
pub trait RegisteredRuntime: Send + Sync {
    fn process_id(&self) -> ProcessId;

    fn summary(&self) -> RuntimeSummary;

    async fn shutdown(&self, timeout: ShutdownTimeout) -> anyhow::Result<()>;
}

/// Explicit registry of the runtimes living in this process.
///
/// Runtimes add themselves when they start and remove themselves when they
/// shut down. Pass one registry to every builder that should be managed
/// together.
#[derive(Default)]
pub struct ProcessRegistry {
    runtimes: Mutex<BTreeMap<ProcessId, Arc<dyn RegisteredRuntime>>>,
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("runtimes", &self.runtimes.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProcessRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, runtime: Arc<dyn RegisteredRuntime>) {
        let id = runtime.process_id();
        if self.runtimes.lock().insert(id, runtime).is_some() {
            tracing::warn!(process_id = %id, "runtime registered twice");
        }
    }

    pub fn deregister(&self, id: ProcessId) -> bool {
        self.runtimes.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.runtimes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runtimes.lock().is_empty()
    }

    pub fn summaries(&self) -> Vec<RuntimeSummary> {
        self.runtimes
            .lock()
            .values()
            .map(|runtime| runtime.summary())
            .collect()
    }

    /// Shut down every registered runtime concurrently.
    pub async fn shutdown_all(&self, timeout: ShutdownTimeout) -> anyhow::Result<()> {
        let runtimes: Vec<_> = self.runtimes.lock().values().cloned().collect();
        let results = futures::future::join_all(
            runtimes.iter().map(|runtime| runtime.shutdown(timeout)),
        )
        .await;
        for result in results {
            result?;
        }
        Ok(())
    }
}
