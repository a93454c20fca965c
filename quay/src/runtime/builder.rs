use std::any::type_name;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::cleanup::Cleaner;
use crate::client::{Client, Enqueuer};
use crate::config::QuayConfig;
use crate::cron::{CronEntry, CronManager};
use crate::errors::ErrorSink;
use crate::handler::{JobCatalog, JobRegistry};
use crate::job::ProcessId;
use crate::notifier::{DisabledWakeChannel, InProcWakeChannel, Notifier, WakeChannel, WakeRecipient};
use crate::performer::Performer;
use crate::process::{ProcessRecord, ProcessTracker};
use crate::scheduler::{MultiScheduler, Scheduler};
use crate::settings::Settings;
use crate::store::Store;

use super::registry::ProcessRegistry;
use super::supervisor::{Runtime, RuntimeParts, ShutdownToken};
use super::worker::WorkerConfig;

/// Builder for constructing a [`Runtime`] with explicit dependencies.
///
/// The builder validates that all required dependencies are provided before
/// constructing the runtime. Each dependency is configured via a `with_*` method.
///
/// # Example
///
/// ```ignore
/// use quay::*;
///
/// let runtime = RuntimeBuilder::new(QuayConfig::from_env()?)
///     .with_store(store)
///     .with_jobs(JobRegistry::new().register::<SendEmail>())
///     .with_context(app)
///     .with_wake_channel(wake)
///     .build()?;
/// runtime.start().await?;
/// ```
pub struct RuntimeBuilder<St, C> {
    config: QuayConfig,
    store: Option<Arc<St>>,
    jobs: Option<Arc<JobRegistry<C>>>,
    context: Option<C>,
    wake: Option<Arc<dyn WakeChannel>>,
    cron: Vec<CronEntry>,
    errors: ErrorSink,
    registry: Option<Arc<ProcessRegistry>>,
}

impl<St, C> fmt::Debug for RuntimeBuilder<St, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("RuntimeBuilder");
        debug.field("config", &self.config);
        debug.field("store_set", &self.store.is_some());
        debug.field("jobs_set", &self.jobs.is_some());
        debug.field("context_set", &self.context.is_some());
        debug.field("wake_set", &self.wake.is_some());
        debug.field("cron_entries", &self.cron.len());
        debug.field("registry_set", &self.registry.is_some());

        if self.store.is_some() {
            debug.field("store_type", &type_name::<St>());
        }
        if self.context.is_some() {
            debug.field("context_type", &type_name::<C>());
        }

        debug.finish()
    }
}

impl<St: Store, C: Clone + Send + Sync + 'static> RuntimeBuilder<St, C> {
    /// Create a new builder with the given configuration.
    pub fn new(config: QuayConfig) -> Self {
        Self {
            config,
            store: None,
            jobs: None,
            context: None,
            wake: None,
            cron: Vec::new(),
            errors: ErrorSink::default(),
            registry: None,
        }
    }

    pub fn with_store(mut self, store: Arc<St>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the dispatch table of job classes.
    pub fn with_jobs(mut self, jobs: JobRegistry<C>) -> Self {
        self.jobs = Some(Arc::new(jobs));
        self
    }

    /// Set the application context handed to every job.
    pub fn with_context(mut self, context: C) -> Self {
        self.context = Some(context);
        self
    }

    /// Set the wake channel. Without one, an in-process channel is used when
    /// notifications are enabled.
    pub fn with_wake_channel(mut self, wake: Arc<dyn WakeChannel>) -> Self {
        self.wake = Some(wake);
        self
    }

    pub fn with_cron_entry(mut self, entry: CronEntry) -> Self {
        self.cron.push(entry);
        self
    }

    pub fn with_cron_entries(mut self, entries: impl IntoIterator<Item = CronEntry>) -> Self {
        self.cron.extend(entries);
        self
    }

    pub fn with_error_sink(mut self, errors: ErrorSink) -> Self {
        self.errors = errors;
        self
    }

    /// Share a process registry with other runtimes.
    pub fn with_process_registry(mut self, registry: Arc<ProcessRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the runtime, validating all dependencies are set.
    pub fn build(self) -> anyhow::Result<Runtime<St, C>> {
        self.config.validate()?;

        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        let jobs = self
            .jobs
            .ok_or_else(|| anyhow::anyhow!("jobs dependency missing"))?;
        let context = self
            .context
            .ok_or_else(|| anyhow::anyhow!("context dependency missing"))?;

        let mut keys = HashSet::new();
        for entry in &self.cron {
            if !keys.insert(entry.key.as_str()) {
                anyhow::bail!("cron key {} configured twice", entry.key);
            }
            if !jobs.contains(&entry.job_class) {
                anyhow::bail!(
                    "cron entry {} names unregistered job class {}",
                    entry.key,
                    entry.job_class
                );
            }
        }
        if !self.cron.is_empty() && !self.config.enable_cron {
            tracing::warn!(
                entries = self.cron.len(),
                "cron entries configured but cron is disabled"
            );
        }

        let wake: Arc<dyn WakeChannel> = match self.wake {
            Some(wake) => wake,
            None if self.config.enable_listen_notify => Arc::new(InProcWakeChannel::default()),
            None => Arc::new(DisabledWakeChannel),
        };

        let config = self.config;
        let errors = self.errors;
        let process_id = ProcessId::new();
        let shutdown = ShutdownToken::new();

        let client = Client::new(Arc::clone(&store), Arc::clone(&wake))
            .with_catalog(Arc::clone(&jobs) as Arc<dyn JobCatalog>);
        let cleaner = Arc::new(Cleaner::new(Arc::clone(&store), config.cleanup()));

        let workers = WorkerConfig::from_config(&config)?;
        let schedulers = workers
            .iter()
            .map(|worker| {
                let performer = Performer::new(
                    client.clone(),
                    Arc::clone(&jobs),
                    context.clone(),
                    worker.group.filter.clone(),
                )
                .with_order(worker.order)
                .with_select_limit(worker.select_limit)
                .with_process_id(process_id)
                .with_retention(config.retention)
                .with_cleaner(Arc::clone(&cleaner))
                .with_error_sink(errors.clone());
                Scheduler::new(
                    worker.name.clone(),
                    Arc::new(performer),
                    worker.scheduler_config(),
                    errors.clone(),
                )
            })
            .collect();
        let schedulers = Arc::new(MultiScheduler::new(schedulers));

        let notifier = config.enable_listen_notify.then(|| {
            Arc::new(Notifier::new(
                Arc::clone(&wake),
                vec![Arc::clone(&schedulers) as Arc<dyn WakeRecipient>],
                config.notifier_wait(),
                shutdown.clone(),
                errors.clone(),
            ))
        });

        let settings = Settings::new(Arc::clone(&store));
        let cron = (config.enable_cron && !self.cron.is_empty()).then(|| {
            Arc::new(
                CronManager::new(
                    self.cron,
                    Arc::new(client.clone()) as Arc<dyn Enqueuer>,
                    settings.clone(),
                )
                .with_graceful_restart_period(config.cron_graceful_restart_period())
                .with_error_sink(errors.clone()),
            )
        });

        let record = ProcessRecord::current(
            process_id,
            workers.iter().map(|worker| worker.name.clone()).collect(),
        );
        let tracker = Arc::new(ProcessTracker::new(
            Arc::clone(&store),
            record,
            config.heartbeat_interval(),
            config.process_expiry(),
        ));

        Ok(Runtime::new(RuntimeParts {
            config,
            process_id,
            client,
            schedulers,
            notifier,
            cron,
            tracker,
            cleaner,
            settings,
            shutdown,
            errors,
            registry: self.registry.unwrap_or_default(),
        }))
    }
}
