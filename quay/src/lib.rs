//! Quay - database-coordinated background job execution.
//!
//! Jobs are rows in a relational table. Worker processes claim due rows by
//! taking session-scoped advisory locks, run them, and record each attempt
//! as its own execution row. The database is the only coordination point:
//! there is no broker and no leader.
//!
//! # Core Concepts
//!
//! - **Job**: A user type implementing [`Job`], registered by name in a
//!   [`JobRegistry`] and run with an explicit [`ExecutionContext`].
//!
//! - **Store**: The [`JobStore`], [`BatchStore`], [`ProcessStore`] and
//!   [`SettingStore`] traits abstract the backend. The Postgres backend is
//!   [`persistence::PgStore`]; the in-memory one lives in `quay-testkit`.
//!
//! - **Locks**: Row exclusivity comes from [`LockSession`] advisory locks
//!   that vanish with the session, so a crashed worker never strands a job.
//!
//! - **Scheduler**: A [`Scheduler`] is a bounded pool serving one queue
//!   group. It is woken by the [`Notifier`], the [`Poller`] and its own idle
//!   timer, and runs [`Performer::perform_next`] until the backlog is empty.
//!
//! - **Throttle, batches, cron**: Concurrency keys with limits and windows
//!   ([`ConcurrencyConfig`]), job groups with callbacks ([`Batch`]), and
//!   recurring entries de-duplicated per fire time ([`CronEntry`]).
//!
//! - **Runtime**: [`RuntimeBuilder`] wires everything into a [`Runtime`]
//!   that starts and stops as one worker process.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL backend via sqlx (default)
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use quay::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct SendEmail { to: String }
//!
//! #[async_trait::async_trait]
//! impl Job for SendEmail {
//!     const NAME: &'static str = "SendEmail";
//!     type Context = AppState;
//!
//!     async fn perform(&self, ctx: &ExecutionContext<AppState>) -> anyhow::Result<()> {
//!         ctx.app().mailer.send(&self.to).await
//!     }
//! }
//!
//! let runtime = RuntimeBuilder::new(QuayConfig::from_env()?)
//!     .with_store(store)
//!     .with_jobs(JobRegistry::new().register::<SendEmail>())
//!     .with_context(app)
//!     .build()?;
//! runtime.start().await?;
//! runtime.client().enqueue_job(&SendEmail { to: "a@b.c".into() }).await?;
//! ```

/// Batches: job groups with completion callbacks.
pub mod batch;

/// Retention on finish and periodic purging of old rows.
pub mod cleanup;

/// Enqueue client and the object-safe [`Enqueuer`] trait.
pub mod client;

/// Configuration structures for workers and persistence.
///
/// The `config` module defines [`QuayConfig`] for the worker process and
/// [`PersistenceConfig`] for the connection pool, both readable from the
/// environment.
pub mod config;

/// Recurring jobs.
pub mod cron;

/// Error types recognised by the execution machinery and the error sink.
pub mod errors;

/// Job definitions, the dispatch table and the execution context.
///
/// The `handler` module defines:
/// - [`Job`] trait - the user-facing job type
/// - [`JobRegistry`] - name to handler dispatch table
/// - [`ExecutionContext`] - everything a running job may look at
pub mod handler;

/// Core row types and identifiers.
///
/// The `job` module defines [`JobRecord`], [`ExecutionRecord`], [`NewJob`],
/// the id newtypes and the [`ErrorEvent`] and [`JobStatus`] enums.
pub mod job;

/// Session-scoped advisory locks.
pub mod lock;

#[cfg(feature = "metrics")]
/// Prometheus collectors, enabled with the `metrics` feature.
pub mod metrics;

/// Wake hints and their transports.
pub mod notifier;

/// Claiming and running one job at a time.
pub mod performer;

/// Periodic wake-ups for every scheduler.
pub mod poller;

/// Heartbeat rows of live worker processes.
pub mod process;

/// Queue filters, groups and snapshots.
pub mod queue;

/// Retry policies and failure classification.
pub mod retry;

/// Worker pools serving queue groups.
pub mod scheduler;

/// Administrative settings: pauses and cron switches.
pub mod settings;

/// Storage traits implemented by every backend.
pub mod store;

/// Tracing spans and event recorders.
pub mod telemetry;

/// Concurrency limits and throttles per concurrency key.
pub mod throttle;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// The `persistence` module provides the PostgreSQL-backed store, lock
/// session and wake channel when the `postgres` feature is enabled.
pub mod persistence;

/// Runtime assembly and lifecycle.
///
/// The `runtime` module provides the [`Runtime`] that runs one worker
/// process. Includes:
/// - [`RuntimeBuilder`] - validated construction
/// - [`ShutdownToken`] - graceful shutdown signaling
/// - [`WorkerConfig`] - per queue group pool settings
/// - [`ProcessRegistry`] - explicit registry of live runtimes
pub mod runtime;

pub use self::cron::*;
pub use batch::*;
pub use cleanup::*;
pub use client::*;
pub use config::*;
pub use errors::*;
pub use handler::*;
pub use job::*;
pub use lock::*;
pub use notifier::*;
pub use performer::*;
pub use poller::*;
pub use process::*;
pub use queue::*;
pub use retry::*;
pub use runtime::*;
pub use scheduler::*;
pub use settings::*;
pub use store::*;
pub use throttle::*;
