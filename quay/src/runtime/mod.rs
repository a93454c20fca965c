/// Runtime builder wiring the components of a worker process.
pub mod builder;
/// Explicit registry of live runtimes for introspection and shutdown.
pub mod registry;
/// Runtime start/stop sequencing and the shared shutdown token.
pub mod supervisor;
/// Per-queue-group worker pool configuration.
pub mod worker;

pub use builder::RuntimeBuilder;
pub use registry::{ProcessRegistry, RegisteredRuntime, RuntimeSummary};
pub use supervisor::{Runtime, ShutdownToken};
pub use worker::WorkerConfig;
