//! Test support for quay: an in-memory backend, fixture jobs and mocks.

pub mod job;
pub mod memory;
pub mod mock;

pub use job::*;
pub use memory::MemoryStore;
pub use mock::RecordingRecipient;

use tracing_subscriber::EnvFilter;

/// Install a test log subscriber once. Honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
