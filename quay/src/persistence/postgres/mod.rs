mod lock;
mod notify;
mod store;

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::PersistenceConfig;

pub use lock::PgLockSession;
pub use notify::PgWakeChannel;
pub use store::PgStore;

/// Build the connection pool.
///
/// Connections returned to the pool drop every advisory lock they still
/// hold, so a worker task aborted in the middle of a job cannot leak its
/// row lock to the next user of the connection.
pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
        .after_release(|conn, _meta| {
            Box::pin(async move {
                match sqlx::query("SELECT pg_advisory_unlock_all()")
                    .execute(&mut *conn)
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(err) => {
                        // Close the connection rather than reuse it with unknown locks.
                        tracing::warn!("advisory unlock on release failed: {err}");
                        Ok(false)
                    }
                }
            })
        })
        .connect(&config.connection_string)
        .await?;
    Ok(pool)
}

/// Apply the bundled schema.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
