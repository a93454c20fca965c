use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgListener;

use crate::notifier::{WAKE_CHANNEL, WakeChannel, WakeHint, WakeSubscription};

/// Wake channel over Postgres `NOTIFY`/`LISTEN`.
#[derive(Debug, Clone)]
pub struct PgWakeChannel {
    pool: PgPool,
    channel: String,
}

impl PgWakeChannel {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            channel: WAKE_CHANNEL.to_string(),
        }
    }

    /// Use a different channel name, e.g. to isolate tests sharing a database.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }
}

struct PgSubscription {
    listener: PgListener,
}

#[async_trait]
impl WakeSubscription for PgSubscription {
    async fn recv(&mut self, timeout: Duration) -> anyhow::Result<Option<WakeHint>> {
        match tokio::time::timeout(timeout, self.listener.try_recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(Some(notification))) => {
                match serde_json::from_str::<WakeHint>(notification.payload()) {
                    Ok(hint) => Ok(Some(hint)),
                    Err(err) => {
                        tracing::warn!("unreadable wake payload, waking everyone: {err}");
                        Ok(Some(WakeHint::default()))
                    }
                }
            }
            Ok(Ok(None)) => Err(anyhow::anyhow!("notification connection lost")),
            Ok(Err(err)) => Err(err.into()),
        }
    }
}

#[async_trait]
impl WakeChannel for PgWakeChannel {
    async fn publish(&self, hint: &WakeHint) -> anyhow::Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(serde_json::to_string(hint)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn listen(&self) -> anyhow::Result<Option<Box<dyn WakeSubscription>>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;
        Ok(Some(Box::new(PgSubscription { listener })))
    }
}
