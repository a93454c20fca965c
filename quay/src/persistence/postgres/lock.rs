use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, Postgres};

use crate::lock::{LockSession, lock_id};

/// Advisory-lock session on one pooled connection.
///
/// The locks live as long as the connection's session. Dropping the
/// session returns the connection to the pool, whose release hook clears
/// anything still held.
#[derive(Debug)]
pub struct PgLockSession {
    conn: PoolConnection<Postgres>,
}

impl PgLockSession {
    pub(super) fn new(conn: PoolConnection<Postgres>) -> Self {
        Self { conn }
    }

    /// The underlying connection, for queries that must run on this session.
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.conn
    }
}

#[async_trait]
impl LockSession for PgLockSession {
    async fn try_lock(&mut self, key: &str) -> anyhow::Result<bool> {
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(lock_id(key))
            .fetch_one(self.connection())
            .await?;
        Ok(locked)
    }

    async fn lock(&mut self, key: &str) -> anyhow::Result<()> {
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(lock_id(key))
            .execute(self.connection())
            .await?;
        Ok(())
    }

    async fn unlock(&mut self, key: &str) -> anyhow::Result<bool> {
        let unlocked: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(lock_id(key))
            .fetch_one(self.connection())
            .await?;
        Ok(unlocked)
    }

    async fn is_locked(&mut self, key: &str) -> anyhow::Result<bool> {
        let locked: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM pg_locks
                WHERE locktype = 'advisory'
                  AND objsubid = 1
                  AND granted
                  AND ((classid::bigint << 32) | objid::bigint) = $1
            )
            "#,
        )
        .bind(lock_id(key))
        .fetch_one(self.connection())
        .await?;
        Ok(locked)
    }

    async fn owned_by_current_session(&mut self, key: &str) -> anyhow::Result<bool> {
        let owned: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM pg_locks
                WHERE locktype = 'advisory'
                  AND objsubid = 1
                  AND granted
                  AND pid = pg_backend_pid()
                  AND ((classid::bigint << 32) | objid::bigint) = $1
            )
            "#,
        )
        .bind(lock_id(key))
        .fetch_one(self.connection())
        .await?;
        Ok(owned)
    }

    async fn unlock_all(&mut self) -> anyhow::Result<()> {
        sqlx::query("SELECT pg_advisory_unlock_all()")
            .execute(self.connection())
            .await?;
        Ok(())
    }
}
