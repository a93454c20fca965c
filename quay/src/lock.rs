//! Session-scoped advisory locks.
//!
//! String keys are hashed to a stable 64-bit id so the same key maps to the
//! same lock whether it is taken from Rust or from inside a SQL statement.
//! A lock belongs to the session that took it: it is reentrant for that
//! session, and it disappears when the session ends.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::job::{BatchId, JobId};

/// Map a lock key to its 64-bit lock id.
///
/// The id is the first eight bytes of the key's MD5 digest read big-endian,
/// which matches `('x' || substr(md5(key), 1, 16))::bit(64)::bigint` in Postgres.
pub fn lock_id(key: &str) -> i64 {
    let digest = md5::compute(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.0[..8]);
    i64::from_be_bytes(bytes)
}

/// Lock key guarding execution of a job row.
pub fn job_lock_key(id: JobId) -> String {
    format!("quay_jobs-{id}")
}

/// Lock key serializing concurrency checks for a concurrency key.
pub fn concurrency_lock_key(key: &str) -> String {
    format!("quay_concurrency-{key}")
}

/// Lock key serializing the finish check of a batch.
pub fn batch_lock_key(id: BatchId) -> String {
    format!("quay_batches-{id}")
}

/// A database session able to hold advisory locks.
///
/// Every method operates on locks owned by this session only, except
/// [`LockSession::is_locked`] which reports whether any session holds the key.
#[async_trait]
pub trait LockSession: Send {
    /// Take the lock if it is free or already ours. Never waits.
    async fn try_lock(&mut self, key: &str) -> anyhow::Result<bool>;

    /// Wait until the lock can be taken.
    async fn lock(&mut self, key: &str) -> anyhow::Result<()>;

    /// Release one level of the lock. Returns false if this session did not hold it.
    async fn unlock(&mut self, key: &str) -> anyhow::Result<bool>;

    /// Whether any session currently holds the key.
    async fn is_locked(&mut self, key: &str) -> anyhow::Result<bool>;

    /// Whether this session holds the key.
    async fn owned_by_current_session(&mut self, key: &str) -> anyhow::Result<bool>;

    /// Drop every lock held by this session in one step.
    async fn unlock_all(&mut self) -> anyhow::Result<()>;
}

/// Run `f` while holding `key`, or return `None` without running it when
/// another session holds the key.
pub async fn with_lock<S, F, Fut, T>(
    session: &mut S,
    key: &str,
    f: F,
) -> anyhow::Result<Option<T>>
where
    S: LockSession + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    if !session.try_lock(key).await? {
        return Ok(None);
    }

    let result = f().await;
    let unlocked = session.unlock(key).await;
    let value = result?;
    unlocked?;
    Ok(Some(value))
}

/// Run `f` while holding `key`, waiting for the lock if needed.
pub async fn with_blocking_lock<S, F, Fut, T>(
    session: &mut S,
    key: &str,
    f: F,
) -> anyhow::Result<T>
where
    S: LockSession + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    session.lock(key).await?;

    let result = f().await;
    let unlocked = session.unlock(key).await;
    let value = result?;
    unlocked?;
    Ok(value)
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    session: u64,
    depth: u32,
}

/// In-process lock table with the same semantics as Postgres advisory locks.
///
/// Used by the in-memory store and by tests. Each [`MemoryLockSession`]
/// handed out by [`MemoryLockTable::session`] behaves like a separate
/// database connection.
#[derive(Debug, Default)]
pub struct MemoryLockTable {
    holders: Mutex<HashMap<i64, Holder>>,
    released: Notify,
    next_session: AtomicU64,
}

impl MemoryLockTable {
    /// Create an empty lock table.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a new session against this table.
    pub fn session(self: &Arc<Self>) -> MemoryLockSession {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        MemoryLockSession {
            table: Arc::clone(self),
            id,
        }
    }

    /// Whether any session holds the lock id.
    pub fn is_locked_id(&self, id: i64) -> bool {
        self.holders.lock().contains_key(&id)
    }

    /// Whether any session holds the key.
    pub fn is_locked(&self, key: &str) -> bool {
        self.is_locked_id(lock_id(key))
    }

    /// Number of distinct keys currently held.
    pub fn held(&self) -> usize {
        self.holders.lock().len()
    }

    fn try_acquire(&self, session: u64, id: i64) -> bool {
        let mut holders = self.holders.lock();
        match holders.get_mut(&id) {
            Some(holder) if holder.session == session => {
                holder.depth += 1;
                true
            }
            Some(_) => false,
            None => {
                holders.insert(id, Holder { session, depth: 1 });
                true
            }
        }
    }

    fn release(&self, session: u64, id: i64) -> bool {
        let released = {
            let mut holders = self.holders.lock();
            match holders.get_mut(&id) {
                Some(holder) if holder.session == session => {
                    holder.depth -= 1;
                    if holder.depth == 0 {
                        holders.remove(&id);
                    }
                    true
                }
                _ => false,
            }
        };
        if released {
            self.released.notify_waiters();
        }
        released
    }

    fn release_all(&self, session: u64) {
        self.holders
            .lock()
            .retain(|_, holder| holder.session != session);
        self.released.notify_waiters();
    }

    fn owns(&self, session: u64, id: i64) -> bool {
        self.holders
            .lock()
            .get(&id)
            .is_some_and(|holder| holder.session == session)
    }
}

/// A session on a [`MemoryLockTable`]. Dropping it releases all its locks.
#[derive(Debug)]
pub struct MemoryLockSession {
    table: Arc<MemoryLockTable>,
    id: u64,
}

impl MemoryLockSession {
    /// The session number, unique within its table.
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl LockSession for MemoryLockSession {
    async fn try_lock(&mut self, key: &str) -> anyhow::Result<bool> {
        Ok(self.table.try_acquire(self.id, lock_id(key)))
    }

    async fn lock(&mut self, key: &str) -> anyhow::Result<()> {
        let id = lock_id(key);
        loop {
            let notified = self.table.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.table.try_acquire(self.id, id) {
                return Ok(());
            }
            notified.await;
        }
    }

    async fn unlock(&mut self, key: &str) -> anyhow::Result<bool> {
        Ok(self.table.release(self.id, lock_id(key)))
    }

    async fn is_locked(&mut self, key: &str) -> anyhow::Result<bool> {
        Ok(self.table.is_locked(key))
    }

    async fn owned_by_current_session(&mut self, key: &str) -> anyhow::Result<bool> {
        Ok(self.table.owns(self.id, lock_id(key)))
    }

    async fn unlock_all(&mut self) -> anyhow::Result<()> {
        self.table.release_all(self.id);
        Ok(())
    }
}

impl Drop for MemoryLockSession {
    fn drop(&mut self) {
        self.table.release_all(self.id);
    }
}
