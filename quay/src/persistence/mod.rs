/// PostgreSQL backend.
///
/// This module provides [`PgStore`], which implements every storage trait
/// on a `PgPool`, the advisory-lock [`PgLockSession`], and the
/// `LISTEN`/`NOTIFY` based [`PgWakeChannel`].
pub mod postgres;

pub use postgres::{PgLockSession, PgStore, PgWakeChannel, connect, migrate};
