//! SQLite connection pool shared by every durable store of a reactor.
//!
//! All blocking SQLite work is moved off the async runtime with
//! `spawn_blocking`; stores hand a closure to [`Database::run`].

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::errors::{StoreError, StoreResult};
use super::migrations;

/// Cancellation signal accepted by every storage call
pub type AbortSignal = CancellationToken;

/// Fail fast with `Aborted` when the caller's signal already fired
pub fn check_aborted(signal: Option<&AbortSignal>) -> StoreResult<()> {
    match signal {
        Some(signal) if signal.is_cancelled() => Err(StoreError::Aborted),
        _ => Ok(()),
    }
}

#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Open (or create) a database file and bring its schema up to date
    pub fn open(path: impl AsRef<Path>, pool_size: u32) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Storage(format!("Failed to create {:?}: {}", parent, e)))?;
            }
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;
                 PRAGMA foreign_keys = ON;",
            )
        });

        let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;
        debug!(path = %path.display(), pool_size, "opened database");

        Self::from_pool(pool)
    }

    /// Private in-memory database.
    ///
    /// The pool holds a single connection: every SQLite `:memory:` connection
    /// is its own database.
    pub fn memory() -> StoreResult<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder().max_size(1).build(manager)?;

        Self::from_pool(pool)
    }

    fn from_pool(pool: Pool<SqliteConnectionManager>) -> StoreResult<Self> {
        migrations::migrate(&pool)?;
        Ok(Self { pool: Arc::new(pool) })
    }

    /// Run blocking SQLite work on the blocking pool.
    ///
    /// The signal is checked before the task is scheduled and again once a
    /// connection has been acquired.
    pub async fn run<F, T>(&self, signal: Option<&AbortSignal>, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        check_aborted(signal)?;

        let pool = self.pool.clone();
        let signal = signal.cloned();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            check_aborted(signal.as_ref())?;
            f(&mut conn)
        })
        .await?
    }
}
