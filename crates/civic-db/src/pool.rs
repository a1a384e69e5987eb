//! The shared SQLite pool.
//!
//! Every ticket command holds one connection for the length of a
//! `BEGIN IMMEDIATE` transaction, so the pool size bounds how many commands
//! can be in flight and the acquire timeout bounds how long a command waits
//! for its turn before failing as a storage error.

use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

/// Runtime tunables for the pool and its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a connection waits on another writer's lock, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled connections. Must be at least 1.
    pub pool_max_size: u32,

    /// How long a command waits to check out a connection, in milliseconds.
    pub acquire_timeout_ms: u64,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
            acquire_timeout_ms: 10_000,
        }
    }
}

impl DbRuntimeSettings {
    fn validate(&self) -> Result<(), PoolError> {
        if self.pool_max_size == 0 {
            return Err(PoolError::InvalidSettings(
                "pool_max_size must be at least 1".to_string(),
            ));
        }
        if self.acquire_timeout_ms == 0 {
            return Err(PoolError::InvalidSettings(
                "acquire_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid database settings: {0}")]
    InvalidSettings(String),

    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),
}

/// Opens the ticket database at `db_path` behind a connection pool.
///
/// Each connection runs in WAL mode with foreign keys on, so deleting a
/// ticket cascades to its comments and history.
///
/// `:memory:` gives every pooled connection its own empty database; use an
/// on-disk path whenever more than one connection is expected.
///
/// # Errors
///
/// Returns `PoolError::InvalidSettings` for a zero pool size or acquire
/// timeout, and `PoolError::PoolInit` if the first connection cannot be
/// opened and initialized.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    settings.validate()?;

    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(move |conn| init_connection(conn, settings.busy_timeout_ms));

    let pool = Pool::builder()
        .max_size(settings.pool_max_size)
        .connection_timeout(Duration::from_millis(settings.acquire_timeout_ms))
        .build(manager)?;

    tracing::debug!(
        path = db_path,
        max_size = settings.pool_max_size,
        acquire_timeout_ms = settings.acquire_timeout_ms,
        "database pool ready"
    );
    Ok(pool)
}

fn init_connection(conn: &mut Connection, busy_timeout_ms: u64) -> rusqlite::Result<()> {
    let journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    // In-memory databases report "memory".
    if journal_mode != "wal" && journal_mode != "memory" {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("journal mode stuck at {journal_mode}, expected wal")),
        ));
    }
    conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
}
