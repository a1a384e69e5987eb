//! Database layer for the civic ticketing core.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! and embedded SQL migrations. Every table used by the ticket store, the
//! audit trail, and the notification inbox is created here.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: a single authoritative store with concurrent
//!   readers and one writer at a time, which is exactly the contention model
//!   of ticket mutations.
//! - **`r2d2` connection pool**: each command runs on its own pooled
//!   connection; there is no global lock in the service layer.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!` so the schema ships with the code that depends on it.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
