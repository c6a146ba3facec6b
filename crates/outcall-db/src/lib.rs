//! Database layer for the outbound call service.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization
//! and embedded SQL migrations. Every table the service reads or writes
//! (modules, questions, calls, audio artifacts) is created here.
//!
//! The durable audio tier and the call records share one database file so a
//! single-node deployment needs no external database process.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
