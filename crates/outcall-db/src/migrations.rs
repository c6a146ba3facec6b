//! Embedded SQL migration runner.
//!
//! Migrations are compiled in with `include_str!` and applied in order,
//! tracked by the `_outcall_migrations` table. Each one runs inside its own
//! transaction together with its tracking row.

use rusqlite::Connection;
use thiserror::Error;

struct Migration {
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "000_init",
        sql: include_str!("migrations/000_init.sql"),
    },
    Migration {
        name: "001_modules",
        sql: include_str!("migrations/001_modules.sql"),
    },
    Migration {
        name: "002_calls",
        sql: include_str!("migrations/002_calls.sql"),
    },
    Migration {
        name: "003_audio_artifacts",
        sql: include_str!("migrations/003_audio_artifacts.sql"),
    },
];

/// Errors that can occur during migration execution.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A SQL statement within a migration failed.
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        /// The name of the migration that failed.
        name: String,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },

    /// Failed to query migration state.
    #[error("failed to check migration state: {0}")]
    StateQuery(rusqlite::Error),
}

/// Runs all pending migrations against the given connection and returns how
/// many were applied.
///
/// # Errors
///
/// Returns `MigrationError` if any migration fails to execute or if the
/// migration tracking table cannot be queried.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    apply(conn, MIGRATIONS)
}

fn apply(conn: &Connection, migrations: &[Migration]) -> Result<usize, MigrationError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _outcall_migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| failed("_outcall_migrations_bootstrap", e))?;

    let mut applied = 0;

    for migration in migrations {
        let done: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM _outcall_migrations WHERE name = ?1",
                [migration.name],
                |row| row.get(0),
            )
            .map_err(MigrationError::StateQuery)?;

        if done {
            tracing::debug!(migration = migration.name, "already applied");
            continue;
        }

        tracing::info!(migration = migration.name, "applying migration");

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| failed(migration.name, e))?;
        tx.execute_batch(migration.sql)
            .map_err(|e| failed(migration.name, e))?;
        tx.execute(
            "INSERT INTO _outcall_migrations (name) VALUES (?1)",
            [migration.name],
        )
        .map_err(|e| failed(migration.name, e))?;
        tx.commit().map_err(|e| failed(migration.name, e))?;

        applied += 1;
    }

    Ok(applied)
}

fn failed(name: &str, source: rusqlite::Error) -> MigrationError {
    MigrationError::ExecutionFailed {
        name: name.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, table: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table],
            |row| row.get(0),
        )
        .expect("should query sqlite_master")
    }

    #[test]
    fn fresh_database_gets_every_table() {
        let conn = Connection::open_in_memory().expect("open");
        let applied = run_migrations(&conn).expect("migrations should succeed");
        assert_eq!(applied, MIGRATIONS.len());

        for table in ["modules", "questions", "calls", "audio_artifacts"] {
            assert!(table_exists(&conn, table), "{table} should exist");
        }
    }

    #[test]
    fn rerun_is_a_no_op() {
        let conn = Connection::open_in_memory().expect("open");
        run_migrations(&conn).expect("first run");
        let second = run_migrations(&conn).expect("second run");
        assert_eq!(second, 0);
    }

    #[test]
    fn failed_migration_rolls_back_its_schema() {
        let conn = Connection::open_in_memory().expect("open");
        let migrations = [Migration {
            name: "900_conflict",
            sql: "
                CREATE TABLE rollback_scratch (id INTEGER PRIMARY KEY);
                INSERT INTO _outcall_migrations (name) VALUES ('900_conflict');
            ",
        }];

        let err = apply(&conn, &migrations).expect_err("tracking conflict should fail");
        match err {
            MigrationError::ExecutionFailed { name, .. } => assert_eq!(name, "900_conflict"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!table_exists(&conn, "rollback_scratch"));
    }
}
