// src/store/schema.rs — Schema + migrations

use rusqlite::{params, Connection};
use tracing::info;

use crate::infra::errors::GenTaskError;

/// A database migration with version, name, and SQL statements.
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        up: include_str!("migrations/001_initial_schema.up.sql"),
        down: include_str!("migrations/001_initial_schema.down.sql"),
    },
    Migration {
        version: 2,
        name: "poll_rotation",
        up: include_str!("migrations/002_poll_rotation.up.sql"),
        down: include_str!("migrations/002_poll_rotation.down.sql"),
    },
];

pub fn latest_version() -> u32 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}

pub fn current_version(conn: &Connection) -> Result<u32, GenTaskError> {
    ensure_tracking_table(conn)?;
    let v: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;
    Ok(v)
}

fn ensure_tracking_table(conn: &Connection) -> Result<(), GenTaskError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;
    Ok(())
}

/// Run all pending migrations. Returns how many were applied.
pub fn run_migrations(conn: &Connection) -> Result<usize, GenTaskError> {
    let current = current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        info!(
            "Applying migration {}: {}",
            migration.version, migration.name
        );

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.up)?;
        tx.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )?;
        tx.commit()?;
        applied += 1;
    }

    Ok(applied)
}

/// Revert applied migrations down to (and excluding) `target`.
pub fn revert_migrations(conn: &Connection, target: u32) -> Result<usize, GenTaskError> {
    let current = current_version(conn)?;
    let mut reverted = 0;

    for migration in MIGRATIONS
        .iter()
        .rev()
        .filter(|m| m.version > target && m.version <= current)
    {
        info!(
            "Reverting migration {}: {}",
            migration.version, migration.name
        );

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.down)?;
        tx.execute(
            "DELETE FROM _migrations WHERE version = ?1",
            params![migration.version],
        )?;
        tx.commit()?;
        reverted += 1;
    }

    Ok(reverted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |r| r.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(run_migrations(&conn).unwrap(), MIGRATIONS.len());
        assert_eq!(run_migrations(&conn).unwrap(), 0);
        assert_eq!(current_version(&conn).unwrap(), latest_version());
        assert!(table_exists(&conn, "tasks"));
        assert!(table_exists(&conn, "ledger_entries"));
    }

    #[test]
    fn test_revert_drops_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(revert_migrations(&conn, 0).unwrap(), MIGRATIONS.len());
        assert_eq!(current_version(&conn).unwrap(), 0);
        assert!(!table_exists(&conn, "tasks"));
    }

    #[test]
    fn test_completed_at_tracks_terminal_state() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO users (id, created_at, updated_at) VALUES ('u', 'now', 'now')",
            [],
        )
        .unwrap();
        let terminal_without_completion = conn.execute(
            "INSERT INTO tasks (id, user_id, kind, provider, model, prompt, state, created_at, updated_at)
             VALUES ('t', 'u', 'image', 'p', 'm', 'x', 'SUCCESS', 'now', 'now')",
            [],
        );
        assert!(terminal_without_completion.is_err());
    }
}
