// src/cli/migrate.rs — Database migration command
//
// `serve` migrates on startup; this command shows the schema state or moves
// it explicitly.

use std::path::Path;

use crate::infra::config::Config;
use crate::store::schema;

/// Show migration status, run pending migrations, or revert the latest one.
pub fn run_migrate(config: &Config, status_only: bool, rollback: bool) -> anyhow::Result<()> {
    let db_path = config.database.resolved_path();

    if !db_path.exists() && (status_only || rollback) {
        println!("No database found at: {}", db_path.display());
        println!("Run `gentask migrate` to create it.");
        return Ok(());
    }

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = rusqlite::Connection::open(&db_path)?;

    if status_only {
        return show_migration_status(&conn, &db_path);
    }

    if rollback {
        let current = schema::current_version(&conn)?;
        if current == 0 {
            println!("No migrations to roll back.");
            return Ok(());
        }
        println!("Reverting migration v{current}. Data in its tables is dropped.");
        schema::revert_migrations(&conn, current - 1)?;
        return show_migration_status(&conn, &db_path);
    }

    println!("Running database migrations...");
    let applied = schema::run_migrations(&conn)?;
    println!("Migrations complete ({applied} applied).");

    show_migration_status(&conn, &db_path)
}

fn show_migration_status(conn: &rusqlite::Connection, db_path: &Path) -> anyhow::Result<()> {
    let current = schema::current_version(conn)?;
    println!("Database: {}", db_path.display());
    println!(
        "Schema version: {current} (latest {})",
        schema::latest_version()
    );

    let mut stmt =
        conn.prepare("SELECT version, name, applied_at FROM _migrations ORDER BY version")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, u32>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    for row in rows {
        let (version, name, applied_at) = row?;
        println!("  v{version}: {name} (applied {applied_at})");
    }
    Ok(())
}
