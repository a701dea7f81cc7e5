//! Lightweight migration runner for rusqlite.
//!
//! Numbered SQL files from `migrations/` are embedded at compile time,
//! applied versions are tracked in `schema_versions`, and any pending
//! migrations run in order every time the store connection opens.

use std::collections::HashSet;

use rusqlite::{params, Connection};
use tracing::{debug, info};

/// (version, name, sql) in ascending version order
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "001_initial",
        include_str!("../migrations/001_initial.sql"),
    ),
    (
        2,
        "002_courses_created_index",
        include_str!("../migrations/002_courses_created_index.sql"),
    ),
];

/// Run all pending migrations against the given connection.
///
/// Returns the number of migrations applied by this call.
pub fn run_migrations(conn: &mut Connection) -> rusqlite::Result<usize> {
    // Set pragmas for safe concurrent access
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;",
    )?;

    // Ensure tracking table exists
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
    )?;

    // Get already-applied versions
    let applied: HashSet<i64> = conn
        .prepare("SELECT version FROM schema_versions")?
        .query_map([], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();

    let mut pending = 0;
    for (version, name, sql) in MIGRATIONS {
        if applied.contains(version) {
            continue;
        }

        // Each migration and its version row commit together
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_versions (version, name) VALUES (?1, ?2)",
            params![version, name],
        )?;
        tx.commit()?;

        info!(
            component = "migrations",
            event = "migration.applied",
            version = version,
            name = %name,
            "Applied migration"
        );
        pending += 1;
    }

    debug!(
        component = "migrations",
        event = "migrations.complete",
        total = MIGRATIONS.len(),
        applied = pending,
        "Migration check complete"
    );

    Ok(pending)
}
