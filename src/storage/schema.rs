//! Base database schema and the master attach.

use rusqlite::Connection;

use crate::error::Result;

pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Base schema for the client database.
///
/// The per-service tables (update ledger, current-files) are created by
/// [`super::tables`] and [`super::files`] when a service is added.
pub const SCHEMA_SQL: &str = r"
    -- Subscribed services
    CREATE TABLE IF NOT EXISTS services (
        service_id INTEGER PRIMARY KEY,
        service_key BLOB NOT NULL UNIQUE,
        service_type INTEGER NOT NULL,
        name TEXT NOT NULL DEFAULT ''
    );

    -- Update-file info; mime is how registration learns what a blob carries
    CREATE TABLE IF NOT EXISTS files_info (
        hash_id INTEGER PRIMARY KEY,
        mime INTEGER NOT NULL,
        size INTEGER
    );

    -- Pending file-maintenance work
    CREATE TABLE IF NOT EXISTS file_maintenance_jobs (
        hash_id INTEGER NOT NULL,
        job_type INTEGER NOT NULL,
        time_added TEXT NOT NULL,
        PRIMARY KEY (hash_id, job_type)
    );
    CREATE INDEX IF NOT EXISTS idx_file_maintenance_jobs_job_type
        ON file_maintenance_jobs(job_type);

    -- Schema bookkeeping
    CREATE TABLE IF NOT EXISTS metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

/// Intern caches live in the attached master database so they and the
/// definition maps survive client-database recovery.
pub const MASTER_SCHEMA_SQL: &str = r"
    CREATE TABLE IF NOT EXISTS external_master.hashes (
        hash_id INTEGER PRIMARY KEY,
        hash BLOB NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS external_master.tags (
        tag_id INTEGER PRIMARY KEY,
        tag TEXT NOT NULL UNIQUE
    );
";

/// Attach the master database under the `external_master` schema name.
///
/// # Errors
///
/// Returns an error if the attach fails.
pub fn attach_master(conn: &Connection, master_path: &str) -> Result<()> {
    conn.execute("ATTACH DATABASE ?1 AS external_master", [master_path])?;
    Ok(())
}

/// Apply pragmas and the base schema to both databases.
///
/// Idempotent: all statements use `IF NOT EXISTS`.
///
/// # Errors
///
/// Returns an error if any DDL statement fails.
pub fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        ",
    )?;

    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(MASTER_SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO metadata ( key, value ) VALUES ( 'schema_version', ?1 )",
        [CURRENT_SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}
