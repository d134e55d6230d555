//! Local update-file store and the file-maintenance queue.
//!
//! Tracks what is known about each update file (mime, size) and which
//! files are currently present in each service's local domain. The
//! per-service `current_files_{S}` tables are what the readiness and
//! progress queries join against.

use std::collections::HashSet;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{LedgerError, Result};
use crate::model::{HashId, MaintenanceJobType, Mime, ServiceId};
use crate::storage::with_temp_integer_table;

#[must_use]
pub fn current_files_table_name(service_id: ServiceId) -> String {
    format!("current_files_{}", service_id.0)
}

/// SQL fragment joining `table` against a service's locally-present rows.
#[must_use]
pub fn current_files_join_clause(service_id: ServiceId, table: &str) -> String {
    format!(
        "{table} CROSS JOIN {} USING ( hash_id )",
        current_files_table_name(service_id)
    )
}

/// Create a service's current-files table. Idempotent.
///
/// # Errors
///
/// Returns an error if the DDL fails.
pub fn create_current_files_table(conn: &Connection, service_id: ServiceId) -> Result<()> {
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {} (
                hash_id INTEGER PRIMARY KEY,
                timestamp TEXT NOT NULL
            )",
            current_files_table_name(service_id)
        ),
        [],
    )?;

    Ok(())
}

/// Drop a service's current-files table.
///
/// # Errors
///
/// Returns an error if the DDL fails.
pub fn drop_current_files_table(conn: &Connection, service_id: ServiceId) -> Result<()> {
    conn.execute(
        &format!(
            "DROP TABLE IF EXISTS {}",
            current_files_table_name(service_id)
        ),
        [],
    )?;

    Ok(())
}

/// Record what is known about a file.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn set_file_info(
    conn: &Connection,
    hash_id: HashId,
    mime: Mime,
    size: Option<i64>,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO files_info ( hash_id, mime, size ) VALUES ( ?1, ?2, ?3 )",
        params![hash_id, mime.as_i64(), size],
    )?;

    Ok(())
}

/// Mime of a file, if the file is known at all.
///
/// # Errors
///
/// Returns an error if the query fails or the stored code is unrecognised.
pub fn mime_of(conn: &Connection, hash_id: HashId) -> Result<Option<Mime>> {
    let code: Option<i64> = conn
        .query_row(
            "SELECT mime FROM files_info WHERE hash_id = ?1",
            [hash_id],
            |row| row.get(0),
        )
        .optional()?;

    match code {
        None => Ok(None),
        Some(code) => Mime::from_i64(code)
            .map(Some)
            .ok_or(LedgerError::UnknownMime(code)),
    }
}

/// Mark a file as currently present in a service's domain.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn add_current(conn: &Connection, service_id: ServiceId, hash_id: HashId) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR IGNORE INTO {} ( hash_id, timestamp ) VALUES ( ?1, ?2 )",
            current_files_table_name(service_id)
        ),
        params![hash_id, Utc::now().to_rfc3339()],
    )?;

    Ok(())
}

/// Remove a file from a service's domain.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn remove_current(conn: &Connection, service_id: ServiceId, hash_id: HashId) -> Result<()> {
    conn.execute(
        &format!(
            "DELETE FROM {} WHERE hash_id = ?1",
            current_files_table_name(service_id)
        ),
        [hash_id],
    )?;

    Ok(())
}

/// Of `hash_ids`, the subset currently present in the service's domain.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn filter_current(
    conn: &Connection,
    service_id: ServiceId,
    hash_ids: &HashSet<HashId>,
) -> Result<HashSet<HashId>> {
    if hash_ids.is_empty() {
        return Ok(HashSet::new());
    }

    with_temp_integer_table(conn, "hash_id", hash_ids.iter().copied(), |conn, temp| {
        let mut stmt = conn.prepare(&format!(
            "SELECT hash_id FROM {temp} CROSS JOIN {} USING ( hash_id )",
            current_files_table_name(service_id)
        ))?;
        let present = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;

        Ok(present)
    })
}

/// Queue maintenance work for files. Already-queued pairs are ignored.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn enqueue_jobs(
    conn: &Connection,
    hash_ids: &[HashId],
    job_type: MaintenanceJobType,
) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO file_maintenance_jobs ( hash_id, job_type, time_added )
         VALUES ( ?1, ?2, ?3 )",
    )?;
    let now = Utc::now().to_rfc3339();
    for &hash_id in hash_ids {
        stmt.execute(params![hash_id, job_type.as_i64(), now])?;
    }

    Ok(())
}

/// Pending maintenance work of one type, in hash-id order.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn jobs_of_type(conn: &Connection, job_type: MaintenanceJobType) -> Result<Vec<HashId>> {
    let mut stmt = conn.prepare(
        "SELECT hash_id FROM file_maintenance_jobs WHERE job_type = ?1 ORDER BY hash_id",
    )?;
    let ids = stmt
        .query_map([job_type.as_i64()], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(ids)
}
