//! Per-service table naming and lifecycle.
//!
//! Each repository service gets five tables, named deterministically from
//! its service id. Three live in the client database (the update ledger
//! proper); the two definition maps live in the attached master database
//! so they survive client-database recovery.

use rusqlite::Connection;

use crate::error::Result;
use crate::model::ServiceId;

/// The five table names for one repository service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryTableNames {
    /// `(update_index, hash_id)` - every update blob the remote has published.
    pub updates: String,
    /// `(hash_id)` - updates whose file or mime is not yet locally known.
    pub unregistered: String,
    /// `(hash_id, content_type, processed)` - the processing ledger.
    pub processed: String,
    /// `(service_hash_id, hash_id)` - remote hash id to local intern id.
    pub hash_id_map: String,
    /// `(service_tag_id, tag_id)` - remote tag id to local intern id.
    pub tag_id_map: String,
}

/// Deterministic table names for a service id.
#[must_use]
pub fn repository_table_names(service_id: ServiceId) -> RepositoryTableNames {
    let suffix = service_id.0;

    RepositoryTableNames {
        updates: format!("repository_updates_{suffix}"),
        unregistered: format!("repository_unregistered_updates_{suffix}"),
        processed: format!("repository_updates_processed_{suffix}"),
        hash_id_map: format!("external_master.repository_hash_id_map_{suffix}"),
        tag_id_map: format!("external_master.repository_tag_id_map_{suffix}"),
    }
}

/// Create the five tables and their indices for a service. Idempotent.
///
/// # Errors
///
/// Returns an error if any DDL statement fails.
pub fn create_repository_tables(conn: &Connection, service_id: ServiceId) -> Result<()> {
    let names = repository_table_names(service_id);
    let suffix = service_id.0;

    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS {updates} (
            update_index INTEGER NOT NULL,
            hash_id INTEGER NOT NULL,
            PRIMARY KEY (update_index, hash_id)
        );
        CREATE INDEX IF NOT EXISTS idx_repository_updates_{suffix}_hash_id
            ON {updates}(hash_id);

        CREATE TABLE IF NOT EXISTS {unregistered} (
            hash_id INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS {processed} (
            hash_id INTEGER NOT NULL,
            content_type INTEGER NOT NULL,
            processed INTEGER NOT NULL,
            PRIMARY KEY (hash_id, content_type)
        );
        CREATE INDEX IF NOT EXISTS idx_repository_updates_processed_{suffix}_content_type
            ON {processed}(content_type);

        CREATE TABLE IF NOT EXISTS {hash_id_map} (
            service_hash_id INTEGER PRIMARY KEY,
            hash_id INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS {tag_id_map} (
            service_tag_id INTEGER PRIMARY KEY,
            tag_id INTEGER NOT NULL
        );
        ",
        updates = names.updates,
        unregistered = names.unregistered,
        processed = names.processed,
        hash_id_map = names.hash_id_map,
        tag_id_map = names.tag_id_map,
    ))?;

    Ok(())
}

/// Drop all five tables for a service.
///
/// # Errors
///
/// Returns an error if any DDL statement fails.
pub fn drop_repository_tables(conn: &Connection, service_id: ServiceId) -> Result<()> {
    let names = repository_table_names(service_id);

    for table in [
        &names.updates,
        &names.unregistered,
        &names.processed,
        &names.hash_id_map,
        &names.tag_id_map,
    ] {
        conn.execute(&format!("DROP TABLE IF EXISTS {table}"), [])?;
    }

    Ok(())
}
