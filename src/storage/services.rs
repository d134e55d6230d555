//! Service registry rows.
//!
//! Maps service keys (remote-facing byte identifiers) to local integer
//! ids and service types. The reserved local-updates service, which owns
//! the downloaded update files, is seeded at open.

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{LedgerError, Result};
use crate::model::{ServiceId, ServiceType};
use crate::storage::files;

/// Reserved key of the local domain holding downloaded update files.
pub const LOCAL_UPDATES_SERVICE_KEY: &[u8] = b"local updates";

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut out, byte| {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
        out
    })
}

/// Insert a service row.
///
/// # Errors
///
/// Returns an error if the key already exists or the insert fails.
pub fn add_service(
    conn: &Connection,
    service_key: &[u8],
    service_type: ServiceType,
    name: &str,
) -> Result<ServiceId> {
    conn.execute(
        "INSERT INTO services ( service_key, service_type, name ) VALUES ( ?1, ?2, ?3 )",
        params![service_key, service_type.as_i64(), name],
    )?;

    Ok(ServiceId(conn.last_insert_rowid()))
}

/// Delete a service row.
///
/// # Errors
///
/// Returns an error if the delete fails.
pub fn remove_service(conn: &Connection, service_id: ServiceId) -> Result<()> {
    conn.execute(
        "DELETE FROM services WHERE service_id = ?1",
        [service_id.0],
    )?;

    Ok(())
}

/// Look up a service id by key.
///
/// # Errors
///
/// Returns [`LedgerError::ServiceUnknown`] if the key is not registered.
pub fn service_id(conn: &Connection, service_key: &[u8]) -> Result<ServiceId> {
    conn.query_row(
        "SELECT service_id FROM services WHERE service_key = ?1",
        [service_key],
        |row| row.get(0),
    )
    .optional()?
    .map(ServiceId)
    .ok_or_else(|| LedgerError::ServiceUnknown {
        service: format!("key {}", hex(service_key)),
    })
}

/// Look up a service key by id.
///
/// # Errors
///
/// Returns [`LedgerError::ServiceUnknown`] if the id is not registered.
pub fn service_key(conn: &Connection, service_id: ServiceId) -> Result<Vec<u8>> {
    conn.query_row(
        "SELECT service_key FROM services WHERE service_id = ?1",
        [service_id.0],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| LedgerError::ServiceUnknown {
        service: format!("id {service_id}"),
    })
}

/// Look up a service type by id.
///
/// # Errors
///
/// Returns [`LedgerError::ServiceUnknown`] if the id is not registered, or
/// [`LedgerError::UnknownServiceType`] on an unrecognised stored code.
pub fn service_type(conn: &Connection, service_id: ServiceId) -> Result<ServiceType> {
    let code: Option<i64> = conn
        .query_row(
            "SELECT service_type FROM services WHERE service_id = ?1",
            [service_id.0],
            |row| row.get(0),
        )
        .optional()?;

    match code {
        None => Err(LedgerError::ServiceUnknown {
            service: format!("id {service_id}"),
        }),
        Some(code) => ServiceType::from_i64(code).ok_or(LedgerError::UnknownServiceType(code)),
    }
}

/// Ids of every subscribed repository service, in id order.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn repository_service_ids(conn: &Connection) -> Result<Vec<ServiceId>> {
    let mut stmt = conn.prepare(
        "SELECT service_id FROM services WHERE service_type IN ( ?1, ?2 ) ORDER BY service_id",
    )?;
    let ids = stmt
        .query_map(
            params![
                ServiceType::FileRepository.as_i64(),
                ServiceType::TagRepository.as_i64()
            ],
            |row| row.get(0).map(ServiceId),
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(ids)
}

/// Id of the reserved local-updates service.
///
/// # Errors
///
/// Returns [`LedgerError::ServiceUnknown`] if the store was never seeded.
pub fn local_update_service_id(conn: &Connection) -> Result<ServiceId> {
    service_id(conn, LOCAL_UPDATES_SERVICE_KEY)
}

/// Seed the local-updates service if it does not exist yet.
///
/// # Errors
///
/// Returns an error if the insert or table creation fails.
pub fn ensure_local_update_service(conn: &Connection) -> Result<ServiceId> {
    match local_update_service_id(conn) {
        Ok(id) => return Ok(id),
        Err(LedgerError::ServiceUnknown { .. }) => {}
        Err(err) => return Err(err),
    }

    let id = add_service(
        conn,
        LOCAL_UPDATES_SERVICE_KEY,
        ServiceType::LocalUpdates,
        "local updates",
    )?;
    files::create_current_files_table(conn, id)?;

    Ok(id)
}
