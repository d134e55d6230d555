//! `SQLite` ledger layer.
//!
//! This module provides the persistence layer using `SQLite` with:
//! - An attached master database for intern caches and definition maps
//! - Transaction discipline for atomic writes
//! - Per-service dynamic tables for partition pruning
//! - A memoized outstanding-work cache for pacing queries
//!
//! # Submodules
//!
//! - [`schema`] - Base schema and the master attach
//! - [`tables`] - Per-service table naming and lifecycle
//! - [`services`] - Service registry rows
//! - [`files`] - Update-file info, locality tables, maintenance queue
//! - [`interning`] - Global hash and tag intern caches
//! - [`sqlite`] - Main `SQLite` ledger implementation

pub mod files;
pub mod interning;
pub mod schema;
pub mod services;
pub mod sqlite;
pub mod tables;

pub use sqlite::SqliteLedger;

use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::Connection;

use crate::error::Result;

/// Run `f` against a temporary single-column integer table filled with
/// `ids`. The table is dropped afterwards, error or not.
pub(crate) fn with_temp_integer_table<R>(
    conn: &Connection,
    column: &str,
    ids: impl IntoIterator<Item = i64>,
    f: impl FnOnce(&Connection, &str) -> Result<R>,
) -> Result<R> {
    static NEXT_SUFFIX: AtomicU64 = AtomicU64::new(0);

    let table = format!(
        "temp_int_{column}_{}",
        NEXT_SUFFIX.fetch_add(1, Ordering::Relaxed)
    );

    conn.execute(
        &format!("CREATE TEMP TABLE {table} ( {column} INTEGER PRIMARY KEY )"),
        [],
    )?;

    let fill_and_run = || -> Result<R> {
        let mut stmt = conn.prepare(&format!(
            "INSERT OR IGNORE INTO {table} ( {column} ) VALUES ( ?1 )"
        ))?;
        for id in ids {
            stmt.execute([id])?;
        }
        drop(stmt);
        f(conn, &table)
    };

    let result = fill_and_run();
    let _ = conn.execute(&format!("DROP TABLE IF EXISTS {table}"), []);
    result
}
