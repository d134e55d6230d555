#![allow(dead_code)]

use std::sync::Once;

use rusqlite::Connection;
use tempfile::TempDir;
use update_ledger::{SqliteLedger, StorePaths};

pub mod fixtures;

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        update_ledger::logging::init_test_logging();
    });
}

pub fn test_ledger() -> SqliteLedger {
    init_test_logging();
    SqliteLedger::open_memory().expect("Failed to create test ledger")
}

pub fn test_ledger_with_dir() -> (SqliteLedger, TempDir) {
    init_test_logging();
    let dir = TempDir::new().expect("Failed to create temp dir");
    let ledger = open_in_dir(&dir);
    (ledger, dir)
}

pub fn open_in_dir(dir: &TempDir) -> SqliteLedger {
    let paths = StorePaths::resolve(dir.path()).expect("Failed to resolve store paths");
    SqliteLedger::open(&paths).expect("Failed to open test ledger")
}

/// Second connection onto a file-backed store, master attached, for
/// white-box assertions and fault injection.
pub fn open_raw(dir: &TempDir) -> Connection {
    let paths = StorePaths::resolve(dir.path()).expect("Failed to resolve store paths");
    let conn = Connection::open(&paths.client_db).expect("Failed to open raw connection");
    let master = paths.master_db.to_string_lossy().into_owned();
    conn.execute("ATTACH DATABASE ?1 AS external_master", [master])
        .expect("Failed to attach master database");
    conn
}
