//! Store configuration and path resolution.
//!
//! A store directory holds two databases: the client database (update
//! tables, service registry, file info) and the master database (intern
//! caches and definition maps), which is attached so definition maps
//! survive client-database recovery. Filenames and tuning knobs come from
//! an optional `metadata.json` in the store directory.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default client database filename used when metadata is missing.
const DEFAULT_CLIENT_DB_FILENAME: &str = "client.db";
/// Default master database filename used when metadata is missing.
const DEFAULT_MASTER_DB_FILENAME: &str = "client.master.db";

/// Environment variable overriding the store directory.
pub const STORE_DIR_ENV: &str = "UPDATE_LEDGER_DIR";

/// Pairs interned and written per definition-ingestion chunk.
pub const DEFAULT_DEFINITION_CHUNK_SIZE: usize = 50;
/// Unprocessed-row count at which a content type counts as "lots" of
/// outstanding work. A pacing heuristic, not an invariant.
pub const DEFAULT_OUTSTANDING_WORK_THRESHOLD: usize = 20;

/// Startup metadata describing database filenames and tuning overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreMetadata {
    pub database: String,
    pub master_database: String,
    #[serde(default)]
    pub definition_chunk_size: Option<usize>,
    #[serde(default)]
    pub outstanding_work_threshold: Option<usize>,
}

impl Default for StoreMetadata {
    fn default() -> Self {
        Self {
            database: DEFAULT_CLIENT_DB_FILENAME.to_string(),
            master_database: DEFAULT_MASTER_DB_FILENAME.to_string(),
            definition_chunk_size: None,
            outstanding_work_threshold: None,
        }
    }
}

impl StoreMetadata {
    /// Load `metadata.json` from the store directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(store_dir: &Path) -> Result<Self> {
        let path = store_dir.join("metadata.json");
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(&path)?;
        let mut metadata: Self = serde_json::from_str(&contents)?;

        if metadata.database.trim().is_empty() {
            metadata.database = DEFAULT_CLIENT_DB_FILENAME.to_string();
        }
        if metadata.master_database.trim().is_empty() {
            metadata.master_database = DEFAULT_MASTER_DB_FILENAME.to_string();
        }

        Ok(metadata)
    }
}

/// Runtime tuning knobs for the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    pub definition_chunk_size: usize,
    pub outstanding_work_threshold: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            definition_chunk_size: DEFAULT_DEFINITION_CHUNK_SIZE,
            outstanding_work_threshold: DEFAULT_OUTSTANDING_WORK_THRESHOLD,
        }
    }
}

/// Resolved paths and tuning for one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub store_dir: PathBuf,
    pub client_db: PathBuf,
    pub master_db: PathBuf,
    pub tuning: Tuning,
}

impl StorePaths {
    /// Resolve database paths and tuning from the store directory's
    /// metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if metadata cannot be read.
    pub fn resolve(store_dir: &Path) -> Result<Self> {
        let metadata = StoreMetadata::load(store_dir)?;

        let tuning = Tuning {
            definition_chunk_size: metadata
                .definition_chunk_size
                .unwrap_or(DEFAULT_DEFINITION_CHUNK_SIZE)
                .max(1),
            outstanding_work_threshold: metadata
                .outstanding_work_threshold
                .unwrap_or(DEFAULT_OUTSTANDING_WORK_THRESHOLD)
                .max(1),
        };

        Ok(Self {
            store_dir: store_dir.to_path_buf(),
            client_db: store_dir.join(&metadata.database),
            master_db: store_dir.join(&metadata.master_database),
            tuning,
        })
    }

    /// Resolve from the `UPDATE_LEDGER_DIR` environment variable, falling
    /// back to `default_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if metadata cannot be read.
    pub fn from_env(default_dir: &Path) -> Result<Self> {
        let dir = env::var_os(STORE_DIR_ENV).map_or_else(|| default_dir.to_path_buf(), PathBuf::from);
        Self::resolve(&dir)
    }
}
