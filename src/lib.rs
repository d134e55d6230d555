//! `update_ledger` - Client-side sync ledger for remote content repositories
//!
//! This crate is the durable, transactional subsystem a repository client
//! uses to track, per subscribed remote repository, the ordered update
//! blobs that encode the repository's history, the per-blob per-content-type
//! processing state, and the maps from remote-assigned identifiers to local
//! intern ids.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`model`] - Data types (content types, service types, manifests, work units)
//! - [`storage`] - `SQLite` ledger layer
//! - [`config`] - Store paths and tuning
//! - [`error`] - Error types and handling
//! - [`logging`] - Tracing setup for embedding applications

#![forbid(unsafe_code)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod storage;

pub use config::{StoreMetadata, StorePaths, Tuning};
pub use error::{LedgerError, Result};
pub use model::{
    ContentType, DefinitionIterators, DefinitionKind, HashId, JobHandle, MaintenanceJobType,
    Mime, OutstandingUpdate, ProcessableUpdates, RepositoryMetadata, RepositoryProgress,
    ServiceId, ServiceType, TagId,
};
pub use storage::SqliteLedger;
