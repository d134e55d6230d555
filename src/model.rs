//! Core data types for the update ledger.
//!
//! Everything here is plain data: closed enums with stable integer codes
//! (these are what the database stores), id newtypes/aliases, the network
//! metadata manifest, and the progress/readiness result types.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

/// Locally-assigned integer id of a subscribed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(pub i64);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local intern id of a content-addressed hash.
pub type HashId = i64;

/// Local intern id of a tag string.
pub type TagId = i64;

/// What payload kind an update blob carries.
///
/// `Definitions` is distinguished: definition blobs establish the
/// remote-id to local-id maps every other content type depends on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Definitions,
    Files,
    Mappings,
    TagParents,
    TagSiblings,
}

impl ContentType {
    /// All members, in code order.
    pub const ALL: [Self; 5] = [
        Self::Definitions,
        Self::Files,
        Self::Mappings,
        Self::TagParents,
        Self::TagSiblings,
    ];

    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Definitions => 1,
            Self::Files => 2,
            Self::Mappings => 3,
            Self::TagParents => 4,
            Self::TagSiblings => 5,
        }
    }

    #[must_use]
    pub fn from_i64(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Definitions),
            2 => Some(Self::Files),
            3 => Some(Self::Mappings),
            4 => Some(Self::TagParents),
            5 => Some(Self::TagSiblings),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Definitions => "definitions",
            Self::Files => "files",
            Self::Mappings => "mappings",
            Self::TagParents => "tag parents",
            Self::TagSiblings => "tag siblings",
        }
    }
}

/// The kind of service a subscription points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    FileRepository,
    TagRepository,
    /// The local domain that holds downloaded update files.
    LocalUpdates,
}

impl ServiceType {
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::FileRepository => 1,
            Self::TagRepository => 2,
            Self::LocalUpdates => 3,
        }
    }

    #[must_use]
    pub fn from_i64(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::FileRepository),
            2 => Some(Self::TagRepository),
            3 => Some(Self::LocalUpdates),
            _ => None,
        }
    }

    /// The content types this service's content blobs carry.
    ///
    /// Definition blobs always carry `Definitions` regardless of service
    /// type, so it is never listed here.
    #[must_use]
    pub fn content_types(self) -> &'static [ContentType] {
        match self {
            Self::FileRepository => &[ContentType::Files],
            Self::TagRepository => &[
                ContentType::Mappings,
                ContentType::TagParents,
                ContentType::TagSiblings,
            ],
            Self::LocalUpdates => &[],
        }
    }

    #[must_use]
    pub fn is_repository(self) -> bool {
        matches!(self, Self::FileRepository | Self::TagRepository)
    }
}

/// Mime of a stored update file, as reported by the file store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mime {
    UpdateDefinitions,
    UpdateContent,
}

impl Mime {
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::UpdateDefinitions => 1,
            Self::UpdateContent => 2,
        }
    }

    #[must_use]
    pub fn from_i64(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::UpdateDefinitions),
            2 => Some(Self::UpdateContent),
            _ => None,
        }
    }
}

/// File-maintenance work the ledger can queue for update files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceJobType {
    IntegrityData,
    Metadata,
}

impl MaintenanceJobType {
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::IntegrityData => 1,
            Self::Metadata => 2,
        }
    }

    #[must_use]
    pub fn from_i64(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::IntegrityData),
            2 => Some(Self::Metadata),
            _ => None,
        }
    }
}

/// Which intern-id family a reference-catalog query is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefinitionKind {
    Hash,
    Tag,
}

/// One row of a repository metadata manifest: an update index and the
/// hashes of the sibling blobs published at that index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRow {
    pub update_index: i64,
    pub update_hashes: Vec<Vec<u8>>,
}

/// The remote repository's description of its update history, either in
/// full (authoritative re-sync) or as an incremental slice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryMetadata {
    rows: Vec<MetadataRow>,
}

impl RepositoryMetadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, update_index: i64, update_hashes: Vec<Vec<u8>>) {
        self.rows.push(MetadataRow {
            update_index,
            update_hashes,
        });
    }

    #[must_use]
    pub fn rows(&self) -> &[MetadataRow] {
        &self.rows
    }

    /// Every update hash in the manifest, flattened in row order.
    pub fn update_hashes(&self) -> impl Iterator<Item = &[u8]> {
        self.rows
            .iter()
            .flat_map(|row| row.update_hashes.iter().map(Vec::as_slice))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Sync progress for one repository, by content type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepositoryProgress {
    pub num_local_updates: u64,
    pub num_total_updates: u64,
    pub processed_by_type: std::collections::BTreeMap<ContentType, u64>,
    pub total_by_type: std::collections::BTreeMap<ContentType, u64>,
}

/// One update blob ready for processing, with the content types still
/// outstanding for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutstandingUpdate {
    pub hash: Vec<u8>,
    pub content_types: BTreeSet<ContentType>,
}

/// The readiness oracle's answer: definition work first, content work
/// second, with first-pass flags the caller uses for pacing messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessableUpdates {
    pub first_definitions_work: bool,
    pub definition_updates: Vec<OutstandingUpdate>,
    pub first_content_work: bool,
    pub content_updates: Vec<OutstandingUpdate>,
}

/// Cooperative cancellation flag polled between ingestion chunks.
#[derive(Debug, Clone, Default)]
pub struct JobHandle {
    cancelled: Arc<AtomicBool>,
}

impl JobHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

type HashRows = Box<dyn Iterator<Item = (i64, Vec<u8>)> + Send>;
type TagRows = Box<dyn Iterator<Item = (i64, String)> + Send>;

/// The lazy key-value streams decoded from a definition blob.
///
/// Streams are consumed in place: a call that runs out of time hands the
/// partially-drained iterator back, so the next call resumes where the
/// last one stopped. A fully-drained stream is dropped.
#[derive(Default)]
pub struct DefinitionIterators {
    pub(crate) hash_rows: Option<HashRows>,
    pub(crate) tag_rows: Option<TagRows>,
}

impl DefinitionIterators {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the `service_hash_id -> hash bytes` stream.
    #[must_use]
    pub fn with_hash_rows<I>(mut self, rows: I) -> Self
    where
        I: IntoIterator<Item = (i64, Vec<u8>)>,
        I::IntoIter: Send + 'static,
    {
        self.hash_rows = Some(Box::new(rows.into_iter()));
        self
    }

    /// Attach the `service_tag_id -> tag string` stream.
    #[must_use]
    pub fn with_tag_rows<I>(mut self, rows: I) -> Self
    where
        I: IntoIterator<Item = (i64, String)>,
        I::IntoIter: Send + 'static,
    {
        self.tag_rows = Some(Box::new(rows.into_iter()));
        self
    }

    /// True once both streams have been fully consumed.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.hash_rows.is_none() && self.tag_rows.is_none()
    }
}

impl fmt::Debug for DefinitionIterators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefinitionIterators")
            .field("hash_rows", &self.hash_rows.is_some())
            .field("tag_rows", &self.tag_rows.is_some())
            .finish()
    }
}
