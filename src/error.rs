//! Error types and handling.

use thiserror::Error;

/// Core error type for the update ledger.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Database errors
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Store metadata could not be parsed
    #[error("store metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Service key or id not known to the registry
    #[error("service not found: {service}")]
    ServiceUnknown { service: String },

    /// A definition reference resolved to nothing. The remedial state
    /// (definition reprocess + update-file checks) was committed before
    /// this error was raised.
    #[error(
        "critical repository definition error ({kind}: {bad_ids:?}): the repository should be \
         paused and its update files checked for integrity and metadata; once the checks pass, \
         definition blobs will be reprocessed and the missing entries refilled"
    )]
    CriticalDefinition {
        kind: &'static str,
        bad_ids: Vec<i64>,
    },

    /// Tag string too long to intern
    #[error("tag is too long to intern ({len} bytes, max {max})")]
    TagTooLarge { len: usize, max: usize },

    /// A content-type code in the database is not a member of the enum
    #[error("unrecognised content type code: {0}")]
    UnknownContentType(i64),

    /// A mime code in the database is not a member of the enum
    #[error("unrecognised mime code: {0}")]
    UnknownMime(i64),

    /// A service-type code in the database is not a member of the enum
    #[error("unrecognised service type code: {0}")]
    UnknownServiceType(i64),
}

/// Result type alias using the ledger's error type.
pub type Result<T> = std::result::Result<T, LedgerError>;
