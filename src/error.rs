//! Error types for ingestion, persistence and credential checks.

use thiserror::Error;

/// Upload extensions the parser accepts.
pub const ACCEPTED_EXTENSIONS: [&str; 4] = ["835", "dat", "csv", "edi"];

/// Errors that reject a whole upload or a single line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// File extension outside the allow-list.
    #[error("Unsupported format '{extension}': accepted extensions are .835, .dat, .csv, .edi")]
    UnsupportedFormat { extension: String },

    /// Upload larger than the configured limit.
    #[error("Upload too large: {size} bytes exceeds the {limit} byte limit")]
    UploadTooLarge { size: u64, limit: u64 },

    /// One line could not be parsed. Never fatal to the upload.
    #[error("Malformed record at position {position}: {reason}")]
    MalformedRecord { position: usize, reason: String },
}

impl IngestError {
    pub fn malformed(position: usize, reason: impl Into<String>) -> Self {
        IngestError::MalformedRecord {
            position,
            reason: reason.into(),
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised by bucket stores.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O error while preparing the store location
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Lock contention that outlasted the retry budget
    #[error("Persistence conflict in {operation}: gave up after {attempts} attempts ({elapsed_ms} ms)")]
    PersistenceConflict {
        operation: String,
        attempts: u32,
        elapsed_ms: u128,
    },
}

impl StoreError {
    /// Whether the error is transient lock contention worth retrying.
    pub fn is_lock_conflict(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::Database(db_err)) => {
                matches!(db_err.code().as_deref(), Some("5") | Some("6"))
                    || db_err.message().contains("database is locked")
                    || db_err.message().contains("database table is locked")
            }
            StoreError::Database(other) => other.to_string().contains("database is locked"),
            _ => false,
        }
    }
}

/// Errors in credential configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Stored secret is not in `sha256$iterations$salt$digest` form.
    #[error("Malformed stored secret for user '{username}'")]
    MalformedSecret { username: String },

    /// Rate limit configured as zero.
    #[error("Invalid auth configuration: {0}")]
    Config(String),
}
