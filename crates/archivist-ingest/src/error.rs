//! Error types for the ingestion pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection, timeout or body decoding failure talking to a remote.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The homeserver answered with a non-success status.
    #[error("homeserver returned {status}: {errcode}: {message}")]
    Http {
        status: u16,
        errcode: String,
        message: String,
    },

    /// A bounded retry loop gave up.
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: usize,
        last: Box<Error>,
    },

    /// An event could not be decrypted.
    #[error("decryption failed: {0}")]
    Decrypt(String),

    /// The crypto engine rejected an operation.
    #[error("crypto engine error: {0}")]
    Crypto(String),

    /// A checkpoint could not be written. Always fatal.
    #[error("failed to persist checkpoint {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A checkpoint exists but cannot be parsed.
    #[error("corrupt checkpoint {}: {reason}", path.display())]
    CorruptCheckpoint { path: PathBuf, reason: String },

    /// Delete of a document that is not in the index.
    #[error("document not found: {0}")]
    StorageNotFound(String),

    /// Search storage rejected an operation.
    #[error("search storage error: {0}")]
    Storage(String),

    /// Event model error.
    #[error("event error: {0}")]
    Event(#[from] archivist_core::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether continuing after this error risks divergent on-disk state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Persistence { .. } | Self::CorruptCheckpoint { .. })
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Whether the remote reported the target as missing.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::StorageNotFound(_) => true,
            Self::Http {
                status, errcode, ..
            } => *status == 404 || errcode == "M_NOT_FOUND",
            _ => false,
        }
    }
}
