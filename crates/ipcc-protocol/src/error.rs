//! Error types for protocol operations

use ipcc_crypto::CryptoError;
use reqwest::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status: {0}")]
    HttpStatus(StatusCode),

    #[error("Service unavailable")]
    ServiceUnavailable,

    #[error("Requested range not satisfiable")]
    RangeNotSatisfiable,

    #[error("Timeout")]
    Timeout,

    #[error("Response body ended early: expected {expected} bytes, have {actual}")]
    IncompleteBody { expected: u64, actual: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("No key found for {build_train}_{build_id} ({identifier})")]
    KeyNotFound {
        build_train: String,
        build_id: String,
        identifier: String,
    },

    #[error("Download failed after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Hash mismatch for {}", path.display())]
    HashMismatch { path: PathBuf },

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl ProtocolError {
    /// Check if a download attempt that failed with this error may be retried.
    ///
    /// Only interruptions of an otherwise healthy transfer qualify: timeouts,
    /// body stream failures and local write failures. Status errors and
    /// connection-level failures are final for the attempt loop.
    pub fn should_retry(&self) -> bool {
        match self {
            Self::Timeout | Self::IncompleteBody { .. } | Self::Io(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_body() || e.is_decode(),
            _ => false,
        }
    }

    /// The remote side definitively refused to serve the object
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable)
    }
}

impl From<tokio::task::JoinError> for ProtocolError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Io(std::io::Error::other(err))
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
