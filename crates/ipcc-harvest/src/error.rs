//! Error types for the harvesting pipeline.

use ipcc_crypto::CryptoError;
use ipcc_protocol::ProtocolError;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while processing one firmware version.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Catalog, download or key lookup failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Hashing or image decryption failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The firmware archive could not be read
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// A ledger document is not valid JSON
    #[error("Invalid JSON in {}: {source}", path.display())]
    Json {
        /// Offending document
        path: PathBuf,
        /// Parser error
        #[source]
        source: serde_json::Error,
    },

    /// The archive holds no disk image member
    #[error("No disk image found in {}", archive.display())]
    NoImagePayload {
        /// Archive that was searched
        archive: PathBuf,
    },

    /// An external tool exited unsuccessfully
    #[error("{tool} failed (exit code {code:?}): {stderr}")]
    ToolFailed {
        /// Tool name
        tool: String,
        /// Exit code, if the process exited normally
        code: Option<i32>,
        /// Captured standard error
        stderr: String,
    },

    /// An external tool is missing and could not be installed
    #[error("Required tool unavailable: {0}")]
    ToolUnavailable(String),

    /// BuildManifest.plist has no BuildTrain entry
    #[error("BuildTrain was not found in BuildManifest.plist")]
    BuildTrainMissing,

    /// The image listing reported a nested layout but no `*/System` directory was unpacked
    #[error("No nested 'System' folder found")]
    NestedSystemMissing,

    /// A blocking task panicked or was cancelled
    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Command-line or environment configuration is inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Why a version is permanently skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The archive has no disk image to unpack
    NoImagePayload,
    /// The download server refused the archive outright
    ServiceUnavailable,
    /// No legacy decryption key is published for the build
    KeyNotFound,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoImagePayload => write!(f, "no disk image payload"),
            Self::ServiceUnavailable => write!(f, "service unavailable"),
            Self::KeyNotFound => write!(f, "decryption key not found"),
        }
    }
}

/// How the orchestrator treats a failed version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Worth another attempt on the next run
    Transient,
    /// Record the version as ignored
    Ignore(IgnoreReason),
    /// Abort this version only
    Fatal,
}

impl HarvestError {
    /// Classify the error for the orchestrator.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::NoImagePayload { .. } => Disposition::Ignore(IgnoreReason::NoImagePayload),
            Self::Protocol(ProtocolError::ServiceUnavailable) => {
                Disposition::Ignore(IgnoreReason::ServiceUnavailable)
            }
            Self::Protocol(ProtocolError::KeyNotFound { .. }) => {
                Disposition::Ignore(IgnoreReason::KeyNotFound)
            }
            Self::Protocol(ProtocolError::RetriesExhausted { .. }) => Disposition::Transient,
            Self::Protocol(e) if e.should_retry() => Disposition::Transient,
            _ => Disposition::Fatal,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}

/// Result type for harvesting operations.
pub type Result<T> = std::result::Result<T, HarvestError>;
