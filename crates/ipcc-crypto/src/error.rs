//! Error types for cryptographic operations

use thiserror::Error;

/// Errors that can occur while hashing or decrypting disk images
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Neither the V2 leading magic nor the V1 trailing magic was found
    #[error("Unknown encrypted image header format")]
    UnknownHeaderFormat,

    /// The file ended before a complete header could be read
    #[error("Header too short: expected {expected} bytes, got {actual}")]
    HeaderTooShort {
        /// Bytes required for the header
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Header fields could not be decoded
    #[error("Malformed header: {0}")]
    MalformedHeader(#[from] binrw::Error),

    /// Decoded key material has the wrong length
    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Expected key size in bytes
        expected: usize,
        /// Actual key size in bytes
        actual: usize,
    },

    /// Key string is not valid hex
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    /// Chunk size of zero would never advance through the payload
    #[error("Invalid chunk size (zero)")]
    ZeroChunkSize,

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<hex::FromHexError> for CryptoError {
    fn from(err: hex::FromHexError) -> Self {
        Self::InvalidKeyFormat(err.to_string())
    }
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
