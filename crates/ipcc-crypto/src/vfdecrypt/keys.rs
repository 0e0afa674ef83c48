//! Decryption key material

use std::fmt;

use crate::error::{CryptoError, CryptoResult};

/// AES-128 key size
pub const CIPHER_KEY_LENGTH: usize = 16;

/// HMAC-SHA1 key size
pub const MAC_KEY_LENGTH: usize = 20;

/// Combined key size as supplied by key services
pub const KEY_LENGTH: usize = CIPHER_KEY_LENGTH + MAC_KEY_LENGTH;

/// AES key and HMAC key split from a single hex string
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedKeyMaterial {
    /// AES-128 payload key
    pub cipher_key: [u8; CIPHER_KEY_LENGTH],
    /// HMAC-SHA1 key used to derive per-chunk IVs
    pub mac_key: [u8; MAC_KEY_LENGTH],
}

impl DerivedKeyMaterial {
    /// Parse a 72-character hex key into its two parts
    pub fn from_hex(key_hex: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(key_hex.trim())?;
        Self::from_bytes(&bytes)
    }

    /// Split 36 raw key bytes into the AES key and the HMAC key
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != KEY_LENGTH {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_LENGTH,
                actual: bytes.len(),
            });
        }

        let mut cipher_key = [0u8; CIPHER_KEY_LENGTH];
        let mut mac_key = [0u8; MAC_KEY_LENGTH];
        cipher_key.copy_from_slice(&bytes[..CIPHER_KEY_LENGTH]);
        mac_key.copy_from_slice(&bytes[CIPHER_KEY_LENGTH..]);

        Ok(Self {
            cipher_key,
            mac_key,
        })
    }

    /// Hex form accepted by [`Self::from_hex`]
    pub fn to_hex(&self) -> String {
        let mut out = hex::encode(self.cipher_key);
        out.push_str(&hex::encode(self.mac_key));
        out
    }
}

impl fmt::Debug for DerivedKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKeyMaterial")
            .field("cipher_key", &"<redacted>")
            .field("mac_key", &"<redacted>")
            .finish()
    }
}
