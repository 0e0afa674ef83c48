//! Cryptographic primitives for firmware acquisition
//!
//! This crate provides:
//! - Streaming SHA-1 and MD5 digests for archive verification
//! - Decryption of chunk-encrypted disk images (V1 trailer and V2 header
//!   formats) using AES-128-CBC with HMAC-SHA1 derived per-chunk IVs
//!
//! # Example
//!
//! ```no_run
//! use ipcc_crypto::{HashVerifier, decrypt_image};
//! use std::path::Path;
//!
//! let verifier = HashVerifier::default();
//! let ok = verifier.matches_either(Path::new("fw.ipsw"), "sha1hex", "md5hex")?;
//!
//! let key = "00112233445566778899aabbccddeeff0123456789abcdef0123456789abcdef01234567";
//! decrypt_image(Path::new("root.dmg"), Path::new("root.dmg.temp"), key)?;
//! # Ok::<(), ipcc_crypto::CryptoError>(())
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod hash;
pub mod vfdecrypt;

pub use error::{CryptoError, CryptoResult};
pub use hash::{HashAlgorithm, HashVerifier};
pub use vfdecrypt::{
    DecryptSummary, DerivedKeyMaterial, EncryptedImageBuilder, HeaderVersion, ImageHeader,
    decrypt_image,
};
