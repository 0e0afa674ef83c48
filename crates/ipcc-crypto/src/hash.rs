//! Streaming content digests for firmware archives and bundle artifacts
//!
//! Archives routinely exceed several gigabytes, so digests are computed by
//! reading the file in fixed-size blocks rather than loading it whole.

use digest::Digest;
use md5::Md5;
use sha1::Sha1;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::CryptoResult;

/// Default read block size (10 MB)
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 10_000;

/// Digest algorithms published by the firmware catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// SHA-1 (primary catalog checksum)
    Sha1,
    /// MD5 (fallback catalog checksum)
    Md5,
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha1 => write!(f, "sha1"),
            Self::Md5 => write!(f, "md5"),
        }
    }
}

/// Computes file digests and compares them against expected checksums
#[derive(Debug, Clone, Copy)]
pub struct HashVerifier {
    block_size: usize,
}

impl Default for HashVerifier {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl HashVerifier {
    /// Create a verifier that reads files in blocks of `block_size` bytes
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
        }
    }

    /// Compute the lowercase hex digest of the file at `path`
    pub fn digest(&self, path: &Path, algorithm: HashAlgorithm) -> CryptoResult<String> {
        let file = File::open(path)?;
        match algorithm {
            HashAlgorithm::Sha1 => self.digest_reader::<Sha1, _>(file),
            HashAlgorithm::Md5 => self.digest_reader::<Md5, _>(file),
        }
    }

    /// Check the file against a SHA-1 and an MD5 checksum.
    ///
    /// Returns `true` when the SHA-1 digest matches `expected_sha1` or the MD5
    /// digest matches `expected_md5`. The MD5 pass is skipped entirely when
    /// SHA-1 already matches. Read failures are errors, not mismatches.
    pub fn matches_either(
        &self,
        path: &Path,
        expected_sha1: &str,
        expected_md5: &str,
    ) -> CryptoResult<bool> {
        let sha1 = self.digest(path, HashAlgorithm::Sha1)?;
        if digest_eq(&sha1, expected_sha1) {
            return Ok(true);
        }

        let md5 = self.digest(path, HashAlgorithm::Md5)?;
        Ok(digest_eq(&md5, expected_md5))
    }

    fn digest_reader<D: Digest, R: Read>(&self, mut reader: R) -> CryptoResult<String> {
        let mut hasher = D::new();
        let mut buf = vec![0u8; self.block_size];

        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(hex::encode(hasher.finalize()))
    }
}

/// Catalog digests occasionally carry whitespace or uppercase hex.
fn digest_eq(computed: &str, expected: &str) -> bool {
    let expected = expected.trim();
    !expected.is_empty() && computed.eq_ignore_ascii_case(expected)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HELLO_SHA1: &str = "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed";
    const HELLO_MD5: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";

    fn hello_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("Operation should succeed");
        file.write_all(b"hello world").expect("Operation should succeed");
        file.flush().expect("Operation should succeed");
        file
    }

    #[test]
    fn test_known_digests() {
        let file = hello_file();
        let verifier = HashVerifier::default();

        assert_eq!(
            verifier.digest(file.path(), HashAlgorithm::Sha1).unwrap(),
            HELLO_SHA1
        );
        assert_eq!(
            verifier.digest(file.path(), HashAlgorithm::Md5).unwrap(),
            HELLO_MD5
        );
    }

    #[test]
    fn test_block_size_does_not_change_digest() {
        let file = hello_file();
        let tiny = HashVerifier::with_block_size(3);

        assert_eq!(tiny.digest(file.path(), HashAlgorithm::Sha1).unwrap(), HELLO_SHA1);
        assert_eq!(tiny.digest(file.path(), HashAlgorithm::Md5).unwrap(), HELLO_MD5);
    }

    #[test]
    fn test_matches_either() {
        let file = hello_file();
        let verifier = HashVerifier::default();

        assert!(verifier.matches_either(file.path(), HELLO_SHA1, "bogus").unwrap());
        assert!(verifier.matches_either(file.path(), "bogus", HELLO_MD5).unwrap());
        assert!(
            verifier
                .matches_either(file.path(), &format!(" {} ", HELLO_SHA1.to_uppercase()), "")
                .unwrap()
        );
        assert!(!verifier.matches_either(file.path(), "bogus", "bogus").unwrap());
        assert!(!verifier.matches_either(file.path(), "", "").unwrap());
    }

    #[test]
    fn test_missing_file_is_error() {
        let verifier = HashVerifier::default();
        let result = verifier.matches_either(Path::new("/nonexistent/file.ipsw"), HELLO_SHA1, HELLO_MD5);
        assert!(matches!(result, Err(crate::CryptoError::Io(_))));
    }
}
