//! Encrypted disk image decryption
//!
//! Images carry either a V1 trailer or a V2 leading header (see [`header`]).
//! The payload is split into fixed-size chunks, each encrypted with
//! AES-128-CBC under an IV derived from the chunk index (see [`chunk`]).
//!
//! Decryption proceeds strictly in order: detect the header generation, parse
//! the header, validate the key, resolve the chunk size, then stream chunks.
//! Nothing is written to the output until the key has been validated.

pub mod builder;
pub mod chunk;
pub mod header;
pub mod keys;

pub use builder::EncryptedImageBuilder;
pub use chunk::{ChunkCipher, ChunkDecryptor};
pub use header::{HeaderVersion, ImageHeader, PayloadLayout, V1Header, V2Header};
pub use keys::DerivedKeyMaterial;

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::CryptoResult;
use chunk::{BLOCK_SIZE, padded_len};
use header::read_up_to;

/// Chunk size used by V1 images and by V2 images declaring zero
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024 * 1024;

/// Read granularity within a chunk
const SLICE_SIZE: usize = 1024 * 1024;

/// Outcome of a decryption run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecryptSummary {
    /// Header generation of the input
    pub version: HeaderVersion,
    /// Chunks processed, including a final partial one
    pub chunks: u64,
    /// Plaintext bytes written
    pub bytes_written: u64,
    /// The input ended before the declared payload size
    pub truncated: bool,
}

/// Decrypt the image at `input` into `output` using a hex key
pub fn decrypt_image(input: &Path, output: &Path, key_hex: &str) -> CryptoResult<DecryptSummary> {
    let mut reader = BufReader::new(File::open(input)?);
    let file_size = reader.seek(SeekFrom::End(0))?;

    let header = ImageHeader::read(&mut reader)?;
    let keys = DerivedKeyMaterial::from_hex(key_hex)?;
    let layout = header.layout(file_size)?;

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(output)?);

    let (chunks, bytes_written, truncated) = decrypt_payload(&mut reader, &mut writer, &layout, &keys)?;
    writer.flush()?;

    Ok(DecryptSummary {
        version: header.version(),
        chunks,
        bytes_written,
        truncated,
    })
}

/// Stream the payload described by `layout` from `reader` to `writer`.
///
/// Returns `(chunks, bytes_written, truncated)`. A short read is treated as the
/// final chunk: it is zero-padded for decryption and only the bytes actually
/// read are emitted.
pub fn decrypt_payload<R: Read + Seek, W: Write>(
    reader: &mut R,
    writer: &mut W,
    layout: &PayloadLayout,
    keys: &DerivedKeyMaterial,
) -> CryptoResult<(u64, u64, bool)> {
    let cipher = ChunkCipher::new(keys)?;
    let mut buf = vec![0u8; SLICE_SIZE.min(padded_len(layout.chunk_size as usize)).max(BLOCK_SIZE)];
    let mut written = 0u64;
    let mut chunks = 0u64;

    reader.seek(SeekFrom::Start(layout.data_offset))?;

    for index in 0..layout.chunk_count() {
        let Some((_, chunk_len)) = layout.chunk_range(index) else {
            break;
        };

        let mut decryptor = cipher.decryptor(index as u32);
        let mut remaining = chunk_len;
        let mut touched = false;

        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = read_up_to(reader, &mut buf[..want])?;
            if n == 0 {
                return Ok((chunks + u64::from(touched), written, true));
            }
            touched = true;

            let padded = padded_len(n);
            buf[n..padded].fill(0);
            decryptor.decrypt_blocks(&mut buf[..padded]);
            writer.write_all(&buf[..n])?;

            written += n as u64;
            remaining -= n as u64;

            if n < want {
                return Ok((chunks + 1, written, true));
            }
        }

        chunks += 1;
    }

    Ok((chunks, written, false))
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::CryptoError;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const KEY_HEX: &str = "00112233445566778899aabbccddeeff0123456789abcdef0123456789abcdef01234567";

    fn keys() -> DerivedKeyMaterial {
        DerivedKeyMaterial::from_hex(KEY_HEX).expect("Operation should succeed")
    }

    fn plaintext(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn write_image(dir: &TempDir, name: &str, image: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, image).expect("Operation should succeed");
        path
    }

    #[test]
    fn test_decrypt_v2_image() {
        let dir = TempDir::new().unwrap();
        let plain = plaintext(4096 * 3 + 512);
        let image = EncryptedImageBuilder::new(keys())
            .with_chunk_size(4096)
            .build(&plain)
            .unwrap();
        let input = write_image(&dir, "in.dmg", &image);
        let output = dir.path().join("out/decrypted.dmg");

        let summary = decrypt_image(&input, &output, KEY_HEX).expect("Operation should succeed");
        assert_eq!(summary.version, HeaderVersion::V2);
        assert_eq!(summary.chunks, 4);
        assert!(!summary.truncated);
        assert_eq!(fs::read(&output).unwrap(), plain);
    }

    #[test]
    fn test_decrypt_v1_image() {
        let dir = TempDir::new().unwrap();
        let plain = plaintext(10_000 * 16);
        let image = EncryptedImageBuilder::new(keys())
            .with_version(HeaderVersion::V1)
            .build(&plain)
            .unwrap();
        let input = write_image(&dir, "in.dmg", &image);
        let output = dir.path().join("decrypted.dmg");

        let summary = decrypt_image(&input, &output, KEY_HEX).unwrap();
        assert_eq!(summary.version, HeaderVersion::V1);
        assert_eq!(summary.chunks, 1);
        assert_eq!(summary.bytes_written, plain.len() as u64);
        assert_eq!(fs::read(&output).unwrap(), plain);
    }

    #[test]
    fn test_chunk_larger_than_slice() {
        let mut reader_image = Vec::new();
        let cipher = ChunkCipher::new(&keys()).unwrap();
        let plain = plaintext(SLICE_SIZE * 2 + 64);
        reader_image.extend_from_slice(&cipher.encrypt_chunk(0, &plain));

        let layout = PayloadLayout::new(0, plain.len() as u64, DEFAULT_CHUNK_SIZE).unwrap();
        let mut out = Vec::new();
        let (chunks, written, truncated) =
            decrypt_payload(&mut std::io::Cursor::new(reader_image), &mut out, &layout, &keys()).unwrap();

        assert_eq!((chunks, written, truncated), (1, plain.len() as u64, false));
        assert_eq!(out, plain);
    }

    #[test]
    fn test_short_read_is_final_chunk() {
        let plain = plaintext(4096 * 2);
        let cipher = ChunkCipher::new(&keys()).unwrap();
        let mut data = cipher.encrypt_chunk(0, &plain[..4096]);
        data.extend_from_slice(&cipher.encrypt_chunk(1, &plain[4096..]));
        // Header claims three chunks; only 1.5 are present, ending mid-block
        data.truncate(4096 + 1000);

        let layout = PayloadLayout::new(0, 4096 * 3, 4096).unwrap();
        let mut out = Vec::new();
        let (chunks, written, truncated) =
            decrypt_payload(&mut std::io::Cursor::new(data), &mut out, &layout, &keys()).unwrap();

        assert!(truncated);
        assert_eq!(chunks, 2);
        assert_eq!(written, 4096 + 1000);
        assert_eq!(&out[..4096 + 992], &plain[..4096 + 992]);
    }

    #[test]
    fn test_wrong_key_length_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let image = EncryptedImageBuilder::new(keys()).build(&plaintext(64)).unwrap();
        let input = write_image(&dir, "in.dmg", &image);
        let output = dir.path().join("out.dmg");

        let result = decrypt_image(&input, &output, &KEY_HEX[..40]);
        assert!(matches!(result, Err(CryptoError::InvalidKeyLength { .. })));
        assert!(!output.exists());
    }

    #[test]
    fn test_unrecognised_input() {
        let dir = TempDir::new().unwrap();
        let input = write_image(&dir, "plain.dmg", &plaintext(8192));
        let output = dir.path().join("out.dmg");

        let result = decrypt_image(&input, &output, KEY_HEX);
        assert!(matches!(result, Err(CryptoError::UnknownHeaderFormat)));
        assert!(!output.exists());
    }

    #[test]
    fn test_wrong_key_produces_garbage_not_error() {
        let dir = TempDir::new().unwrap();
        let plain = plaintext(256);
        let image = EncryptedImageBuilder::new(keys()).build(&plain).unwrap();
        let input = write_image(&dir, "in.dmg", &image);
        let output = dir.path().join("out.dmg");

        let other = "ff".repeat(36);
        decrypt_image(&input, &output, &other).expect("Operation should succeed");
        assert_ne!(fs::read(&output).unwrap(), plain);
    }
}
