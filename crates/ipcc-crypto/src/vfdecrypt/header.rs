//! Encrypted disk image header structures and parsing
//!
//! Two header generations exist:
//! - **V1** is a 1276-byte trailer at the end of the file, terminated by the
//!   magic `cdsaencr`. The encrypted payload spans everything before it.
//! - **V2** is a header at the start of the file, opened by the magic
//!   `encrcdsa`, that declares the payload offset, size and chunk size.
//!
//! The key-derivation and wrapped-key fields are decoded but not used for
//! decryption; the final symmetric key is always supplied by the caller.

use binrw::io::{Cursor, Read, Seek, SeekFrom};
use binrw::{BinRead, BinWrite};
use std::fmt;

use super::DEFAULT_CHUNK_SIZE;
use crate::error::{CryptoError, CryptoResult};

/// Leading magic of a V2 image
pub const V2_MAGIC: [u8; 8] = *b"encrcdsa";

/// Trailing magic of a V1 image
pub const V1_MAGIC: [u8; 8] = *b"cdsaencr";

/// Size of the V1 trailer
pub const V1_HEADER_SIZE: usize = 1276;

/// Bytes read from the start of a V2 image before parsing
pub const V2_HEADER_SIZE: usize = 0x318 + 0x260;

/// Region between the payload descriptor and the KDF parameters in V2
pub const V2_RESERVED_SIZE: u32 = 0x260;

/// Upper bound for any variable-length header field
const MAX_FIELD_LEN: u32 = V2_HEADER_SIZE as u32;

const V1_KDF_OFFSET: u64 = 0x34;
const V1_UNWRAP_IV_OFFSET: u64 = 0x68;
const V1_HMAC_KEY_OFFSET: u64 = 0x1B4;
const V1_MAGIC_OFFSET: u64 = (V1_HEADER_SIZE - V1_MAGIC.len()) as u64;

/// Header generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderVersion {
    /// Trailer-based header
    V1,
    /// Leading header
    V2,
}

impl fmt::Display for HeaderVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => write!(f, "v1"),
            Self::V2 => write!(f, "v2"),
        }
    }
}

/// V1 trailer, parsed relative to the start of the trailer
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(big)]
pub struct V1Header {
    /// PBKDF2 iteration count
    #[brw(seek_before = SeekFrom::Start(V1_KDF_OFFSET))]
    pub kdf_iteration_count: u32,

    /// PBKDF2 salt length
    #[br(assert(kdf_salt_len <= MAX_FIELD_LEN, "V1 salt length out of range"))]
    pub kdf_salt_len: u32,

    /// PBKDF2 salt
    #[br(count = kdf_salt_len)]
    pub kdf_salt: Vec<u8>,

    /// IV used to unwrap the key blobs
    #[brw(seek_before = SeekFrom::Start(V1_UNWRAP_IV_OFFSET))]
    pub unwrap_iv: [u8; 32],

    /// Wrapped AES key length
    #[br(assert(wrapped_aes_key_len <= MAX_FIELD_LEN, "V1 wrapped AES key length out of range"))]
    pub wrapped_aes_key_len: u32,

    /// Wrapped AES key
    #[br(count = wrapped_aes_key_len)]
    pub wrapped_aes_key: Vec<u8>,

    /// Wrapped HMAC-SHA1 key length
    #[brw(seek_before = SeekFrom::Start(V1_HMAC_KEY_OFFSET))]
    #[br(assert(wrapped_hmac_key_len <= MAX_FIELD_LEN, "V1 wrapped HMAC key length out of range"))]
    pub wrapped_hmac_key_len: u32,

    /// Wrapped HMAC-SHA1 key
    #[br(count = wrapped_hmac_key_len)]
    pub wrapped_hmac_key: Vec<u8>,

    /// Trailing magic (`cdsaencr`)
    #[brw(seek_before = SeekFrom::Start(V1_MAGIC_OFFSET))]
    #[br(assert(magic == V1_MAGIC, "Invalid V1 magic"))]
    pub magic: [u8; 8],
}

/// V2 leading header
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(big)]
pub struct V2Header {
    /// Magic (`encrcdsa`)
    #[br(assert(signature == V2_MAGIC, "Invalid V2 magic"))]
    pub signature: [u8; 8],

    /// Header format version
    pub version: u32,

    /// Payload IV size
    pub enc_iv_size: u32,

    /// Payload cipher mode
    pub enc_mode: u32,

    /// Payload cipher algorithm
    pub enc_algorithm: u32,

    /// Payload key size in bits
    pub key_bits: u32,

    /// PRNG algorithm
    pub prng_algorithm: u32,

    /// PRNG key size in bits
    pub prng_key_bits: u32,

    /// Image UUID
    pub uuid: [u8; 16],

    /// Chunk size (zero selects the engine default)
    pub block_size: u32,

    /// Encrypted payload size
    pub data_size: u64,

    /// Encrypted payload offset
    pub data_offset: u64,

    /// Key-derivation algorithm
    #[brw(pad_before = V2_RESERVED_SIZE)]
    pub kdf_algorithm: u32,

    /// Key-derivation PRNG algorithm
    pub kdf_prng_algorithm: u32,

    /// PBKDF2 iteration count
    pub kdf_iteration_count: u32,

    /// PBKDF2 salt length
    #[br(assert(kdf_salt_len <= MAX_FIELD_LEN, "V2 salt length out of range"))]
    pub kdf_salt_len: u32,

    /// PBKDF2 salt
    #[br(count = kdf_salt_len)]
    pub kdf_salt: Vec<u8>,

    /// Key blob IV size
    #[br(assert(blob_enc_iv_size <= MAX_FIELD_LEN, "V2 blob IV size out of range"))]
    pub blob_enc_iv_size: u32,

    /// Key blob IV
    #[br(count = blob_enc_iv_size)]
    pub blob_enc_iv: Vec<u8>,

    /// Key blob cipher key size in bits
    pub blob_enc_key_bits: u32,

    /// Key blob cipher algorithm
    pub blob_enc_algorithm: u32,

    /// Key blob padding scheme
    pub blob_enc_padding: u32,

    /// Key blob cipher mode
    pub blob_enc_mode: u32,

    /// Encrypted key blob length
    #[br(assert(encrypted_keyblob_len <= MAX_FIELD_LEN, "V2 key blob length out of range"))]
    pub encrypted_keyblob_len: u32,

    /// Encrypted key blob
    #[br(count = encrypted_keyblob_len)]
    pub encrypted_keyblob: Vec<u8>,
}

/// Parsed header of either generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageHeader {
    /// Trailer-based header
    V1(V1Header),
    /// Leading header
    V2(V2Header),
}

/// Location and chunking of the encrypted payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadLayout {
    /// Byte offset of the first encrypted chunk
    pub data_offset: u64,
    /// Total encrypted payload size
    pub data_size: u64,
    /// Size of every chunk except possibly the last
    pub chunk_size: u64,
}

impl PayloadLayout {
    /// Create a layout, rejecting a zero chunk size
    pub fn new(data_offset: u64, data_size: u64, chunk_size: u64) -> CryptoResult<Self> {
        if chunk_size == 0 {
            return Err(CryptoError::ZeroChunkSize);
        }

        Ok(Self {
            data_offset,
            data_size,
            chunk_size,
        })
    }

    /// Number of chunks covering the payload
    pub fn chunk_count(&self) -> u64 {
        self.data_size.div_ceil(self.chunk_size)
    }

    /// Absolute byte range `(offset, len)` of chunk `index`
    pub fn chunk_range(&self, index: u64) -> Option<(u64, u64)> {
        let start = index.checked_mul(self.chunk_size)?;
        if start >= self.data_size {
            return None;
        }
        let len = self.chunk_size.min(self.data_size - start);
        Some((self.data_offset + start, len))
    }
}

impl ImageHeader {
    /// Detect the header generation and parse it.
    ///
    /// The V2 magic is checked first at offset 0; otherwise the last 8 bytes
    /// are checked for the V1 magic.
    pub fn read<R: Read + Seek>(reader: &mut R) -> CryptoResult<Self> {
        let file_size = reader.seek(SeekFrom::End(0))?;

        match detect_version(reader, file_size)? {
            HeaderVersion::V2 => {
                reader.seek(SeekFrom::Start(0))?;
                let mut buf = vec![0u8; V2_HEADER_SIZE];
                let n = read_up_to(reader, &mut buf)?;
                if n < V2_HEADER_SIZE {
                    return Err(CryptoError::HeaderTooShort {
                        expected: V2_HEADER_SIZE,
                        actual: n,
                    });
                }
                Ok(Self::V2(V2Header::read(&mut Cursor::new(buf))?))
            }
            HeaderVersion::V1 => {
                let trailer_len = V1_HEADER_SIZE as u64;
                if file_size < trailer_len {
                    return Err(CryptoError::HeaderTooShort {
                        expected: V1_HEADER_SIZE,
                        actual: file_size as usize,
                    });
                }
                reader.seek(SeekFrom::Start(file_size - trailer_len))?;
                let mut buf = vec![0u8; V1_HEADER_SIZE];
                reader.read_exact(&mut buf)?;
                Ok(Self::V1(V1Header::read(&mut Cursor::new(buf))?))
            }
        }
    }

    /// Header generation
    pub fn version(&self) -> HeaderVersion {
        match self {
            Self::V1(_) => HeaderVersion::V1,
            Self::V2(_) => HeaderVersion::V2,
        }
    }

    /// PBKDF2 iteration count
    pub fn kdf_iteration_count(&self) -> u32 {
        match self {
            Self::V1(h) => h.kdf_iteration_count,
            Self::V2(h) => h.kdf_iteration_count,
        }
    }

    /// PBKDF2 salt
    pub fn kdf_salt(&self) -> &[u8] {
        match self {
            Self::V1(h) => &h.kdf_salt,
            Self::V2(h) => &h.kdf_salt,
        }
    }

    /// Payload layout for a file of `file_size` bytes
    pub fn layout(&self, file_size: u64) -> CryptoResult<PayloadLayout> {
        match self {
            Self::V1(_) => PayloadLayout::new(
                0,
                file_size.saturating_sub(V1_HEADER_SIZE as u64),
                DEFAULT_CHUNK_SIZE,
            ),
            Self::V2(h) => {
                let chunk_size = if h.block_size == 0 {
                    DEFAULT_CHUNK_SIZE
                } else {
                    u64::from(h.block_size)
                };
                PayloadLayout::new(h.data_offset, h.data_size, chunk_size)
            }
        }
    }
}

/// Identify the header generation of an image
pub fn detect_version<R: Read + Seek>(reader: &mut R, file_size: u64) -> CryptoResult<HeaderVersion> {
    let mut magic = [0u8; 8];

    reader.seek(SeekFrom::Start(0))?;
    if read_up_to(reader, &mut magic)? == magic.len() && magic == V2_MAGIC {
        return Ok(HeaderVersion::V2);
    }

    if file_size >= magic.len() as u64 {
        reader.seek(SeekFrom::Start(file_size - magic.len() as u64))?;
        reader.read_exact(&mut magic)?;
        if magic == V1_MAGIC {
            return Ok(HeaderVersion::V1);
        }
    }

    Err(CryptoError::UnknownHeaderFormat)
}

/// Fill as much of `buf` as the reader allows, returning the byte count
pub(crate) fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_v1() -> V1Header {
        V1Header {
            kdf_iteration_count: 1000,
            kdf_salt_len: 20,
            kdf_salt: (0..20).collect(),
            unwrap_iv: [0x11; 32],
            wrapped_aes_key_len: 40,
            wrapped_aes_key: vec![0xAA; 40],
            wrapped_hmac_key_len: 48,
            wrapped_hmac_key: vec![0xBB; 48],
            magic: V1_MAGIC,
        }
    }

    fn sample_v2() -> V2Header {
        V2Header {
            signature: V2_MAGIC,
            version: 2,
            enc_iv_size: 16,
            enc_mode: 5,
            enc_algorithm: 0x8000_0001,
            key_bits: 128,
            prng_algorithm: 0x8000_0002,
            prng_key_bits: 160,
            uuid: [0x42; 16],
            block_size: 4096,
            data_size: 123_456,
            data_offset: V2_HEADER_SIZE as u64,
            kdf_algorithm: 103,
            kdf_prng_algorithm: 0,
            kdf_iteration_count: 1000,
            kdf_salt_len: 20,
            kdf_salt: vec![0x5A; 20],
            blob_enc_iv_size: 8,
            blob_enc_iv: vec![0x01; 8],
            blob_enc_key_bits: 192,
            blob_enc_algorithm: 17,
            blob_enc_padding: 7,
            blob_enc_mode: 6,
            encrypted_keyblob_len: 48,
            encrypted_keyblob: vec![0xC3; 48],
        }
    }

    fn encode<T>(value: &T) -> Vec<u8>
    where
        T: for<'a> BinWrite<Args<'a> = ()>,
    {
        let mut cursor = Cursor::new(Vec::new());
        value.write_be(&mut cursor).expect("Operation should succeed");
        cursor.into_inner()
    }

    #[test]
    fn test_v1_fixed_offsets() {
        let bytes = encode(&sample_v1());
        assert_eq!(bytes.len(), V1_HEADER_SIZE);
        assert_eq!(&bytes[0x34..0x38], &1000u32.to_be_bytes());
        assert_eq!(&bytes[0x38..0x3C], &20u32.to_be_bytes());
        assert_eq!(&bytes[0x88..0x8C], &40u32.to_be_bytes());
        assert_eq!(&bytes[0x1B4..0x1B8], &48u32.to_be_bytes());
        assert_eq!(&bytes[V1_HEADER_SIZE - 8..], b"cdsaencr");
    }

    #[test]
    fn test_v1_header_round_trip() {
        let header = sample_v1();
        let mut image = vec![0xEEu8; 4096];
        image.extend_from_slice(&encode(&header));

        let parsed = ImageHeader::read(&mut Cursor::new(&image)).expect("Operation should succeed");
        assert_eq!(parsed, ImageHeader::V1(header));

        let layout = parsed.layout(image.len() as u64).unwrap();
        assert_eq!(layout.data_offset, 0);
        assert_eq!(layout.data_size, 4096);
        assert_eq!(layout.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_v2_header_round_trip() {
        let header = sample_v2();
        let mut image = encode(&header);
        image.resize(V2_HEADER_SIZE + 64, 0);

        let parsed = ImageHeader::read(&mut Cursor::new(&image)).expect("Operation should succeed");
        assert_eq!(parsed, ImageHeader::V2(header));
        assert_eq!(parsed.version(), HeaderVersion::V2);
        assert_eq!(parsed.kdf_iteration_count(), 1000);
        assert_eq!(parsed.kdf_salt(), &[0x5A; 20]);

        let layout = parsed.layout(image.len() as u64).unwrap();
        assert_eq!(layout.data_offset, V2_HEADER_SIZE as u64);
        assert_eq!(layout.data_size, 123_456);
        assert_eq!(layout.chunk_size, 4096);
    }

    #[test]
    fn test_v2_zero_block_size_uses_default() {
        let mut header = sample_v2();
        header.block_size = 0;
        let layout = ImageHeader::V2(header).layout(0).unwrap();
        assert_eq!(layout.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_v2_magic_wins_over_v1_trailer() {
        let mut image = encode(&sample_v2());
        image.resize(V2_HEADER_SIZE, 0);
        image.extend_from_slice(&encode(&sample_v1()));

        let parsed = ImageHeader::read(&mut Cursor::new(&image)).unwrap();
        assert_eq!(parsed.version(), HeaderVersion::V2);
    }

    #[test]
    fn test_unknown_header() {
        let image = vec![0u8; 8192];
        let result = ImageHeader::read(&mut Cursor::new(&image));
        assert!(matches!(result, Err(CryptoError::UnknownHeaderFormat)));

        let result = ImageHeader::read(&mut Cursor::new(Vec::<u8>::new()));
        assert!(matches!(result, Err(CryptoError::UnknownHeaderFormat)));
    }

    #[test]
    fn test_truncated_v2_header() {
        let mut image = encode(&sample_v2());
        image.truncate(200);
        let result = ImageHeader::read(&mut Cursor::new(&image));
        assert!(matches!(
            result,
            Err(CryptoError::HeaderTooShort {
                expected: V2_HEADER_SIZE,
                actual: 200
            })
        ));
    }

    #[test]
    fn test_truncated_v1_trailer() {
        let mut image = vec![0u8; 100];
        image.extend_from_slice(&V1_MAGIC);
        let result = ImageHeader::read(&mut Cursor::new(&image));
        assert!(matches!(result, Err(CryptoError::HeaderTooShort { .. })));
    }

    #[test]
    fn test_oversized_length_field_is_malformed() {
        let mut bytes = encode(&sample_v1());
        bytes[0x38..0x3C].copy_from_slice(&u32::MAX.to_be_bytes());
        let result = ImageHeader::read(&mut Cursor::new(&bytes));
        assert!(matches!(result, Err(CryptoError::MalformedHeader(_))));
    }

    #[test]
    fn test_layout_chunk_ranges() {
        let layout = PayloadLayout::new(100, 10_000, 4096).unwrap();
        assert_eq!(layout.chunk_count(), 3);
        assert_eq!(layout.chunk_range(0), Some((100, 4096)));
        assert_eq!(layout.chunk_range(2), Some((100 + 8192, 10_000 - 8192)));
        assert_eq!(layout.chunk_range(3), None);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(matches!(
            PayloadLayout::new(0, 100, 0),
            Err(CryptoError::ZeroChunkSize)
        ));
    }
}
