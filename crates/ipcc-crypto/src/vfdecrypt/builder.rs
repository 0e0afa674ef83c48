//! Builder for encrypted disk images
//!
//! Produces images in either header generation from plaintext and a key,
//! used to exercise the decryption path without real firmware.

use binrw::BinWrite;
use binrw::io::Cursor;

use super::DEFAULT_CHUNK_SIZE;
use super::chunk::{ChunkCipher, padded_len};
use super::header::{
    HeaderVersion, V1_MAGIC, V1Header, V2_HEADER_SIZE, V2_MAGIC, V2Header,
};
use super::keys::DerivedKeyMaterial;
use crate::error::CryptoResult;

/// Builder for creating encrypted disk images
#[derive(Debug, Clone)]
pub struct EncryptedImageBuilder {
    keys: DerivedKeyMaterial,
    version: HeaderVersion,
    /// V2 only; V1 images always use the default chunk size
    chunk_size: u32,
    kdf_iteration_count: u32,
    kdf_salt: Vec<u8>,
}

impl EncryptedImageBuilder {
    /// Create a V2 builder with a 4 KiB chunk size
    pub fn new(keys: DerivedKeyMaterial) -> Self {
        Self {
            keys,
            version: HeaderVersion::V2,
            chunk_size: 4096,
            kdf_iteration_count: 1000,
            kdf_salt: vec![0u8; 20],
        }
    }

    /// Select the header generation
    #[must_use]
    pub fn with_version(mut self, version: HeaderVersion) -> Self {
        self.version = version;
        self
    }

    /// Set the V2 chunk size, rounded up to a whole number of AES blocks.
    /// Zero is written as-is and selects the default on decryption.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = padded_len(chunk_size as usize) as u32;
        self
    }

    /// Set the informational KDF parameters written into the header
    #[must_use]
    pub fn with_kdf(mut self, iteration_count: u32, salt: Vec<u8>) -> Self {
        self.kdf_iteration_count = iteration_count;
        self.kdf_salt = salt;
        self
    }

    /// Encrypt `plaintext` and wrap it in a header.
    ///
    /// Each chunk is zero-padded to a block boundary, so the decrypted
    /// payload is `plaintext` followed by up to 15 zero bytes.
    pub fn build(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let cipher = ChunkCipher::new(&self.keys)?;
        let payload = Self::encrypt_payload(&cipher, plaintext, self.effective_chunk_size());

        match self.version {
            HeaderVersion::V1 => self.build_v1(payload),
            HeaderVersion::V2 => self.build_v2(&payload),
        }
    }

    fn effective_chunk_size(&self) -> usize {
        match self.version {
            HeaderVersion::V1 => DEFAULT_CHUNK_SIZE as usize,
            HeaderVersion::V2 if self.chunk_size == 0 => DEFAULT_CHUNK_SIZE as usize,
            HeaderVersion::V2 => self.chunk_size as usize,
        }
    }

    fn encrypt_payload(cipher: &ChunkCipher, plaintext: &[u8], chunk_size: usize) -> Vec<u8> {
        let mut payload = Vec::with_capacity(padded_len(plaintext.len()));
        for (index, chunk) in plaintext.chunks(chunk_size).enumerate() {
            payload.extend_from_slice(&cipher.encrypt_chunk(index as u32, chunk));
        }
        payload
    }

    fn build_v1(&self, mut payload: Vec<u8>) -> CryptoResult<Vec<u8>> {
        let header = V1Header {
            kdf_iteration_count: self.kdf_iteration_count,
            kdf_salt_len: self.kdf_salt.len() as u32,
            kdf_salt: self.kdf_salt.clone(),
            unwrap_iv: [0u8; 32],
            wrapped_aes_key_len: 40,
            wrapped_aes_key: vec![0u8; 40],
            wrapped_hmac_key_len: 48,
            wrapped_hmac_key: vec![0u8; 48],
            magic: V1_MAGIC,
        };

        let mut trailer = Cursor::new(Vec::new());
        header.write_be(&mut trailer)?;
        payload.extend_from_slice(&trailer.into_inner());
        Ok(payload)
    }

    fn build_v2(&self, payload: &[u8]) -> CryptoResult<Vec<u8>> {
        let header = V2Header {
            signature: V2_MAGIC,
            version: 2,
            enc_iv_size: 16,
            enc_mode: 5,
            enc_algorithm: 0x8000_0001,
            key_bits: 128,
            prng_algorithm: 0x8000_0002,
            prng_key_bits: 160,
            uuid: [0u8; 16],
            block_size: self.chunk_size,
            data_size: payload.len() as u64,
            data_offset: V2_HEADER_SIZE as u64,
            kdf_algorithm: 103,
            kdf_prng_algorithm: 0,
            kdf_iteration_count: self.kdf_iteration_count,
            kdf_salt_len: self.kdf_salt.len() as u32,
            kdf_salt: self.kdf_salt.clone(),
            blob_enc_iv_size: 8,
            blob_enc_iv: vec![0u8; 8],
            blob_enc_key_bits: 192,
            blob_enc_algorithm: 17,
            blob_enc_padding: 7,
            blob_enc_mode: 6,
            encrypted_keyblob_len: 48,
            encrypted_keyblob: vec![0u8; 48],
        };

        let mut out = Cursor::new(Vec::with_capacity(V2_HEADER_SIZE + payload.len()));
        header.write_be(&mut out)?;
        let mut image = out.into_inner();
        image.resize(V2_HEADER_SIZE, 0);
        image.extend_from_slice(payload);
        Ok(image)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::vfdecrypt::header::{ImageHeader, V1_HEADER_SIZE};

    fn keys() -> DerivedKeyMaterial {
        DerivedKeyMaterial::from_bytes(&[0x5Cu8; 36]).expect("Operation should succeed")
    }

    #[test]
    fn test_v2_image_layout() {
        let image = EncryptedImageBuilder::new(keys())
            .with_chunk_size(512)
            .build(&[1u8; 2000])
            .expect("Operation should succeed");

        assert_eq!(&image[..8], b"encrcdsa");
        assert_eq!(image.len(), V2_HEADER_SIZE + 2000);

        let header = ImageHeader::read(&mut Cursor::new(&image)).unwrap();
        let layout = header.layout(image.len() as u64).unwrap();
        assert_eq!(layout.chunk_size, 512);
        assert_eq!(layout.chunk_count(), 4);
    }

    #[test]
    fn test_v1_image_layout() {
        let image = EncryptedImageBuilder::new(keys())
            .with_version(HeaderVersion::V1)
            .build(&[2u8; 100])
            .expect("Operation should succeed");

        assert_eq!(image.len(), 112 + V1_HEADER_SIZE);
        assert_eq!(&image[image.len() - 8..], b"cdsaencr");
    }

    #[test]
    fn test_chunk_size_rounded_to_block() {
        let builder = EncryptedImageBuilder::new(keys()).with_chunk_size(100);
        assert_eq!(builder.chunk_size, 112);
    }
}
