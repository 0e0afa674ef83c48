//! Per-chunk AES-128-CBC with HMAC-SHA1 derived IVs
//!
//! Every chunk is an independent CBC stream. Its IV is the first 16 bytes of
//! `HMAC-SHA1(mac_key, chunk_index as big-endian u32)`, so chunks can be
//! decrypted in any order and without reference to their neighbours.

use aes::Aes128;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use super::keys::{DerivedKeyMaterial, MAC_KEY_LENGTH};
use crate::error::{CryptoError, CryptoResult};

/// AES block size
pub const BLOCK_SIZE: usize = 16;

type HmacSha1 = Hmac<Sha1>;

/// Keyed cipher shared by all chunks of one image
#[derive(Clone)]
pub struct ChunkCipher {
    cipher: Aes128,
    mac: HmacSha1,
}

impl ChunkCipher {
    /// Key the cipher and the IV generator
    pub fn new(keys: &DerivedKeyMaterial) -> CryptoResult<Self> {
        let cipher = <Aes128 as KeyInit>::new(GenericArray::from_slice(&keys.cipher_key));
        let mac = <HmacSha1 as Mac>::new_from_slice(&keys.mac_key).map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: MAC_KEY_LENGTH,
                actual: keys.mac_key.len(),
            }
        })?;
        Ok(Self { cipher, mac })
    }

    /// IV for chunk `index`
    pub fn chunk_iv(&self, index: u32) -> [u8; BLOCK_SIZE] {
        let mut mac = self.mac.clone();
        mac.update(&index.to_be_bytes());
        let tag = mac.finalize().into_bytes();

        let mut iv = [0u8; BLOCK_SIZE];
        iv.copy_from_slice(&tag[..BLOCK_SIZE]);
        iv
    }

    /// Start decrypting chunk `index`
    pub fn decryptor(&self, index: u32) -> ChunkDecryptor<'_> {
        ChunkDecryptor {
            cipher: &self.cipher,
            prev: self.chunk_iv(index),
        }
    }

    /// Decrypt one whole chunk.
    ///
    /// A length that is not a multiple of the block size is zero-padded for
    /// decryption; the result is truncated back to the input length.
    pub fn decrypt_chunk(&self, index: u32, data: &[u8]) -> Vec<u8> {
        let mut buf = padded(data);
        self.decryptor(index).decrypt_blocks(&mut buf);
        buf.truncate(data.len());
        buf
    }

    /// Encrypt one whole chunk, zero-padding the plaintext to full blocks
    pub fn encrypt_chunk(&self, index: u32, data: &[u8]) -> Vec<u8> {
        let mut buf = padded(data);
        let mut prev = self.chunk_iv(index);

        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            xor_in_place(block, &prev);
            self.cipher.encrypt_block(GenericArray::from_mut_slice(block));
            prev.copy_from_slice(block);
        }

        buf
    }
}

/// CBC decryption state for a single chunk
///
/// Slices fed to [`Self::decrypt_blocks`] continue the same CBC chain, which
/// lets a large chunk be processed in bounded memory.
pub struct ChunkDecryptor<'a> {
    cipher: &'a Aes128,
    prev: [u8; BLOCK_SIZE],
}

impl ChunkDecryptor<'_> {
    /// Decrypt whole blocks in place. A trailing partial block is ignored.
    pub fn decrypt_blocks(&mut self, buf: &mut [u8]) {
        let mut ciphertext = [0u8; BLOCK_SIZE];

        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            ciphertext.copy_from_slice(block);
            self.cipher.decrypt_block(GenericArray::from_mut_slice(block));
            xor_in_place(block, &self.prev);
            self.prev = ciphertext;
        }
    }
}

/// Round a length up to a whole number of blocks
pub(crate) fn padded_len(len: usize) -> usize {
    len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

fn padded(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(padded_len(data.len()));
    buf.extend_from_slice(data);
    buf.resize(padded_len(data.len()), 0);
    buf
}

fn xor_in_place(block: &mut [u8], other: &[u8; BLOCK_SIZE]) {
    for (b, o) in block.iter_mut().zip(other) {
        *b ^= o;
    }
}
