use aes::cipher::{KeyIvInit, StreamCipher};
use thiserror::Error;

/// Number of 4-byte words in one chunk
pub const CHUNK_WORDS: usize = 1 << 15;

/// Size of one chunk in bytes (32768 words of 4 bytes each)
pub const CHUNK_BYTES: usize = CHUNK_WORDS * 4;

/// AES blocks per chunk; the per-chunk IV advances by this much per index
const BLOCKS_PER_CHUNK: u128 = (CHUNK_BYTES / 16) as u128;

/// Base IV for audio decryption, a fixed protocol constant interpreted as a
/// big-endian 128-bit integer.
pub const AUDIO_BASE_IV: u128 = 0x72e067fbddcbcf77ebe8bc643f630d93;

/// Chunk index containing the given byte offset of the encoded file.
pub fn chunk_index_at(byte_offset: u64) -> u32 {
    (byte_offset >> 17) as u32
}

/// Byte offset of the first byte of a chunk.
pub fn chunk_start(index: u32) -> u64 {
    u64::from(index) << 17
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecryptError {
    #[error("invalid AES key length: expected 16 bytes, got {0}")]
    InvalidKeyLength(usize),
}

/// AES-128-CTR with a big-endian 128-bit counter
type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Per-file chunk cipher.
///
/// Chunks are encrypted with AES-128-CTR under the file's audio key; the IV
/// for chunk `c` is the base IV plus `c * 8192` (one increment per AES block).
/// Decryption runs in place and is its own inverse, CTR being symmetric.
#[derive(Clone)]
pub struct ChunkCipher {
    key: Vec<u8>,
}

impl std::fmt::Debug for ChunkCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl ChunkCipher {
    pub fn new(key: Vec<u8>) -> Self {
        ChunkCipher { key }
    }

    /// Decrypt one chunk in place. Fails only when the key length is wrong.
    pub fn decrypt_chunk(&self, index: u32, data: &mut [u8]) -> Result<(), DecryptError> {
        self.apply_keystream(index, data)
    }

    /// Encrypt one chunk in place. Identical to decryption under CTR; kept as
    /// a separate entry point for fixture generation and round-trip checks.
    pub fn encrypt_chunk(&self, index: u32, data: &mut [u8]) -> Result<(), DecryptError> {
        self.apply_keystream(index, data)
    }

    fn apply_keystream(&self, index: u32, data: &mut [u8]) -> Result<(), DecryptError> {
        let iv = chunk_iv(index);
        let mut cipher = Aes128Ctr::new_from_slices(&self.key, &iv)
            .map_err(|_| DecryptError::InvalidKeyLength(self.key.len()))?;
        cipher.apply_keystream(data);
        Ok(())
    }
}

fn chunk_iv(index: u32) -> [u8; 16] {
    AUDIO_BASE_IV
        .wrapping_add(u128::from(index) * BLOCKS_PER_CHUNK)
        .to_be_bytes()
}
