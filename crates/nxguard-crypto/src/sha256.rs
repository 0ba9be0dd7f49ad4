//! SHA-256 digests used by NCA hash trees and header checks

use std::fmt;

use binrw::BinRead;
use sha2::{Digest, Sha256};

/// Size of a SHA-256 digest in bytes
pub const SHA256_SIZE: usize = 32;

/// A SHA-256 digest
#[derive(BinRead, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Sha256Hash([u8; SHA256_SIZE]);

impl Sha256Hash {
    /// Create hash from raw bytes
    pub fn from_bytes(bytes: [u8; SHA256_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create hash from a slice, if it has exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    /// Compute the digest of `data`
    pub fn from_data(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Compute the digest of `data` zero-extended to `padded_len` bytes
    ///
    /// Used for hash-tree blocks that are always hashed at full block size
    /// even when the level ends mid-block.
    pub fn from_padded(data: &[u8], padded_len: usize) -> Self {
        const ZEROS: [u8; 64] = [0u8; 64];

        let mut hasher = Sha256::new();
        hasher.update(data);
        let mut remaining = padded_len.saturating_sub(data.len());
        while remaining > 0 {
            let n = remaining.min(ZEROS.len());
            hasher.update(&ZEROS[..n]);
            remaining -= n;
        }
        Self(hasher.finalize().into())
    }

    /// Parse hash from hex string
    pub fn from_hex(hex: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; SHA256_SIZE];
        hex::decode_to_slice(hex, &mut bytes)?;
        Ok(Self(bytes))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; SHA256_SIZE] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
