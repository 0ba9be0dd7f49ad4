//! AES-128 primitives: single-block ECB and the NCA flavour of CTR
//!
//! NCA partitions are AES-128-CTR encrypted with a 128-bit counter whose
//! upper half is a per-partition constant taken from the FS header and whose
//! lower half is the absolute file offset divided by 16, both big-endian.
//! Because the counter is a pure function of the file offset, any byte range
//! can be decrypted without touching the bytes before it.

use std::fmt;

use aes::Aes128;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// AES block size in bytes
pub const AES_BLOCK_SIZE: usize = 16;

/// A 128-bit AES key
///
/// The key bytes are wiped when the value is dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Aes128Key([u8; 16]);

impl Aes128Key {
    /// Create key from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Parse key from hex string
    pub fn from_hex(hex: &str) -> Result<Self, CryptoError> {
        let hex = hex.trim();
        let bytes = hex::decode(hex)
            .map_err(|e| CryptoError::InvalidKeyFormat(format!("invalid hex: {e}")))?;

        if bytes.len() != 16 {
            return Err(CryptoError::InvalidKeySize {
                expected: 16,
                actual: bytes.len(),
            });
        }

        let mut key = [0u8; 16];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Decrypt a key that was wrapped with this key (AES-128-ECB)
    pub fn unwrap_key(&self, wrapped: &[u8; 16]) -> Self {
        Self(ecb_decrypt_block(self, wrapped))
    }

    /// Wrap a key with this key (AES-128-ECB)
    pub fn wrap_key(&self, key: &Self) -> [u8; 16] {
        ecb_encrypt_block(self, &key.0)
    }

    pub(crate) fn cipher(&self) -> Aes128 {
        Aes128::new((&self.0).into())
    }
}

impl fmt::Debug for Aes128Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Aes128Key(..)")
    }
}

/// Decrypt a single block with AES-128-ECB
pub fn ecb_decrypt_block(key: &Aes128Key, block: &[u8; 16]) -> [u8; 16] {
    let mut data = aes::Block::clone_from_slice(block);
    key.cipher().decrypt_block(&mut data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&data);
    out
}

/// Encrypt a single block with AES-128-ECB
pub fn ecb_encrypt_block(key: &Aes128Key, block: &[u8; 16]) -> [u8; 16] {
    let mut data = aes::Block::clone_from_slice(block);
    key.cipher().encrypt_block(&mut data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&data);
    out
}

/// Build the 128-bit NCA counter block for an absolute file offset
///
/// `upper` is the FS header's 8-byte counter field read as a little-endian
/// integer; it lands big-endian in the first half of the counter.
pub fn nca_counter(upper: u64, offset: u64) -> [u8; 16] {
    let mut counter = [0u8; 16];
    counter[..8].copy_from_slice(&upper.to_be_bytes());
    counter[8..].copy_from_slice(&(offset >> 4).to_be_bytes());
    counter
}

/// AES-128-CTR keyed for one NCA partition
///
/// Stateless with respect to position: every call names the absolute file
/// offset of `data[0]`, so concurrent readers can share one instance.
#[derive(Clone)]
pub struct CtrCipher {
    cipher: Aes128,
    upper: u64,
}

impl CtrCipher {
    /// Create a cipher for the given content key and upper counter half
    pub fn new(key: &Aes128Key, upper: u64) -> Self {
        Self {
            cipher: key.cipher(),
            upper,
        }
    }

    /// Counter block covering the given absolute offset
    pub fn counter_at(&self, offset: u64) -> [u8; 16] {
        nca_counter(self.upper, offset)
    }

    /// XOR the keystream for `offset..offset + data.len()` into `data`
    ///
    /// Encryption and decryption are the same operation. `offset` does not
    /// need to be block aligned.
    pub fn apply_keystream(&self, offset: u64, data: &mut [u8]) {
        let mut position = offset;
        let mut done = 0usize;

        while done < data.len() {
            let skip = (position % AES_BLOCK_SIZE as u64) as usize;
            let mut keystream = aes::Block::from(self.counter_at(position));
            self.cipher.encrypt_block(&mut keystream);

            let take = (AES_BLOCK_SIZE - skip).min(data.len() - done);
            for (byte, key_byte) in data[done..done + take]
                .iter_mut()
                .zip(&keystream[skip..skip + take])
            {
                *byte ^= key_byte;
            }

            done += take;
            position += take as u64;
        }
    }
}

impl fmt::Debug for CtrCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CtrCipher")
            .field("upper", &format_args!("{:016X}", self.upper))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // FIPS-197 appendix C.1
    #[test]
    fn test_ecb_known_answer() {
        let key = Aes128Key::from_hex("000102030405060708090a0b0c0d0e0f").unwrap();
        let plaintext: [u8; 16] = hex::decode("00112233445566778899aabbccddeeff")
            .unwrap()
            .try_into()
            .unwrap();
        let ciphertext = ecb_encrypt_block(&key, &plaintext);
        assert_eq!(hex::encode(ciphertext), "69c4e0d86a7b0430d8cdb78070b4c55a");
        assert_eq!(ecb_decrypt_block(&key, &ciphertext), plaintext);
    }

    #[test]
    fn test_key_wrap_round_trip() {
        let kek = Aes128Key::from_bytes([0x11; 16]);
        let key = Aes128Key::from_bytes([0x42; 16]);
        let wrapped = kek.wrap_key(&key);
        assert_ne!(&wrapped, key.as_bytes());
        assert_eq!(kek.unwrap_key(&wrapped), key);
    }

    #[test]
    fn test_key_invalid_size() {
        let result = Aes128Key::from_hex("0011");
        assert!(matches!(result, Err(CryptoError::InvalidKeySize { .. })));
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = Aes128Key::from_bytes([0xAB; 16]);
        assert_eq!(format!("{key:?}"), "Aes128Key(..)");
    }

    #[test]
    fn test_counter_layout() {
        let counter = nca_counter(0x0102_0304_0506_0708, 0x4_0010);
        assert_eq!(
            hex::encode(counter),
            "01020304050607080000000000004001"
        );
    }

    #[test]
    fn test_unaligned_matches_aligned() {
        let cipher = CtrCipher::new(&Aes128Key::from_bytes([7; 16]), 0xDEAD_BEEF);
        let mut whole = vec![0u8; 64];
        cipher.apply_keystream(0xC00, &mut whole);

        let mut tail = vec![0u8; 41];
        cipher.apply_keystream(0xC00 + 23, &mut tail);
        assert_eq!(&whole[23..], &tail[..]);
    }

    proptest! {
        #[test]
        fn prop_ctr_round_trip(
            data in proptest::collection::vec(any::<u8>(), 0..512),
            offset in 0u64..0x1_0000_0000,
            upper in any::<u64>(),
        ) {
            let cipher = CtrCipher::new(&Aes128Key::from_bytes([0x5A; 16]), upper);
            let mut buffer = data.clone();
            cipher.apply_keystream(offset, &mut buffer);
            cipher.apply_keystream(offset, &mut buffer);
            prop_assert_eq!(buffer, data);
        }
    }
}
