//! Cryptographic primitives and key material for NCA content archives
//!
//! This crate provides the building blocks the NCA pipeline delegates to:
//!
//! - **Block ciphers**: AES-128 ECB for key unwrapping, AES-128-CTR with the
//!   offset-derived NCA counter, AES-128-XTS with the big-endian sector tweak
//! - **Hashing**: SHA-256 digests for hash trees and header checks
//! - **Signatures**: RSA-PSS and RSA-PKCS#1 v1.5 verification over SHA-256
//! - **Key Management**: [`KeySet`], an in-memory store for the header key,
//!   key-area keys, title key encryption keys and title keys
//!
//! All symmetric key types wipe their bytes on drop and redact themselves in
//! `Debug` output.
//!
//! # Examples
//!
//! ## Random-access CTR decryption
//!
//! ```
//! use nxguard_crypto::{Aes128Key, CtrCipher};
//!
//! let cipher = CtrCipher::new(&Aes128Key::from_bytes([0x42; 16]), 0x0000_0001_0000_0000);
//!
//! let mut whole = vec![0u8; 64];
//! cipher.apply_keystream(0x4000, &mut whole);
//!
//! // Any sub-range decrypts on its own because the counter is derived from
//! // the absolute offset.
//! let mut tail = vec![0u8; 32];
//! cipher.apply_keystream(0x4020, &mut tail);
//! assert_eq!(&whole[32..], &tail[..]);
//! ```
//!
//! ## Loading key material
//!
//! ```
//! use nxguard_crypto::KeySet;
//!
//! let mut keys = KeySet::new();
//! let loaded = keys.load_prod_keys("titlekek_00 = 00112233445566778899aabbccddeeff");
//! assert_eq!(loaded, 1);
//! ```

#![warn(missing_docs)]

pub mod aes128;
pub mod error;
pub mod keys;
pub mod sha256;
pub mod signature;
pub mod xts;

pub use aes128::{AES_BLOCK_SIZE, Aes128Key, CtrCipher, ecb_decrypt_block, ecb_encrypt_block};
pub use error::CryptoError;
pub use keys::{KeyAreaKeyIndex, KeySet};
pub use sha256::{SHA256_SIZE, Sha256Hash};
pub use signature::{SignaturePublicKey, SignatureScheme};
pub use xts::{AesXtsKey, NCA_SECTOR_SIZE, XtsCipher};
