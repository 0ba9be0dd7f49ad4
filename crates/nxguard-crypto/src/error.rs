//! Error types for cryptographic operations

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key size
    #[error("Invalid key size: expected {expected}, got {actual}")]
    InvalidKeySize {
        /// Expected key size in bytes
        expected: usize,
        /// Actual key size in bytes
        actual: usize,
    },

    /// Invalid key format
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    /// Data length is not a whole number of cipher units
    #[error("Invalid data length: {length} is not a multiple of {unit}")]
    InvalidDataLength {
        /// Length of the buffer handed to the cipher
        length: usize,
        /// Required granularity (block or sector size)
        unit: usize,
    },

    /// RSA public key could not be constructed
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Signature has the wrong length for the key
    #[error("Invalid signature size: expected {expected}, got {actual}")]
    InvalidSignatureSize {
        /// Modulus size in bytes
        expected: usize,
        /// Actual signature size in bytes
        actual: usize,
    },

    /// Signature did not verify
    #[error("Signature verification failed: {0}")]
    SignatureMismatch(String),

    /// I/O error while loading key files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
