//! Error types for NCA processing

use std::fmt;

use nxguard_crypto::CryptoError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for NCA operations
pub type NcaResult<T> = Result<T, NcaError>;

/// Where in a partition's integrity chain a check failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityLevel {
    /// The FS header did not match the digest recorded in the NCA header
    FsHeader,
    /// A hash table or top level did not match the master hash
    Master,
    /// An intermediate level of a layered tree (0 is the top)
    Hash(u8),
    /// A data block did not match its recorded hash
    Data,
}

impl fmt::Display for IntegrityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FsHeader => f.write_str("fs header"),
            Self::Master => f.write_str("master hash"),
            Self::Hash(level) => write!(f, "hash level {level}"),
            Self::Data => f.write_str("data"),
        }
    }
}

/// Errors that can occur when decoding, verifying or reading an NCA
#[derive(Debug, Error)]
pub enum NcaError {
    /// Header block is structurally invalid
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// Recognized but unhandled format or mode
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Required key material is not in the key set
    #[error("missing key: {0}")]
    MissingKey(String),

    /// Header signature did not verify
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    /// Hash-tree metadata is inconsistent
    #[error("invalid hash tree: {0}")]
    InvalidHashTree(String),

    /// Bytes did not match their recorded hash
    #[error("integrity violation at {level}, index {index}")]
    IntegrityViolation {
        /// Level of the tree that failed
        level: IntegrityLevel,
        /// Block (or entry) index within that level
        index: u64,
    },

    /// Read started past the end of a partition
    #[error("offset {offset:#x} is out of range for size {size:#x}")]
    OutOfRange {
        /// Requested offset
        offset: u64,
        /// Size of the readable region
        size: u64,
    },

    /// Work was abandoned through a cancellation flag
    #[error("cancelled")]
    Cancelled,

    /// A partition failed while the run was configured to abort
    #[error("partition {index} failed: {source}")]
    PartitionFailed {
        /// Partition slot
        index: usize,
        /// Underlying failure
        #[source]
        source: Box<NcaError>,
    },

    /// Cryptographic primitive error
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Binary parsing error
    #[error("binary parsing error: {0}")]
    BinRw(#[from] binrw::Error),
}

/// Category of a failure, as stored in a verification report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Structurally invalid header data
    MalformedHeader,
    /// Recognized but unhandled format
    UnsupportedFormat,
    /// Key material not available; content cannot be decrypted
    MissingKey,
    /// Key material present but unusable
    InvalidKey,
    /// Authenticity could not be confirmed
    SignatureInvalid,
    /// Hash-tree metadata is inconsistent
    InvalidHashTree,
    /// Data failed its integrity check
    IntegrityViolation {
        /// Level of the tree that failed
        level: IntegrityLevel,
        /// Block index within that level
        index: u64,
    },
    /// Read outside a partition
    OutOfRange,
    /// Verification was abandoned
    Cancelled,
    /// Underlying source could not be read
    Io,
}

impl NcaError {
    /// Classify this error for a verification report
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::MalformedHeader(_) | Self::BinRw(_) => FailureKind::MalformedHeader,
            Self::UnsupportedFormat(_) => FailureKind::UnsupportedFormat,
            Self::MissingKey(_) => FailureKind::MissingKey,
            Self::SignatureInvalid(_)
            | Self::Crypto(
                CryptoError::SignatureMismatch(_)
                | CryptoError::InvalidSignatureSize { .. }
                | CryptoError::InvalidPublicKey(_),
            ) => FailureKind::SignatureInvalid,
            Self::Crypto(CryptoError::InvalidKeySize { .. } | CryptoError::InvalidKeyFormat(_)) => {
                FailureKind::InvalidKey
            }
            Self::Crypto(CryptoError::InvalidDataLength { .. }) => FailureKind::MalformedHeader,
            Self::Crypto(CryptoError::Io(_)) | Self::Io(_) => FailureKind::Io,
            Self::InvalidHashTree(_) => FailureKind::InvalidHashTree,
            Self::IntegrityViolation { level, index } => FailureKind::IntegrityViolation {
                level: *level,
                index: *index,
            },
            Self::OutOfRange { .. } => FailureKind::OutOfRange,
            Self::Cancelled => FailureKind::Cancelled,
            Self::PartitionFailed { source, .. } => source.kind(),
        }
    }

    /// Whether this failure is a hash mismatch
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self.kind(), FailureKind::IntegrityViolation { .. })
    }
}

impl From<NcaError> for std::io::Error {
    fn from(err: NcaError) -> Self {
        match err {
            NcaError::Io(e) => e,
            NcaError::OutOfRange { .. } => Self::new(std::io::ErrorKind::UnexpectedEof, err),
            other => Self::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_unwraps_partition_failure() {
        let err = NcaError::PartitionFailed {
            index: 1,
            source: Box::new(NcaError::IntegrityViolation {
                level: IntegrityLevel::Data,
                index: 7,
            }),
        };
        assert_eq!(
            err.kind(),
            FailureKind::IntegrityViolation {
                level: IntegrityLevel::Data,
                index: 7
            }
        );
        assert!(err.is_integrity_failure());
        assert!(err.to_string().contains("partition 1"));
    }

    #[test]
    fn test_signature_mismatch_classified() {
        let err = NcaError::from(CryptoError::SignatureMismatch("bad".into()));
        assert_eq!(err.kind(), FailureKind::SignatureInvalid);
    }

    #[test]
    fn test_crypto_errors_classified_by_cause() {
        let short = NcaError::from(CryptoError::InvalidDataLength {
            length: 0x1F0,
            unit: 0x200,
        });
        assert_eq!(short.kind(), FailureKind::MalformedHeader);

        let key = NcaError::from(CryptoError::InvalidKeySize {
            expected: 16,
            actual: 15,
        });
        assert_eq!(key.kind(), FailureKind::InvalidKey);

        let io = NcaError::from(CryptoError::Io(std::io::Error::other("gone")));
        assert_eq!(io.kind(), FailureKind::Io);

        let size = NcaError::from(CryptoError::InvalidSignatureSize {
            expected: 0x100,
            actual: 0x80,
        });
        assert_eq!(size.kind(), FailureKind::SignatureInvalid);
    }

    #[test]
    fn test_io_conversion() {
        let err: std::io::Error = NcaError::OutOfRange { offset: 5, size: 4 }.into();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);

        let err: std::io::Error = NcaError::IntegrityViolation {
            level: IntegrityLevel::Hash(2),
            index: 0,
        }
        .into();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("hash level 2"));
    }
}
