//! Per-partition FS header (0x200 bytes inside the NCA header block)

use std::io::Cursor;

use binrw::BinRead;
use serde::{Deserialize, Serialize};

use crate::nca::error::{NcaError, NcaResult};

/// Size of one FS header
pub const FS_HEADER_SIZE: usize = 0x200;

/// Size of the hash superblock embedded in an FS header
pub const HASH_INFO_SIZE: usize = 0xF8;

/// Filesystem stored in a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatType {
    /// Read-only filesystem, usually protected by a layered tree
    RomFs,
    /// Partition filesystem, usually protected by a flat table
    PartitionFs,
    /// Unrecognized value
    Unknown(u8),
}

impl From<u8> for FormatType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::RomFs,
            1 => Self::PartitionFs,
            other => Self::Unknown(other),
        }
    }
}

/// Hash-tree family declared by an FS header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashType {
    /// Chosen by the format type
    Auto,
    /// No hash tree
    None,
    /// Flat block-hash table
    HierarchicalSha256,
    /// Layered IVFC tree
    HierarchicalIntegrity,
    /// Unrecognized value
    Unknown(u8),
}

impl From<u8> for HashType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Auto,
            1 => Self::None,
            2 => Self::HierarchicalSha256,
            3 => Self::HierarchicalIntegrity,
            other => Self::Unknown(other),
        }
    }
}

/// Encryption applied to a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionType {
    /// Chosen by the content
    Auto,
    /// Plaintext
    None,
    /// AES-128-XTS over 0x200 sectors
    AesXts,
    /// AES-128-CTR
    AesCtr,
    /// AES-128-CTR with bucket-tree counter extension (patches)
    AesCtrEx,
    /// Unrecognized value
    Unknown(u8),
}

impl From<u8> for EncryptionType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Auto,
            1 => Self::None,
            2 => Self::AesXts,
            3 => Self::AesCtr,
            4 => Self::AesCtrEx,
            other => Self::Unknown(other),
        }
    }
}

/// Concrete hash-tree family after resolving `HashType::Auto`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashTreeKind {
    /// Single hash table anchored by a master hash
    Flat,
    /// Recursive IVFC levels
    Layered,
}

#[derive(BinRead)]
#[br(little)]
struct RawFsHeader {
    version: u16,
    format_type: u8,
    hash_type: u8,
    #[br(pad_after = 3)]
    encryption_type: u8,
    hash_info: [u8; HASH_INFO_SIZE],
    // Patch info (0x40) precedes the counter
    #[br(pad_before = 0x40)]
    ctr_upper: u64,
}

/// Decoded FS header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsHeader {
    /// FS header version
    pub version: u16,
    /// Filesystem type
    pub format_type: FormatType,
    /// Declared hash type
    pub hash_type: HashType,
    /// Declared encryption type
    pub encryption_type: EncryptionType,
    /// Raw hash superblock, interpreted by the hash-tree module
    pub hash_info: [u8; HASH_INFO_SIZE],
    /// Upper half of the AES-CTR counter
    pub ctr_upper: u64,
}

impl FsHeader {
    /// Decode an FS header from its 0x200-byte block
    pub fn parse(data: &[u8]) -> NcaResult<Self> {
        if data.len() != FS_HEADER_SIZE {
            return Err(NcaError::MalformedHeader(format!(
                "FS header is {:#x} bytes, expected {FS_HEADER_SIZE:#x}",
                data.len()
            )));
        }

        let raw = RawFsHeader::read(&mut Cursor::new(data))?;
        Ok(Self {
            version: raw.version,
            format_type: raw.format_type.into(),
            hash_type: raw.hash_type.into(),
            encryption_type: raw.encryption_type.into(),
            hash_info: raw.hash_info,
            ctr_upper: raw.ctr_upper,
        })
    }

    /// Resolve the hash-tree family this partition uses
    pub fn hash_tree_kind(&self) -> NcaResult<HashTreeKind> {
        match (self.hash_type, self.format_type) {
            (HashType::HierarchicalSha256, _) | (HashType::Auto, FormatType::PartitionFs) => {
                Ok(HashTreeKind::Flat)
            }
            (HashType::HierarchicalIntegrity, _) | (HashType::Auto, FormatType::RomFs) => {
                Ok(HashTreeKind::Layered)
            }
            (HashType::None, _) => Err(NcaError::UnsupportedFormat(
                "partition has no hash tree".to_string(),
            )),
            (HashType::Auto, FormatType::Unknown(value)) => Err(NcaError::UnsupportedFormat(
                format!("cannot infer hash type for format type {value}"),
            )),
            (HashType::Unknown(value), _) => Err(NcaError::UnsupportedFormat(format!(
                "hash type {value}"
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn raw_fs_header(format: u8, hash: u8, encryption: u8) -> Vec<u8> {
        let mut data = vec![0u8; FS_HEADER_SIZE];
        data[0..2].copy_from_slice(&2u16.to_le_bytes());
        data[2] = format;
        data[3] = hash;
        data[4] = encryption;
        data[8] = 0xAA;
        data[8 + HASH_INFO_SIZE - 1] = 0xBB;
        data[0x140..0x148].copy_from_slice(&0x0102_0304_0506_0708u64.to_le_bytes());
        data
    }

    #[test]
    fn test_parse_fields() {
        let header = FsHeader::parse(&raw_fs_header(1, 2, 3)).unwrap();
        assert_eq!(header.version, 2);
        assert_eq!(header.format_type, FormatType::PartitionFs);
        assert_eq!(header.hash_type, HashType::HierarchicalSha256);
        assert_eq!(header.encryption_type, EncryptionType::AesCtr);
        assert_eq!(header.hash_info[0], 0xAA);
        assert_eq!(header.hash_info[HASH_INFO_SIZE - 1], 0xBB);
        assert_eq!(header.ctr_upper, 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let result = FsHeader::parse(&[0u8; 0x1FF]);
        assert!(matches!(result, Err(NcaError::MalformedHeader(_))));
    }

    #[test]
    fn test_hash_tree_kind_resolution() {
        let kind = |format, hash| {
            FsHeader::parse(&raw_fs_header(format, hash, 1))
                .unwrap()
                .hash_tree_kind()
        };

        assert_eq!(kind(1, 0).unwrap(), HashTreeKind::Flat);
        assert_eq!(kind(0, 0).unwrap(), HashTreeKind::Layered);
        assert_eq!(kind(0, 2).unwrap(), HashTreeKind::Flat);
        assert_eq!(kind(1, 3).unwrap(), HashTreeKind::Layered);
        assert!(matches!(kind(0, 1), Err(NcaError::UnsupportedFormat(_))));
        assert!(matches!(kind(9, 0), Err(NcaError::UnsupportedFormat(_))));
        assert!(matches!(kind(0, 7), Err(NcaError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_unknown_encryption_preserved() {
        let header = FsHeader::parse(&raw_fs_header(0, 3, 9)).unwrap();
        assert_eq!(header.encryption_type, EncryptionType::Unknown(9));
    }
}
