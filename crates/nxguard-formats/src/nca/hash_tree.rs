//! Hash-tree metadata from the FS header superblock
//!
//! Two families exist. The flat family (`HierarchicalSha256`) stores one
//! table of SHA-256 block hashes whose own digest is the master hash. The
//! layered family (IVFC) stores up to six levels where every level holds the
//! hashes of the next one and the last level is the data.
//!
//! All offsets are relative to the start of the partition. Structural checks
//! happen here, before any data block is read.

use std::io::Cursor;

use binrw::BinRead;
use nxguard_crypto::{SHA256_SIZE, Sha256Hash};

use crate::nca::error::{NcaError, NcaResult};
use crate::nca::fs_header::{HASH_INFO_SIZE, HashTreeKind};

/// Magic of a layered superblock
pub const IVFC_MAGIC: [u8; 4] = *b"IVFC";

/// Number of level descriptors in a layered superblock
pub const IVFC_MAX_LEVELS: usize = 6;

const HASH_SIZE: u64 = SHA256_SIZE as u64;

/// A byte range inside a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    /// Offset from the start of the partition
    pub offset: u64,
    /// Length in bytes
    pub size: u64,
}

impl Region {
    /// End offset (exclusive)
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.size)
    }

    fn check_within(&self, what: &str, partition_size: u64) -> NcaResult<()> {
        match self.end() {
            Some(end) if end <= partition_size => Ok(()),
            _ => Err(NcaError::InvalidHashTree(format!(
                "{what} [{:#x}, +{:#x}) exceeds partition size {partition_size:#x}",
                self.offset, self.size
            ))),
        }
    }
}

/// Number of `block_size` blocks needed to cover `size` bytes
pub fn block_count(size: u64, block_size: u64) -> u64 {
    size.div_ceil(block_size)
}

#[derive(BinRead)]
#[br(little)]
struct RawFlatSuperblock {
    master_hash: Sha256Hash,
    block_size: u32,
    layer_count: u32,
    hash_table_offset: u64,
    hash_table_size: u64,
    data_offset: u64,
    data_size: u64,
}

#[derive(BinRead)]
#[br(little)]
struct RawIvfcLevel {
    offset: u64,
    size: u64,
    #[br(pad_after = 4)]
    block_size_log2: u32,
}

#[derive(BinRead)]
#[br(little, magic = b"IVFC")]
struct RawIvfcSuperblock {
    _version: u32,
    master_hash_size: u32,
    max_layers: u32,
    levels: [RawIvfcLevel; IVFC_MAX_LEVELS],
    _salt: [u8; 0x20],
    master_hash: Sha256Hash,
}

/// Flat hash-table metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatHashMetadata {
    /// Digest of the whole hash table
    pub master_hash: Sha256Hash,
    /// Size of each hashed data block
    pub block_size: u64,
    /// Location of the hash table
    pub hash_table: Region,
    /// Location of the protected data
    pub data: Region,
}

/// One level of a layered tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashLevel {
    /// Location of the level
    pub region: Region,
    /// Block size of the level
    pub block_size: u64,
}

impl HashLevel {
    /// Number of blocks in the level
    pub fn block_count(&self) -> u64 {
        block_count(self.region.size, self.block_size)
    }
}

/// Layered (IVFC) metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayeredHashMetadata {
    /// Digest of the single block of level 0
    pub master_hash: Sha256Hash,
    levels: Vec<HashLevel>,
}

impl LayeredHashMetadata {
    /// Levels from the top; the last one is the data
    pub fn levels(&self) -> &[HashLevel] {
        &self.levels
    }

    /// The data level
    pub fn data_level(&self) -> &HashLevel {
        // Parsing guarantees at least one level
        &self.levels[self.levels.len() - 1]
    }
}

/// Hash-tree metadata of either family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashTreeMetadata {
    /// Single table anchored by a master hash
    Flat(FlatHashMetadata),
    /// Recursive levels anchored by a master hash
    Layered(LayeredHashMetadata),
}

impl HashTreeMetadata {
    /// Parse the superblock for the given family
    pub fn parse(kind: HashTreeKind, hash_info: &[u8; HASH_INFO_SIZE]) -> NcaResult<Self> {
        let mut cursor = Cursor::new(&hash_info[..]);
        match kind {
            HashTreeKind::Flat => {
                let raw = RawFlatSuperblock::read(&mut cursor)?;
                if raw.layer_count != 2 {
                    return Err(NcaError::UnsupportedFormat(format!(
                        "flat hash tree with {} layers",
                        raw.layer_count
                    )));
                }
                Ok(Self::Flat(FlatHashMetadata {
                    master_hash: raw.master_hash,
                    block_size: u64::from(raw.block_size),
                    hash_table: Region {
                        offset: raw.hash_table_offset,
                        size: raw.hash_table_size,
                    },
                    data: Region {
                        offset: raw.data_offset,
                        size: raw.data_size,
                    },
                }))
            }
            HashTreeKind::Layered => {
                let raw = RawIvfcSuperblock::read(&mut cursor).map_err(|e| match e {
                    binrw::Error::BadMagic { .. } => {
                        NcaError::InvalidHashTree("missing IVFC magic".to_string())
                    }
                    other => other.into(),
                })?;

                if raw.master_hash_size as usize != SHA256_SIZE {
                    return Err(NcaError::UnsupportedFormat(format!(
                        "IVFC master hash size {:#x}",
                        raw.master_hash_size
                    )));
                }
                if !(2..=IVFC_MAX_LEVELS as u32 + 1).contains(&raw.max_layers) {
                    return Err(NcaError::InvalidHashTree(format!(
                        "IVFC declares {} layers",
                        raw.max_layers
                    )));
                }

                let level_count = raw.max_layers as usize - 1;
                let levels = raw.levels[..level_count]
                    .iter()
                    .enumerate()
                    .map(|(index, level)| {
                        if !(1..32).contains(&level.block_size_log2) {
                            return Err(NcaError::InvalidHashTree(format!(
                                "level {index} block size 2^{}",
                                level.block_size_log2
                            )));
                        }
                        Ok(HashLevel {
                            region: Region {
                                offset: level.offset,
                                size: level.size,
                            },
                            block_size: 1u64 << level.block_size_log2,
                        })
                    })
                    .collect::<NcaResult<Vec<_>>>()?;

                Ok(Self::Layered(LayeredHashMetadata {
                    master_hash: raw.master_hash,
                    levels,
                }))
            }
        }
    }

    /// Which family this is
    pub fn kind(&self) -> HashTreeKind {
        match self {
            Self::Flat(_) => HashTreeKind::Flat,
            Self::Layered(_) => HashTreeKind::Layered,
        }
    }

    /// Region holding the protected data
    pub fn data_region(&self) -> Region {
        match self {
            Self::Flat(meta) => meta.data,
            Self::Layered(meta) => meta.data_level().region,
        }
    }

    /// Block size of the data region
    pub fn data_block_size(&self) -> u64 {
        match self {
            Self::Flat(meta) => meta.block_size,
            Self::Layered(meta) => meta.data_level().block_size,
        }
    }

    /// Check that every region lies in the partition and that every hash
    /// level can hold one hash per block of the level it covers
    pub fn validate(&self, partition_size: u64) -> NcaResult<()> {
        match self {
            Self::Flat(meta) => {
                if meta.block_size == 0 {
                    return Err(NcaError::InvalidHashTree("zero block size".to_string()));
                }
                meta.hash_table.check_within("hash table", partition_size)?;
                meta.data.check_within("data", partition_size)?;
                check_capacity("hash table", meta.hash_table.size, meta.data.size, meta.block_size)
            }
            Self::Layered(meta) => {
                for (index, level) in meta.levels.iter().enumerate() {
                    level
                        .region
                        .check_within(&format!("level {index}"), partition_size)?;
                }

                let top = meta.levels[0];
                if top.region.size > top.block_size {
                    return Err(NcaError::InvalidHashTree(format!(
                        "level 0 is {:#x} bytes, more than one {:#x} block",
                        top.region.size, top.block_size
                    )));
                }

                for (index, pair) in meta.levels.windows(2).enumerate() {
                    check_capacity(
                        &format!("level {index}"),
                        pair[0].region.size,
                        pair[1].region.size,
                        pair[1].block_size,
                    )?;
                }
                Ok(())
            }
        }
    }
}

fn check_capacity(what: &str, hash_bytes: u64, child_size: u64, child_block: u64) -> NcaResult<()> {
    let needed = block_count(child_size, child_block).saturating_mul(HASH_SIZE);
    if hash_bytes < needed {
        return Err(NcaError::InvalidHashTree(format!(
            "{what} holds {hash_bytes:#x} bytes but {needed:#x} are needed"
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn flat_info(block_size: u32, table: (u64, u64), data: (u64, u64)) -> [u8; HASH_INFO_SIZE] {
        let mut info = [0u8; HASH_INFO_SIZE];
        info[..0x20].fill(0xAA);
        info[0x20..0x24].copy_from_slice(&block_size.to_le_bytes());
        info[0x24..0x28].copy_from_slice(&2u32.to_le_bytes());
        info[0x28..0x30].copy_from_slice(&table.0.to_le_bytes());
        info[0x30..0x38].copy_from_slice(&table.1.to_le_bytes());
        info[0x38..0x40].copy_from_slice(&data.0.to_le_bytes());
        info[0x40..0x48].copy_from_slice(&data.1.to_le_bytes());
        info
    }

    fn ivfc_info(levels: &[(u64, u64, u32)]) -> [u8; HASH_INFO_SIZE] {
        let mut info = [0u8; HASH_INFO_SIZE];
        info[..4].copy_from_slice(&IVFC_MAGIC);
        info[4..8].copy_from_slice(&0x20000u32.to_le_bytes());
        info[8..12].copy_from_slice(&0x20u32.to_le_bytes());
        info[12..16].copy_from_slice(&(levels.len() as u32 + 1).to_le_bytes());
        for (i, (offset, size, log2)) in levels.iter().enumerate() {
            let base = 0x10 + i * 0x18;
            info[base..base + 8].copy_from_slice(&offset.to_le_bytes());
            info[base + 8..base + 16].copy_from_slice(&size.to_le_bytes());
            info[base + 16..base + 20].copy_from_slice(&log2.to_le_bytes());
        }
        info[0xC0..0xE0].fill(0xBB);
        info
    }

    #[test]
    fn test_parse_flat() {
        let info = flat_info(0x1000, (0, 0x40), (0x200, 0x2000));
        let meta = HashTreeMetadata::parse(HashTreeKind::Flat, &info).unwrap();
        assert_eq!(meta.kind(), HashTreeKind::Flat);
        assert_eq!(meta.data_region(), Region { offset: 0x200, size: 0x2000 });
        assert_eq!(meta.data_block_size(), 0x1000);
        meta.validate(0x2200).unwrap();

        let HashTreeMetadata::Flat(flat) = meta else {
            unreachable!("expected flat metadata");
        };
        assert_eq!(flat.master_hash.as_bytes(), &[0xAA; 32]);
    }

    #[test]
    fn test_flat_capacity_checked() {
        // Three blocks need 0x60 bytes of hashes
        let info = flat_info(0x1000, (0, 0x40), (0x200, 0x2001));
        let meta = HashTreeMetadata::parse(HashTreeKind::Flat, &info).unwrap();
        assert!(matches!(meta.validate(0x4000), Err(NcaError::InvalidHashTree(_))));
    }

    #[test]
    fn test_flat_region_bounds() {
        let info = flat_info(0x1000, (0, 0x40), (0x200, 0x2000));
        let meta = HashTreeMetadata::parse(HashTreeKind::Flat, &info).unwrap();
        assert!(matches!(meta.validate(0x21FF), Err(NcaError::InvalidHashTree(_))));

        let info = flat_info(0x1000, (u64::MAX, 0x40), (0x200, 0x2000));
        let meta = HashTreeMetadata::parse(HashTreeKind::Flat, &info).unwrap();
        assert!(meta.validate(0x4000).is_err());
    }

    #[test]
    fn test_flat_layer_count() {
        let mut info = flat_info(0x1000, (0, 0x40), (0x200, 0x2000));
        info[0x24] = 3;
        assert!(matches!(
            HashTreeMetadata::parse(HashTreeKind::Flat, &info),
            Err(NcaError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_parse_layered() {
        let info = ivfc_info(&[(0, 0x20, 14), (0x4000, 0x60, 14), (0x8000, 0xA000, 14)]);
        let meta = HashTreeMetadata::parse(HashTreeKind::Layered, &info).unwrap();
        assert_eq!(meta.data_region(), Region { offset: 0x8000, size: 0xA000 });
        assert_eq!(meta.data_block_size(), 0x4000);
        meta.validate(0x12000).unwrap();

        let HashTreeMetadata::Layered(layered) = meta else {
            unreachable!("expected layered metadata");
        };
        assert_eq!(layered.levels().len(), 3);
        assert_eq!(layered.levels()[2].block_count(), 3);
        assert_eq!(layered.master_hash.as_bytes(), &[0xBB; 32]);
    }

    #[test]
    fn test_layered_capacity_fails_fast() {
        // Level 1 holds two hashes but the data has three blocks
        let info = ivfc_info(&[(0, 0x20, 14), (0x4000, 0x40, 14), (0x8000, 0xA000, 14)]);
        let meta = HashTreeMetadata::parse(HashTreeKind::Layered, &info).unwrap();
        assert!(matches!(
            meta.validate(0x12000),
            Err(NcaError::InvalidHashTree(msg)) if msg.contains("level 1")
        ));
    }

    #[test]
    fn test_layered_top_level_single_block() {
        let info = ivfc_info(&[(0, 0x40, 5), (0x4000, 0x40, 14)]);
        let meta = HashTreeMetadata::parse(HashTreeKind::Layered, &info).unwrap();
        assert!(matches!(meta.validate(0x8000), Err(NcaError::InvalidHashTree(_))));
    }

    #[test]
    fn test_layered_structure_errors() {
        let mut info = ivfc_info(&[(0, 0x20, 14), (0x4000, 0x60, 14)]);
        info[0] = b'X';
        assert!(matches!(
            HashTreeMetadata::parse(HashTreeKind::Layered, &info),
            Err(NcaError::InvalidHashTree(_))
        ));

        let mut info = ivfc_info(&[(0, 0x20, 14), (0x4000, 0x60, 14)]);
        info[12] = 9;
        assert!(HashTreeMetadata::parse(HashTreeKind::Layered, &info).is_err());

        let info = ivfc_info(&[(0, 0x20, 0), (0x4000, 0x60, 14)]);
        assert!(HashTreeMetadata::parse(HashTreeKind::Layered, &info).is_err());
    }
}
