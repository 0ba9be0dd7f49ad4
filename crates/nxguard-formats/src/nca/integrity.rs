//! Hash-tree block verification
//!
//! Both hash-tree families implement [`BlockVerifier`]. The partition reader
//! hands every data block to the verifier before any of its bytes leave the
//! reader.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use nxguard_crypto::{SHA256_SIZE, Sha256Hash};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::nca::decrypt::DecryptingSource;
use crate::nca::error::{IntegrityLevel, NcaError, NcaResult};
use crate::nca::hash_tree::{
    FlatHashMetadata, HashLevel, HashTreeMetadata, LayeredHashMetadata, block_count,
};

/// Verifies data blocks of one partition against its hash tree
pub trait BlockVerifier: Send + Sync + fmt::Debug {
    /// Size of a data block; the last block may be shorter
    fn block_size(&self) -> u64;

    /// Size of the protected data
    fn data_size(&self) -> u64;

    /// Number of data blocks
    fn block_count(&self) -> u64 {
        block_count(self.data_size(), self.block_size())
    }

    /// Check data block `index`, whose bytes are `data`
    fn verify_block(&self, index: u64, data: &[u8]) -> NcaResult<()>;
}

/// Build the verifier for a partition's hash tree
///
/// Metadata is validated against the partition size first, so inconsistent
/// trees fail here rather than on a later read.
pub(crate) fn open_verifier(
    metadata: &HashTreeMetadata,
    source: Arc<DecryptingSource>,
) -> NcaResult<Box<dyn BlockVerifier>> {
    metadata.validate(source.size())?;
    match metadata {
        HashTreeMetadata::Flat(flat) => Ok(Box::new(FlatHashVerifier::open(flat, &source)?)),
        HashTreeMetadata::Layered(layered) => {
            Ok(Box::new(LayeredHashVerifier::new(layered, source)))
        }
    }
}

fn hash_entry(table: &[u8], index: u64) -> Option<&[u8]> {
    let start = usize::try_from(index).ok()?.checked_mul(SHA256_SIZE)?;
    table.get(start..start.checked_add(SHA256_SIZE)?)
}

/// Flat family: one table of block hashes anchored by the master hash
///
/// The table is loaded and checked once when the verifier opens. If it does
/// not match the master hash, every block check fails.
pub struct FlatHashVerifier {
    block_size: u64,
    data_size: u64,
    table: Vec<u8>,
    anchored: bool,
}

impl FlatHashVerifier {
    pub(crate) fn open(meta: &FlatHashMetadata, source: &DecryptingSource) -> NcaResult<Self> {
        let table = source.read_vec(meta.hash_table.offset, meta.hash_table.size)?;
        let anchored = Sha256Hash::from_data(&table) == meta.master_hash;
        if anchored {
            debug!(
                "Hash table of {} entries matches master hash",
                table.len() / SHA256_SIZE
            );
        } else {
            warn!("Hash table does not match master hash {}", meta.master_hash);
        }

        Ok(Self {
            block_size: meta.block_size,
            data_size: meta.data.size,
            table,
            anchored,
        })
    }

    /// Whether the hash table matched the master hash
    pub fn is_anchored(&self) -> bool {
        self.anchored
    }
}

impl BlockVerifier for FlatHashVerifier {
    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn data_size(&self) -> u64 {
        self.data_size
    }

    fn verify_block(&self, index: u64, data: &[u8]) -> NcaResult<()> {
        if !self.anchored {
            return Err(NcaError::IntegrityViolation {
                level: IntegrityLevel::Master,
                index: 0,
            });
        }

        let expected = hash_entry(&self.table, index).ok_or(NcaError::OutOfRange {
            offset: index.saturating_mul(self.block_size),
            size: self.data_size,
        })?;

        if Sha256Hash::from_data(data).as_bytes() != expected {
            return Err(NcaError::IntegrityViolation {
                level: IntegrityLevel::Data,
                index,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for FlatHashVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlatHashVerifier")
            .field("block_size", &self.block_size)
            .field("data_size", &self.data_size)
            .field("anchored", &self.anchored)
            .finish_non_exhaustive()
    }
}

/// Layered family: every level holds the hashes of the level below
///
/// Checking a data block walks up through the hash levels that cover it,
/// each verified against its parent and finally against the master hash.
/// Verified hash-level blocks are cached; data blocks are hashed on every
/// read.
pub struct LayeredHashVerifier {
    source: Arc<DecryptingSource>,
    master_hash: Sha256Hash,
    levels: Vec<HashLevel>,
    verified: Mutex<HashMap<(usize, u64), Arc<[u8]>>>,
}

impl LayeredHashVerifier {
    pub(crate) fn new(meta: &LayeredHashMetadata, source: Arc<DecryptingSource>) -> Self {
        Self {
            source,
            master_hash: meta.master_hash,
            levels: meta.levels().to_vec(),
            verified: Mutex::new(HashMap::new()),
        }
    }

    fn data_level(&self) -> usize {
        self.levels.len() - 1
    }

    /// Expected digest of block `index` of `level`
    fn expected_hash(&self, level: usize, index: u64) -> NcaResult<Sha256Hash> {
        if level == 0 {
            return Ok(self.master_hash);
        }

        let parent = level - 1;
        let parent_block_size = self.levels[parent].block_size;
        let entry_offset = index * SHA256_SIZE as u64;
        let parent_block = self.verified_hash_block(parent, entry_offset / parent_block_size)?;

        let within = (entry_offset % parent_block_size) as usize;
        parent_block
            .get(within..within + SHA256_SIZE)
            .and_then(Sha256Hash::from_slice)
            .ok_or(NcaError::IntegrityViolation {
                level: hash_level(parent),
                index: entry_offset / parent_block_size,
            })
    }

    /// Block `index` of hash level `level`, verified up to the master hash
    fn verified_hash_block(&self, level: usize, index: u64) -> NcaResult<Arc<[u8]>> {
        if let Some(block) = self.verified.lock().get(&(level, index)) {
            return Ok(Arc::clone(block));
        }

        let info = self.levels[level];
        let start = index * info.block_size;
        let len = info.block_size.min(info.region.size.saturating_sub(start));
        let bytes = self.source.read_vec(info.region.offset + start, len)?;

        let expected = self.expected_hash(level, index)?;
        if Sha256Hash::from_padded(&bytes, info.block_size as usize) != expected {
            warn!("Hash level {} block {} failed verification", level, index);
            return Err(NcaError::IntegrityViolation {
                level: hash_level(level),
                index,
            });
        }

        let block: Arc<[u8]> = bytes.into();
        self.verified
            .lock()
            .insert((level, index), Arc::clone(&block));
        Ok(block)
    }
}

fn hash_level(level: usize) -> IntegrityLevel {
    IntegrityLevel::Hash(u8::try_from(level).unwrap_or(u8::MAX))
}

impl BlockVerifier for LayeredHashVerifier {
    fn block_size(&self) -> u64 {
        self.levels[self.data_level()].block_size
    }

    fn data_size(&self) -> u64 {
        self.levels[self.data_level()].region.size
    }

    fn verify_block(&self, index: u64, data: &[u8]) -> NcaResult<()> {
        if index >= self.block_count() {
            return Err(NcaError::OutOfRange {
                offset: index.saturating_mul(self.block_size()),
                size: self.data_size(),
            });
        }

        let expected = self.expected_hash(self.data_level(), index)?;
        if Sha256Hash::from_padded(data, self.block_size() as usize) != expected {
            return Err(NcaError::IntegrityViolation {
                level: IntegrityLevel::Data,
                index,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for LayeredHashVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayeredHashVerifier")
            .field("levels", &self.levels)
            .field("cached_blocks", &self.verified.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::nca::fs_header::{FsHeader, HASH_INFO_SIZE, HashTreeKind};
    use crate::nca::header::PartitionEntry;

    fn plain_source(bytes: Vec<u8>) -> Arc<DecryptingSource> {
        let entry = PartitionEntry {
            index: 0,
            offset: 0,
            size: bytes.len() as u64,
            fs_header: FsHeader::parse(&[0u8; 0x200]).unwrap(),
            fs_header_hash: Sha256Hash::default(),
            actual_fs_header_hash: Sha256Hash::default(),
        };
        Arc::new(DecryptingSource::new(Arc::new(bytes), &entry, None))
    }

    /// Partition image: [hash table | padding | data], flat tree
    fn flat_partition(data: &[u8], block_size: usize) -> (Vec<u8>, HashTreeMetadata) {
        let mut table = Vec::new();
        for block in data.chunks(block_size) {
            table.extend_from_slice(Sha256Hash::from_data(block).as_bytes());
        }

        let data_offset = 0x200u64;
        let mut image = table.clone();
        image.resize(data_offset as usize, 0);
        image.extend_from_slice(data);

        let mut info = [0u8; HASH_INFO_SIZE];
        info[..0x20].copy_from_slice(Sha256Hash::from_data(&table).as_bytes());
        info[0x20..0x24].copy_from_slice(&(block_size as u32).to_le_bytes());
        info[0x24..0x28].copy_from_slice(&2u32.to_le_bytes());
        info[0x30..0x38].copy_from_slice(&(table.len() as u64).to_le_bytes());
        info[0x38..0x40].copy_from_slice(&data_offset.to_le_bytes());
        info[0x40..0x48].copy_from_slice(&(data.len() as u64).to_le_bytes());
        (image, HashTreeMetadata::parse(HashTreeKind::Flat, &info).unwrap())
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    #[test]
    fn test_flat_verifies_blocks() {
        let data = data(0x2800);
        let (image, meta) = flat_partition(&data, 0x1000);
        let verifier = open_verifier(&meta, plain_source(image)).unwrap();

        assert_eq!(verifier.block_count(), 3);
        verifier.verify_block(0, &data[..0x1000]).unwrap();
        verifier.verify_block(2, &data[0x2000..]).unwrap();

        let mut tampered = data[0x1000..0x2000].to_vec();
        tampered[5] ^= 0x80;
        assert!(matches!(
            verifier.verify_block(1, &tampered),
            Err(NcaError::IntegrityViolation { level: IntegrityLevel::Data, index: 1 })
        ));
        assert!(verifier.verify_block(3, &[]).is_err());
    }

    #[test]
    fn test_flat_unanchored_table_fails_every_block() {
        let data = data(0x2000);
        let (mut image, meta) = flat_partition(&data, 0x1000);
        // The data still matches its table entries except block 0, but the
        // table no longer matches the master hash.
        image[0] ^= 1;
        let source = plain_source(image);

        let HashTreeMetadata::Flat(flat) = &meta else {
            unreachable!();
        };
        let verifier = FlatHashVerifier::open(flat, &source).unwrap();
        assert!(!verifier.is_anchored());
        for index in 0..2 {
            let block = &data[index as usize * 0x1000..(index as usize + 1) * 0x1000];
            assert!(matches!(
                verifier.verify_block(index, block),
                Err(NcaError::IntegrityViolation { level: IntegrityLevel::Master, .. })
            ));
        }
    }

    #[test]
    fn test_layered_caches_verified_hash_blocks() {
        let data = data(0x2000);
        let tree = test_utils::layered_tree(&data, 10, 3, false);
        let HashTreeMetadata::Layered(meta) =
            HashTreeMetadata::parse(HashTreeKind::Layered, &tree.hash_info).unwrap()
        else {
            unreachable!();
        };
        let verifier = LayeredHashVerifier::new(&meta, plain_source(tree.bytes));
        assert!(verifier.verified.lock().is_empty());

        verifier.verify_block(0, &data[..0x400]).unwrap();
        assert_eq!(verifier.verified.lock().len(), 2);

        // Siblings under the same level 1 block reuse the cached chain
        for index in 1..8 {
            let start = index as usize * 0x400;
            verifier.verify_block(index, &data[start..start + 0x400]).unwrap();
        }
        assert_eq!(verifier.verified.lock().len(), 2);

        let mut tampered = data[0x800..0xC00].to_vec();
        tampered[0] ^= 1;
        assert!(matches!(
            verifier.verify_block(2, &tampered),
            Err(NcaError::IntegrityViolation { level: IntegrityLevel::Data, index: 2 })
        ));
    }

    #[test]
    fn test_open_validates_structure() {
        let data = data(0x2000);
        let (image, meta) = flat_partition(&data, 0x1000);
        let short = image[..image.len() - 1].to_vec();
        assert!(matches!(
            open_verifier(&meta, plain_source(short)),
            Err(NcaError::InvalidHashTree(_))
        ));
    }
}
