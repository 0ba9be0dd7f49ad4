//! Decrypted view of one partition's raw bytes

use std::fmt;
use std::sync::Arc;

use nxguard_crypto::{CtrCipher, NCA_SECTOR_SIZE, XtsCipher};

use crate::nca::error::{NcaError, NcaResult};
use crate::nca::header::PartitionEntry;
use crate::nca::key_area::ContentKey;
use crate::nca::source::ByteSource;

enum PartitionCipher {
    Plain,
    Ctr(CtrCipher),
    Xts(XtsCipher),
}

/// Partition bytes, decrypted on read
///
/// Offsets are relative to the partition start. This type hands out
/// decrypted but unverified bytes and is only used beneath the integrity
/// verifiers.
pub(crate) struct DecryptingSource {
    source: Arc<dyn ByteSource>,
    partition_offset: u64,
    partition_size: u64,
    cipher: PartitionCipher,
}

impl DecryptingSource {
    pub(crate) fn new(
        source: Arc<dyn ByteSource>,
        partition: &PartitionEntry,
        key: Option<&ContentKey>,
    ) -> Self {
        let cipher = match key {
            None => PartitionCipher::Plain,
            Some(ContentKey::Ctr(key)) => {
                PartitionCipher::Ctr(CtrCipher::new(key, partition.fs_header.ctr_upper))
            }
            Some(ContentKey::Xts(key)) => PartitionCipher::Xts(XtsCipher::new(key)),
        };

        Self {
            source,
            partition_offset: partition.offset,
            partition_size: partition.size,
            cipher,
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.partition_size
    }

    /// Read and decrypt `buf.len()` bytes at partition offset `offset`
    pub(crate) fn read_at(&self, offset: u64, buf: &mut [u8]) -> NcaResult<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|&end| end <= self.partition_size)
            .ok_or(NcaError::OutOfRange {
                offset,
                size: self.partition_size,
            })?;

        match &self.cipher {
            PartitionCipher::Plain => {
                self.source.read_at(self.partition_offset + offset, buf)?;
            }
            PartitionCipher::Ctr(cipher) => {
                let absolute = self.partition_offset + offset;
                self.source.read_at(absolute, buf)?;
                cipher.apply_keystream(absolute, buf);
            }
            PartitionCipher::Xts(cipher) => {
                let sector = NCA_SECTOR_SIZE as u64;
                let aligned_start = offset / sector * sector;
                let aligned_end = end.div_ceil(sector) * sector;

                if aligned_start == offset && aligned_end == end {
                    self.source.read_at(self.partition_offset + offset, buf)?;
                    cipher.decrypt_sectors(buf, NCA_SECTOR_SIZE, offset / sector)?;
                } else {
                    // Partition sizes are sector multiples, so the aligned
                    // span never runs past the partition.
                    let mut span = vec![0u8; (aligned_end - aligned_start) as usize];
                    self.source
                        .read_at(self.partition_offset + aligned_start, &mut span)?;
                    cipher.decrypt_sectors(&mut span, NCA_SECTOR_SIZE, aligned_start / sector)?;
                    let skip = (offset - aligned_start) as usize;
                    buf.copy_from_slice(&span[skip..skip + buf.len()]);
                }
            }
        }

        Ok(())
    }

    pub(crate) fn read_vec(&self, offset: u64, len: u64) -> NcaResult<Vec<u8>> {
        let len = usize::try_from(len).map_err(|_| NcaError::OutOfRange {
            offset,
            size: self.partition_size,
        })?;
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }
}

impl fmt::Debug for DecryptingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.cipher {
            PartitionCipher::Plain => "plain",
            PartitionCipher::Ctr(_) => "aes-ctr",
            PartitionCipher::Xts(_) => "aes-xts",
        };
        f.debug_struct("DecryptingSource")
            .field("partition_offset", &self.partition_offset)
            .field("partition_size", &self.partition_size)
            .field("mode", &mode)
            .finish_non_exhaustive()
    }
}
