//! Verified partition reader
//!
//! [`PartitionReader`] is the only way partition bytes leave this crate. Every
//! read is widened to whole data blocks, each block is checked against the
//! partition's hash tree, and only then is the requested range copied out.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, trace, warn};

use crate::nca::decrypt::DecryptingSource;
use crate::nca::error::{NcaError, NcaResult};
use crate::nca::hash_tree::{HashTreeMetadata, Region};
use crate::nca::integrity::{BlockVerifier, open_verifier};

/// Blocks read per request by [`PartitionReader::verify_all`] and
/// [`PartitionReader::copy_to`]
const BATCH_BLOCKS: u64 = 16;

/// Decrypted, integrity-checked view of one partition's payload
///
/// Offsets address the hash tree's data region, starting at 0.
#[derive(Debug)]
pub struct PartitionReader {
    index: usize,
    source: Arc<DecryptingSource>,
    data: Region,
    verifier: Box<dyn BlockVerifier>,
}

impl PartitionReader {
    pub(crate) fn open(
        index: usize,
        metadata: &HashTreeMetadata,
        source: Arc<DecryptingSource>,
    ) -> NcaResult<Self> {
        let verifier = open_verifier(metadata, Arc::clone(&source))?;
        let data = metadata.data_region();
        debug!(
            "Opened partition {} reader: {:#x} bytes in {} blocks of {:#x}",
            index,
            data.size,
            verifier.block_count(),
            verifier.block_size()
        );

        Ok(Self {
            index,
            source,
            data,
            verifier,
        })
    }

    /// Partition slot this reader belongs to
    pub fn index(&self) -> usize {
        self.index
    }

    /// Size of the readable payload
    pub fn size(&self) -> u64 {
        self.data.size
    }

    /// Size of one verification block
    pub fn block_size(&self) -> u64 {
        self.verifier.block_size()
    }

    /// Number of verification blocks
    pub fn block_count(&self) -> u64 {
        self.verifier.block_count()
    }

    /// Read up to `len` verified bytes at `offset`
    ///
    /// Reading at exactly [`size`](Self::size) returns no bytes. Starting
    /// past it fails with `OutOfRange`. Reads that run past the end are
    /// shortened.
    pub fn read(&self, offset: u64, len: usize) -> NcaResult<Vec<u8>> {
        let size = self.size();
        if offset > size {
            return Err(NcaError::OutOfRange { offset, size });
        }

        let available = usize::try_from(size - offset).unwrap_or(usize::MAX);
        let mut buf = vec![0u8; len.min(available)];
        let read = self.read_into(offset, &mut buf)?;
        buf.truncate(read);
        Ok(buf)
    }

    /// Fill `buf` with verified bytes at `offset`, returning the count
    pub fn read_into(&self, offset: u64, buf: &mut [u8]) -> NcaResult<usize> {
        let size = self.size();
        if offset > size {
            return Err(NcaError::OutOfRange { offset, size });
        }

        let end = offset.saturating_add(buf.len() as u64).min(size);
        if end == offset {
            return Ok(0);
        }

        let block_size = self.block_size();
        let first = offset / block_size;
        let last = (end - 1) / block_size;
        let span = self.verified_blocks(first, last)?;

        let skip = (offset - first * block_size) as usize;
        let len = (end - offset) as usize;
        buf[..len].copy_from_slice(&span[skip..skip + len]);
        Ok(len)
    }

    /// Verify data blocks `first..=last` and return their bytes
    fn verified_blocks(&self, first: u64, last: u64) -> NcaResult<Vec<u8>> {
        let block_size = self.block_size();
        let start = first * block_size;
        let end = ((last + 1) * block_size).min(self.size());
        let span = self
            .source
            .read_vec(self.data.offset + start, end - start)?;

        for (i, block) in span.chunks(block_size as usize).enumerate() {
            let index = first + i as u64;
            if let Err(err) = self.verifier.verify_block(index, block) {
                warn!("Partition {} block {} failed: {}", self.index, index, err);
                return Err(err);
            }
        }
        trace!(
            "Partition {} verified blocks {}..={}",
            self.index, first, last
        );
        Ok(span)
    }

    /// Check a single data block
    pub fn verify_block(&self, index: u64) -> NcaResult<()> {
        if index >= self.block_count() {
            return Err(NcaError::OutOfRange {
                offset: index.saturating_mul(self.block_size()),
                size: self.size(),
            });
        }
        self.verified_blocks(index, index).map(|_| ())
    }

    /// Walk every data block, stopping at the first failure
    ///
    /// `cancel` is polled between batches; once set the walk stops with
    /// `Cancelled`. Returns the number of blocks verified.
    pub fn verify_all(&self, cancel: &AtomicBool) -> NcaResult<u64> {
        let count = self.block_count();
        let mut next = 0;
        while next < count {
            if cancel.load(Ordering::Relaxed) {
                debug!("Partition {} verification cancelled at block {}", self.index, next);
                return Err(NcaError::Cancelled);
            }
            let last = (next + BATCH_BLOCKS).min(count) - 1;
            self.verified_blocks(next, last)?;
            next = last + 1;
        }

        debug!("Partition {} verified: {} blocks", self.index, count);
        Ok(count)
    }

    /// Write the whole verified payload to `writer`
    ///
    /// Nothing from a block is written until that block has verified.
    pub fn copy_to<W: Write>(&self, writer: &mut W) -> NcaResult<u64> {
        let count = self.block_count();
        let mut written = 0u64;
        let mut next = 0;
        while next < count {
            let last = (next + BATCH_BLOCKS).min(count) - 1;
            let span = self.verified_blocks(next, last)?;
            writer.write_all(&span)?;
            written += span.len() as u64;
            next = last + 1;
        }
        Ok(written)
    }

    /// `Read + Seek` adapter starting at offset 0
    pub fn cursor(&self) -> PartitionCursor<'_> {
        PartitionCursor {
            reader: self,
            position: 0,
        }
    }
}

/// Sequential view of a [`PartitionReader`]
///
/// Integrity failures surface as `InvalidData` I/O errors.
#[derive(Debug)]
pub struct PartitionCursor<'a> {
    reader: &'a PartitionReader,
    position: u64,
}

impl PartitionCursor<'_> {
    /// Current position
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Read for PartitionCursor<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.reader.size() {
            return Ok(0);
        }
        let read = self.reader.read_into(self.position, buf)?;
        self.position += read as u64;
        Ok(read)
    }
}

impl Seek for PartitionCursor<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.reader.size().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };

        let target = target.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )
        })?;
        self.position = target;
        Ok(target)
    }
}
