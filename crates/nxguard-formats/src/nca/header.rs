//! NCA header block (0xC00 bytes)
//!
//! The header carries two RSA signatures, the content metadata, a table of
//! up to four partitions, the wrapped key area and one FS header per
//! partition. On disk it is AES-XTS encrypted with the console header key.

use std::io::Cursor;

use binrw::BinRead;
use nxguard_crypto::{AesXtsKey, KeyAreaKeyIndex, NCA_SECTOR_SIZE, Sha256Hash, XtsCipher};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::nca::error::{IntegrityLevel, NcaError, NcaResult};
use crate::nca::fs_header::{FS_HEADER_SIZE, FsHeader};
use crate::nca::key_area::KeyArea;

/// Size of the full header block
pub const NCA_HEADER_SIZE: usize = 0xC00;

/// Partition table offsets and sizes are expressed in these units
pub const MEDIA_UNIT_SIZE: u64 = 0x200;

/// Number of partition slots in the header
pub const MAX_PARTITIONS: usize = 4;

/// Size of each RSA signature in the header
pub const SIGNATURE_SIZE: usize = 0x100;

/// Offset of the magic, which is also the start of the signed region
pub const MAGIC_OFFSET: usize = 0x200;

/// Offset of the first FS header
pub const FS_HEADERS_OFFSET: usize = 0x400;

const SIGNED_REGION_END: usize = 0x400;

/// Header format version, taken from the magic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NcaVersion {
    /// `NCA2`: FS headers encrypted independently
    Nca2,
    /// `NCA3`: whole header encrypted as one sector run
    Nca3,
}

impl NcaVersion {
    fn from_magic(magic: &[u8; 4]) -> NcaResult<Self> {
        match magic {
            b"NCA3" => Ok(Self::Nca3),
            b"NCA2" => Ok(Self::Nca2),
            b"NCA0" | b"NCA1" => Err(NcaError::UnsupportedFormat(format!(
                "{} headers are not supported",
                String::from_utf8_lossy(magic)
            ))),
            _ => Err(NcaError::MalformedHeader(format!(
                "invalid magic {}",
                hex::encode(magic)
            ))),
        }
    }
}

/// Where the content was distributed from
#[derive(BinRead, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[br(repr = u8)]
#[serde(rename_all = "snake_case")]
pub enum DistributionType {
    /// Downloaded from the CDN
    Download = 0,
    /// Stored on a game card
    GameCard = 1,
}

/// Kind of content the NCA holds
#[derive(BinRead, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[br(repr = u8)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// Executable code
    Program = 0,
    /// Content metadata
    Meta = 1,
    /// Icons and title information
    Control = 2,
    /// Digital manual
    Manual = 3,
    /// Generic data
    Data = 4,
    /// Public data
    PublicData = 5,
}

#[derive(BinRead, Debug, Clone, Copy)]
#[br(little)]
struct RawPartitionEntry {
    start: u32,
    #[br(pad_after = 8)]
    end: u32,
}

#[derive(BinRead)]
#[br(little)]
struct RawHeader {
    fixed_key_signature: [u8; SIGNATURE_SIZE],
    acid_signature: [u8; SIGNATURE_SIZE],
    _magic: [u8; 4],
    distribution_type: DistributionType,
    content_type: ContentType,
    key_generation_old: u8,
    key_area_key_index: u8,
    content_size: u64,
    program_id: u64,
    content_index: u32,
    sdk_addon_version: u32,
    key_generation: u8,
    signature_key_generation: u8,
    #[br(pad_before = 0xE)]
    rights_id: [u8; 16],
    partition_table: [RawPartitionEntry; MAX_PARTITIONS],
    fs_header_hashes: [Sha256Hash; MAX_PARTITIONS],
    #[br(pad_after = 0xC0)]
    key_area: [[u8; 16]; MAX_PARTITIONS],
}

/// One present partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    /// Slot in the partition table
    pub index: usize,
    /// Absolute byte offset in the NCA
    pub offset: u64,
    /// Size in bytes
    pub size: u64,
    /// Decoded FS header
    pub fs_header: FsHeader,
    /// FS header digest recorded in the NCA header
    pub fs_header_hash: Sha256Hash,
    /// Digest of the FS header bytes actually present
    pub actual_fs_header_hash: Sha256Hash,
}

impl PartitionEntry {
    /// End offset (exclusive) in the NCA
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Check the FS header against the digest recorded in the NCA header
    pub fn verify_fs_header_hash(&self) -> NcaResult<()> {
        if self.fs_header_hash == self.actual_fs_header_hash {
            Ok(())
        } else {
            Err(NcaError::IntegrityViolation {
                level: IntegrityLevel::FsHeader,
                index: self.index as u64,
            })
        }
    }
}

/// Decoded NCA header
#[derive(Debug, Clone)]
pub struct NcaHeader {
    /// Format version
    pub version: NcaVersion,
    /// Distribution type
    pub distribution_type: DistributionType,
    /// Content type
    pub content_type: ContentType,
    /// Effective key generation (the larger of the two header fields)
    pub key_generation: u8,
    /// Which key-area key family wraps the key area
    pub key_area_key_index: KeyAreaKeyIndex,
    /// Total NCA size in bytes
    pub content_size: u64,
    /// Program (title) id
    pub program_id: u64,
    /// Content index
    pub content_index: u32,
    /// SDK addon version
    pub sdk_addon_version: u32,
    /// Selects the public key for the fixed-key signature
    pub signature_key_generation: u8,
    /// Rights id, all zero when the key area is used
    pub rights_id: [u8; 16],
    /// Signature over the signed region with the fixed key
    pub fixed_key_signature: [u8; SIGNATURE_SIZE],
    /// Signature over the signed region with the ACID key
    pub acid_signature: [u8; SIGNATURE_SIZE],
    partitions: [Option<PartitionEntry>; MAX_PARTITIONS],
    key_area: KeyArea,
    raw: Box<[u8; NCA_HEADER_SIZE]>,
}

impl NcaHeader {
    /// Decode a plaintext header block
    ///
    /// The block must be exactly [`NCA_HEADER_SIZE`] bytes. Partition ranges
    /// are checked against the content size and against each other.
    pub fn decode(raw: &[u8]) -> NcaResult<Self> {
        let raw: Box<[u8; NCA_HEADER_SIZE]> = raw
            .try_into()
            .map(Box::new)
            .map_err(|_| {
                NcaError::MalformedHeader(format!(
                    "header is {:#x} bytes, expected {NCA_HEADER_SIZE:#x}",
                    raw.len()
                ))
            })?;

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&raw[MAGIC_OFFSET..MAGIC_OFFSET + 4]);
        let version = NcaVersion::from_magic(&magic)?;

        let fields = RawHeader::read(&mut Cursor::new(&raw[..]))
            .map_err(|e| NcaError::MalformedHeader(format!("header fields: {e}")))?;

        let key_area_key_index = KeyAreaKeyIndex::from_byte(fields.key_area_key_index)
            .ok_or_else(|| {
                NcaError::MalformedHeader(format!(
                    "invalid key area key index {}",
                    fields.key_area_key_index
                ))
            })?;

        let mut partitions: [Option<PartitionEntry>; MAX_PARTITIONS] = Default::default();
        for (index, entry) in fields.partition_table.iter().enumerate() {
            if entry.end < entry.start {
                return Err(NcaError::MalformedHeader(format!(
                    "partition {index} ends before it starts"
                )));
            }
            if entry.start == entry.end {
                continue;
            }

            let offset = u64::from(entry.start) * MEDIA_UNIT_SIZE;
            let size = u64::from(entry.end - entry.start) * MEDIA_UNIT_SIZE;
            if offset < NCA_HEADER_SIZE as u64 {
                return Err(NcaError::MalformedHeader(format!(
                    "partition {index} overlaps the header"
                )));
            }
            if offset + size > fields.content_size {
                return Err(NcaError::MalformedHeader(format!(
                    "partition {index} ends at {:#x}, past content size {:#x}",
                    offset + size,
                    fields.content_size
                )));
            }

            let fs_start = FS_HEADERS_OFFSET + index * FS_HEADER_SIZE;
            let fs_bytes = &raw[fs_start..fs_start + FS_HEADER_SIZE];
            partitions[index] = Some(PartitionEntry {
                index,
                offset,
                size,
                fs_header: FsHeader::parse(fs_bytes)?,
                fs_header_hash: fields.fs_header_hashes[index],
                actual_fs_header_hash: Sha256Hash::from_data(fs_bytes),
            });
        }

        check_overlaps(&partitions)?;

        let header = Self {
            version,
            distribution_type: fields.distribution_type,
            content_type: fields.content_type,
            key_generation: fields.key_generation_old.max(fields.key_generation),
            key_area_key_index,
            content_size: fields.content_size,
            program_id: fields.program_id,
            content_index: fields.content_index,
            sdk_addon_version: fields.sdk_addon_version,
            signature_key_generation: fields.signature_key_generation,
            rights_id: fields.rights_id,
            fixed_key_signature: fields.fixed_key_signature,
            acid_signature: fields.acid_signature,
            partitions,
            key_area: KeyArea::new(fields.key_area),
            raw,
        };

        debug!(
            "Decoded {:?} header: program {:016X}, {:?}, key generation {}, {} partitions",
            header.version,
            header.program_id,
            header.content_type,
            header.key_generation,
            header.partition_count()
        );

        Ok(header)
    }

    /// Decode a header block that may still be encrypted
    ///
    /// Plaintext blocks are decoded directly. Encrypted blocks need the
    /// header key; without one this fails with `MissingKey`.
    pub fn parse(raw: &[u8], header_key: Option<&AesXtsKey>) -> NcaResult<Self> {
        if is_plaintext_header(raw) {
            trace!("Header block is plaintext");
            return Self::decode(raw);
        }

        let key = header_key
            .ok_or_else(|| NcaError::MissingKey("header key".to_string()))?;
        Self::decode(&decrypt_header_block(raw, key)?)
    }

    /// Master key revision used to select key-area keys and title key
    /// encryption keys
    pub fn master_key_revision(&self) -> u8 {
        self.key_generation.saturating_sub(1)
    }

    /// Whether content keys come from a title key rather than the key area
    pub fn uses_title_key(&self) -> bool {
        self.rights_id.iter().any(|&b| b != 0)
    }

    /// Partition in slot `index`, if present
    pub fn partition(&self, index: usize) -> Option<&PartitionEntry> {
        self.partitions.get(index).and_then(Option::as_ref)
    }

    /// All present partitions in slot order
    pub fn partitions(&self) -> impl Iterator<Item = &PartitionEntry> {
        self.partitions.iter().flatten()
    }

    /// Number of present partitions
    pub fn partition_count(&self) -> usize {
        self.partitions().count()
    }

    /// Wrapped key area as read from the header
    pub fn key_area(&self) -> &KeyArea {
        &self.key_area
    }

    /// Bytes covered by both header signatures
    pub fn signed_region(&self) -> &[u8] {
        &self.raw[MAGIC_OFFSET..SIGNED_REGION_END]
    }

    /// Full decrypted header block
    pub fn raw(&self) -> &[u8; NCA_HEADER_SIZE] {
        &self.raw
    }
}

fn check_overlaps(partitions: &[Option<PartitionEntry>]) -> NcaResult<()> {
    let mut ranges: Vec<&PartitionEntry> = partitions.iter().flatten().collect();
    ranges.sort_by_key(|entry| entry.offset);

    for pair in ranges.windows(2) {
        if pair[0].end() > pair[1].offset {
            return Err(NcaError::MalformedHeader(format!(
                "partitions {} and {} overlap",
                pair[0].index, pair[1].index
            )));
        }
    }
    Ok(())
}

/// Whether the magic of a header block is readable without decryption
pub fn is_plaintext_header(raw: &[u8]) -> bool {
    raw.get(MAGIC_OFFSET..MAGIC_OFFSET + 4)
        .is_some_and(|magic| matches!(magic, b"NCA0" | b"NCA1" | b"NCA2" | b"NCA3"))
}

/// Decrypt an encrypted header block with the header key
///
/// NCA3 headers are one contiguous run of 0x200-byte XTS sectors. NCA2
/// headers encrypt the first two sectors as a run and every FS header as its
/// own sector 0. The magic decides which layout applies; an unrecognized
/// magic is left for [`NcaHeader::decode`] to reject.
pub fn decrypt_header_block(raw: &[u8], header_key: &AesXtsKey) -> NcaResult<Vec<u8>> {
    if raw.len() != NCA_HEADER_SIZE {
        return Err(NcaError::MalformedHeader(format!(
            "header is {:#x} bytes, expected {NCA_HEADER_SIZE:#x}",
            raw.len()
        )));
    }

    let cipher = XtsCipher::new(header_key);
    let mut block = raw.to_vec();
    cipher.decrypt_sectors(&mut block[..FS_HEADERS_OFFSET], NCA_SECTOR_SIZE, 0)?;

    match &block[MAGIC_OFFSET..MAGIC_OFFSET + 4] {
        b"NCA3" => {
            cipher.decrypt_sectors(&mut block[FS_HEADERS_OFFSET..], NCA_SECTOR_SIZE, 2)?;
        }
        b"NCA2" => {
            for fs_header in block[FS_HEADERS_OFFSET..].chunks_exact_mut(FS_HEADER_SIZE) {
                cipher.decrypt_sectors(fs_header, NCA_SECTOR_SIZE, 0)?;
            }
        }
        _ => {}
    }

    Ok(block)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::nca::error::FailureKind;
    use crate::nca::fs_header::{EncryptionType, FormatType};

    fn plain_header(version: &[u8; 4]) -> Vec<u8> {
        let mut raw = vec![0u8; NCA_HEADER_SIZE];
        raw[0x200..0x204].copy_from_slice(version);
        raw[0x205] = 2; // control
        raw[0x206] = 2;
        raw[0x207] = 1; // ocean
        raw[0x208..0x210].copy_from_slice(&0x10000u64.to_le_bytes());
        raw[0x210..0x218].copy_from_slice(&0x0100_0000_0000_1000u64.to_le_bytes());
        raw[0x220] = 5;

        set_partition(&mut raw, 0, 0x6, 0x20);
        set_partition(&mut raw, 2, 0x20, 0x80);
        raw
    }

    fn set_partition(raw: &mut [u8], index: usize, start: u32, end: u32) {
        let entry = 0x240 + index * 0x10;
        raw[entry..entry + 4].copy_from_slice(&start.to_le_bytes());
        raw[entry + 4..entry + 8].copy_from_slice(&end.to_le_bytes());

        let fs = FS_HEADERS_OFFSET + index * FS_HEADER_SIZE;
        raw[fs + 2] = 1;
        raw[fs + 4] = 3;
        let digest = Sha256Hash::from_data(&raw[fs..fs + FS_HEADER_SIZE]);
        raw[0x280 + index * 0x20..0x2A0 + index * 0x20].copy_from_slice(digest.as_bytes());
    }

    #[test]
    fn test_decode_fields() {
        let header = NcaHeader::decode(&plain_header(b"NCA3")).unwrap();
        assert_eq!(header.version, NcaVersion::Nca3);
        assert_eq!(header.distribution_type, DistributionType::Download);
        assert_eq!(header.content_type, ContentType::Control);
        assert_eq!(header.key_generation, 5);
        assert_eq!(header.master_key_revision(), 4);
        assert_eq!(header.key_area_key_index, KeyAreaKeyIndex::Ocean);
        assert_eq!(header.program_id, 0x0100_0000_0000_1000);
        assert!(!header.uses_title_key());
        assert_eq!(header.signed_region().len(), 0x200);
        assert_eq!(&header.signed_region()[..4], b"NCA3");

        assert_eq!(header.partition_count(), 2);
        assert!(header.partition(1).is_none());
        let entry = header.partition(2).unwrap();
        assert_eq!(entry.offset, 0x4000);
        assert_eq!(entry.size, 0xC000);
        assert_eq!(entry.fs_header.format_type, FormatType::PartitionFs);
        assert_eq!(entry.fs_header.encryption_type, EncryptionType::AesCtr);
        entry.verify_fs_header_hash().unwrap();
    }

    #[test]
    fn test_exact_length_required() {
        let mut raw = plain_header(b"NCA3");
        raw.push(0);
        assert!(matches!(
            NcaHeader::decode(&raw),
            Err(NcaError::MalformedHeader(_))
        ));
        assert!(matches!(
            NcaHeader::decode(&raw[..0x400]),
            Err(NcaError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_magic_validation() {
        assert!(matches!(
            NcaHeader::decode(&plain_header(b"NCA0")),
            Err(NcaError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            NcaHeader::decode(&plain_header(b"XYZW")),
            Err(NcaError::MalformedHeader(_))
        ));
        assert_eq!(
            NcaHeader::decode(&plain_header(b"NCA2")).unwrap().version,
            NcaVersion::Nca2
        );
    }

    #[test]
    fn test_partition_past_content_size() {
        let mut raw = plain_header(b"NCA3");
        set_partition(&mut raw, 3, 0x80, 0x81);
        assert!(matches!(
            NcaHeader::decode(&raw),
            Err(NcaError::MalformedHeader(msg)) if msg.contains("past content size")
        ));
    }

    #[test]
    fn test_overlapping_partitions() {
        let mut raw = plain_header(b"NCA3");
        set_partition(&mut raw, 1, 0x1F, 0x21);
        assert!(matches!(
            NcaHeader::decode(&raw),
            Err(NcaError::MalformedHeader(msg)) if msg.contains("overlap")
        ));
    }

    #[test]
    fn test_partition_overlapping_header() {
        let mut raw = plain_header(b"NCA3");
        set_partition(&mut raw, 1, 0x2, 0x4);
        assert!(NcaHeader::decode(&raw).is_err());
    }

    #[test]
    fn test_unknown_content_type() {
        let mut raw = plain_header(b"NCA3");
        raw[0x205] = 0x42;
        assert!(matches!(NcaHeader::decode(&raw), Err(NcaError::MalformedHeader(_))));
    }

    #[test]
    fn test_unknown_distribution_type() {
        let mut raw = plain_header(b"NCA3");
        raw[0x204] = 0x7F;
        let err = NcaHeader::decode(&raw).unwrap_err();
        assert_eq!(err.kind(), FailureKind::MalformedHeader);
        assert!(matches!(err, NcaError::MalformedHeader(_)));
    }

    #[test]
    fn test_fs_header_hash_mismatch() {
        let mut raw = plain_header(b"NCA3");
        raw[FS_HEADERS_OFFSET + 0x100] ^= 1;
        let header = NcaHeader::decode(&raw).unwrap();
        assert!(matches!(
            header.partition(0).unwrap().verify_fs_header_hash(),
            Err(NcaError::IntegrityViolation {
                level: IntegrityLevel::FsHeader,
                index: 0
            })
        ));
    }

    #[test]
    fn test_nca3_header_decryption() {
        let key = AesXtsKey::from_bytes(&[0x5C; 32]);
        let plain = plain_header(b"NCA3");

        let mut encrypted = plain.clone();
        XtsCipher::new(&key)
            .encrypt_sectors(&mut encrypted, NCA_SECTOR_SIZE, 0)
            .unwrap();
        assert!(!is_plaintext_header(&encrypted));

        assert_eq!(decrypt_header_block(&encrypted, &key).unwrap(), plain);
        let header = NcaHeader::parse(&encrypted, Some(&key)).unwrap();
        assert_eq!(header.raw()[..], plain[..]);

        assert!(matches!(
            NcaHeader::parse(&encrypted, None),
            Err(NcaError::MissingKey(_))
        ));
    }

    #[test]
    fn test_nca2_header_decryption() {
        let key = AesXtsKey::from_bytes(&[0x3A; 32]);
        let plain = plain_header(b"NCA2");
        let cipher = XtsCipher::new(&key);

        let mut encrypted = plain.clone();
        cipher
            .encrypt_sectors(&mut encrypted[..FS_HEADERS_OFFSET], NCA_SECTOR_SIZE, 0)
            .unwrap();
        for fs_header in encrypted[FS_HEADERS_OFFSET..].chunks_exact_mut(FS_HEADER_SIZE) {
            cipher.encrypt_sectors(fs_header, NCA_SECTOR_SIZE, 0).unwrap();
        }

        let header = NcaHeader::parse(&encrypted, Some(&key)).unwrap();
        assert_eq!(header.version, NcaVersion::Nca2);
        header.partition(2).unwrap().verify_fs_header_hash().unwrap();
    }

    #[test]
    fn test_plaintext_header_passthrough() {
        let plain = plain_header(b"NCA3");
        assert!(is_plaintext_header(&plain));
        assert!(!is_plaintext_header(&plain[..0x100]));
        NcaHeader::parse(&plain, None).unwrap();
    }
}
