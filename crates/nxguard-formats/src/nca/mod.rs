//! NCA content archives
//!
//! An NCA is a 0xC00-byte header block followed by up to four partitions.
//! Each partition is optionally encrypted (AES-CTR or AES-XTS) and protected
//! by a hash tree, either a flat block-hash table or a layered IVFC tree.
//!
//! [`NcaProcessor`] drives the full pipeline and produces a
//! [`VerificationReport`] plus one [`PartitionReader`] per usable partition.
//! The lower-level pieces are public for callers that need only part of it,
//! such as decoding a header for display.

mod config;
mod decrypt;
mod error;
mod fs_header;
mod hash_tree;
mod header;
mod integrity;
mod key_area;
mod process;
mod reader;
mod report;
mod signature;
mod source;

pub use config::{FailurePolicy, ProcessConfig, SignaturePolicy};
pub use error::{FailureKind, IntegrityLevel, NcaError, NcaResult};
pub use fs_header::{
    EncryptionType, FS_HEADER_SIZE, FormatType, FsHeader, HASH_INFO_SIZE, HashTreeKind, HashType,
};
pub use hash_tree::{
    FlatHashMetadata, HashLevel, HashTreeMetadata, IVFC_MAGIC, IVFC_MAX_LEVELS,
    LayeredHashMetadata, Region, block_count,
};
pub use header::{
    ContentType, DistributionType, FS_HEADERS_OFFSET, MAGIC_OFFSET, MAX_PARTITIONS,
    MEDIA_UNIT_SIZE, NCA_HEADER_SIZE, NcaHeader, NcaVersion, PartitionEntry, SIGNATURE_SIZE,
    decrypt_header_block, is_plaintext_header,
};
pub use integrity::{BlockVerifier, FlatHashVerifier, LayeredHashVerifier};
pub use key_area::{
    CTR_SLOT, ContentKey, KEY_AREA_SLOTS, KeyArea, KeyAreaSlot, KeyDeriver, PartitionKeys,
    XTS_DATA_SLOT, XTS_TWEAK_SLOT,
};
pub use process::{NcaProcessor, ProcessedNca};
pub use reader::{PartitionCursor, PartitionReader};
pub use report::{PartitionOutcome, PartitionRecord, VerificationReport};
pub use signature::{SignatureKeyTable, SignatureReport, SignatureStatus, verify_header};
pub use source::{ByteSource, ReaderSource};
