//! Verification report

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::nca::error::{FailureKind, NcaError};
use crate::nca::fs_header::{EncryptionType, HashTreeKind};
use crate::nca::header::PartitionEntry;
use crate::nca::signature::SignatureReport;

/// What happened to one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PartitionOutcome {
    /// Every data block matched the hash tree
    Verified,
    /// The reader opened but blocks were left to be checked on read
    Deferred,
    /// The partition cannot be trusted
    Failed {
        /// Failure category
        kind: FailureKind,
        /// Human-readable reason
        reason: String,
    },
}

impl PartitionOutcome {
    /// Outcome for a partition that failed with `err`
    pub fn failed(err: &NcaError) -> Self {
        Self::Failed {
            kind: err.kind(),
            reason: err.to_string(),
        }
    }

    /// Whether this is a failure
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Failure category, if failed
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Report entry for one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRecord {
    /// Partition slot
    pub index: usize,
    /// Absolute offset in the NCA
    pub offset: u64,
    /// Size in bytes
    pub size: u64,
    /// Declared encryption
    pub encryption_type: EncryptionType,
    /// Hash-tree family, when one could be determined
    pub hash_tree: Option<HashTreeKind>,
    /// Result
    pub outcome: PartitionOutcome,
}

impl PartitionRecord {
    /// Record for `entry`
    pub fn new(entry: &PartitionEntry, outcome: PartitionOutcome) -> Self {
        Self {
            index: entry.index,
            offset: entry.offset,
            size: entry.size,
            encryption_type: entry.fs_header.encryption_type,
            hash_tree: entry.fs_header.hash_tree_kind().ok(),
            outcome,
        }
    }
}

/// Per-container results: the signature outcome plus one entry per partition
///
/// Partition entries are write-once; a second record for the same slot is
/// rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Header signature outcome
    pub signature: SignatureReport,
    partitions: BTreeMap<usize, PartitionRecord>,
}

impl VerificationReport {
    /// Report with no partitions recorded yet
    pub fn new(signature: SignatureReport) -> Self {
        Self {
            signature,
            partitions: BTreeMap::new(),
        }
    }

    /// Store the entry for `record.index`
    ///
    /// Returns `false` and leaves the report unchanged if that slot already
    /// has an entry.
    pub fn record(&mut self, record: PartitionRecord) -> bool {
        match self.partitions.entry(record.index) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        }
    }

    /// Number of partitions recorded
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// Whether no partition has been recorded
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Entry for slot `index`
    pub fn get(&self, index: usize) -> Option<&PartitionRecord> {
        self.partitions.get(&index)
    }

    /// Outcome for slot `index`
    pub fn outcome(&self, index: usize) -> Option<&PartitionOutcome> {
        self.get(index).map(|record| &record.outcome)
    }

    /// All entries in slot order
    pub fn partitions(&self) -> impl Iterator<Item = &PartitionRecord> {
        self.partitions.values()
    }

    /// Entries whose outcome is a failure
    pub fn failures(&self) -> impl Iterator<Item = &PartitionRecord> {
        self.partitions().filter(|record| record.outcome.is_failure())
    }

    /// Authentic header and every partition verified
    pub fn is_fully_verified(&self) -> bool {
        self.signature.is_authentic()
            && self
                .partitions()
                .all(|record| record.outcome == PartitionOutcome::Verified)
    }
}
