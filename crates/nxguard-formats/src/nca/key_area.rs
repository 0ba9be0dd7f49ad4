//! Key area and content key derivation
//!
//! The header's key area holds four AES-128 keys wrapped with the key-area
//! key selected by (key area key index, master key revision). Slot 0 and 1
//! form the XTS key pair, slot 2 is the CTR key. Titles bought through the
//! shop carry a rights id instead, and their content key is the title key
//! unwrapped with the title key encryption key of the same revision.

use std::fmt;

use nxguard_crypto::{Aes128Key, AesXtsKey, KeyAreaKeyIndex, KeySet};
use tracing::{debug, trace};

use crate::nca::error::{NcaError, NcaResult};
use crate::nca::fs_header::EncryptionType;
use crate::nca::header::{MAX_PARTITIONS, NcaHeader, PartitionEntry};

/// Number of wrapped keys in the key area
pub const KEY_AREA_SLOTS: usize = 4;

/// Key area slot holding the XTS data key
pub const XTS_DATA_SLOT: usize = 0;
/// Key area slot holding the XTS tweak key
pub const XTS_TWEAK_SLOT: usize = 1;
/// Key area slot holding the CTR key
pub const CTR_SLOT: usize = 2;

/// One key area entry
///
/// A slot starts out wrapped and moves to derived at most once.
#[derive(Clone, PartialEq, Eq)]
pub enum KeyAreaSlot {
    /// As read from the header
    Wrapped([u8; 16]),
    /// Unwrapped with the key-area key
    Derived(Aes128Key),
}

impl KeyAreaSlot {
    /// Whether the slot has been unwrapped
    pub fn is_derived(&self) -> bool {
        matches!(self, Self::Derived(_))
    }
}

impl fmt::Debug for KeyAreaSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wrapped(bytes) => write!(f, "Wrapped({})", hex::encode(bytes)),
            Self::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

/// The four key area slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyArea {
    slots: [KeyAreaSlot; KEY_AREA_SLOTS],
}

impl KeyArea {
    /// Key area with every slot still wrapped
    pub fn new(wrapped: [[u8; 16]; KEY_AREA_SLOTS]) -> Self {
        Self {
            slots: wrapped.map(KeyAreaSlot::Wrapped),
        }
    }

    /// Slot `index`, if in range
    pub fn slot(&self, index: usize) -> Option<&KeyAreaSlot> {
        self.slots.get(index)
    }
}

/// Key that decrypts one partition
///
/// Key bytes are wiped when the value is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentKey {
    /// AES-128-CTR key
    Ctr(Aes128Key),
    /// AES-128-XTS data and tweak keys
    Xts(AesXtsKey),
}

/// Derives content keys for the partitions of one NCA
///
/// Holds its own copy of the header's key area; the header is never mutated.
/// Each slot is unwrapped on first use and cached.
pub struct KeyDeriver<'k> {
    keys: &'k KeySet,
    key_area: KeyArea,
    key_area_key_index: KeyAreaKeyIndex,
    revision: u8,
    rights_id: Option<[u8; 16]>,
    title_key: Option<Aes128Key>,
}

impl<'k> KeyDeriver<'k> {
    /// Prepare derivation for `header` using `keys`
    pub fn new(header: &NcaHeader, keys: &'k KeySet) -> Self {
        Self {
            keys,
            key_area: header.key_area().clone(),
            key_area_key_index: header.key_area_key_index,
            revision: header.master_key_revision(),
            rights_id: header.uses_title_key().then_some(header.rights_id),
            title_key: None,
        }
    }

    /// Current state of the key area
    pub fn key_area(&self) -> &KeyArea {
        &self.key_area
    }

    /// Unwrap key area slot `index`, reusing an earlier result
    pub fn derive_slot(&mut self, index: usize) -> NcaResult<Aes128Key> {
        let slot = self.key_area.slots.get_mut(index).ok_or_else(|| {
            NcaError::MalformedHeader(format!("key area slot {index} does not exist"))
        })?;

        let wrapped = match slot {
            KeyAreaSlot::Derived(key) => return Ok(key.clone()),
            KeyAreaSlot::Wrapped(wrapped) => *wrapped,
        };

        let kek = self
            .keys
            .key_area_key(self.key_area_key_index, self.revision)
            .ok_or_else(|| {
                NcaError::MissingKey(format!(
                    "key_area_key_{}_{:02x}",
                    self.key_area_key_index, self.revision
                ))
            })?;

        let key = kek.unwrap_key(&wrapped);
        *slot = KeyAreaSlot::Derived(key.clone());
        trace!("Derived key area slot {}", index);
        Ok(key)
    }

    fn derive_title_key(&mut self, rights_id: [u8; 16]) -> NcaResult<Aes128Key> {
        if let Some(key) = &self.title_key {
            return Ok(key.clone());
        }

        let encrypted = self.keys.title_key(&rights_id).ok_or_else(|| {
            NcaError::MissingKey(format!("title key for rights id {}", hex::encode(rights_id)))
        })?;
        let kek = self.keys.titlekek(self.revision).ok_or_else(|| {
            NcaError::MissingKey(format!("titlekek_{:02x}", self.revision))
        })?;

        let key = kek.unwrap_key(encrypted.as_bytes());
        self.title_key = Some(key.clone());
        debug!("Derived title key for rights id {}", hex::encode(rights_id));
        Ok(key)
    }

    /// Content key for a partition, or `None` when it is stored in plaintext
    pub fn derive(&mut self, partition: &PartitionEntry) -> NcaResult<Option<ContentKey>> {
        match partition.fs_header.encryption_type {
            EncryptionType::None => Ok(None),
            EncryptionType::AesCtr => {
                let key = match self.rights_id {
                    Some(rights_id) => self.derive_title_key(rights_id)?,
                    None => self.derive_slot(CTR_SLOT)?,
                };
                Ok(Some(ContentKey::Ctr(key)))
            }
            EncryptionType::AesXts => {
                if self.rights_id.is_some() {
                    return Err(NcaError::UnsupportedFormat(
                        "XTS partition in a title key NCA".to_string(),
                    ));
                }
                let data = self.derive_slot(XTS_DATA_SLOT)?;
                let tweak = self.derive_slot(XTS_TWEAK_SLOT)?;
                Ok(Some(ContentKey::Xts(AesXtsKey::from_halves(
                    *data.as_bytes(),
                    *tweak.as_bytes(),
                ))))
            }
            EncryptionType::AesCtrEx => Err(NcaError::UnsupportedFormat(
                "AES-CTR-EX partitions".to_string(),
            )),
            EncryptionType::Auto => Err(NcaError::UnsupportedFormat(
                "automatic encryption type".to_string(),
            )),
            EncryptionType::Unknown(value) => Err(NcaError::UnsupportedFormat(format!(
                "encryption type {value}"
            ))),
        }
    }

    /// Derive keys for every present partition
    ///
    /// Failures stay attached to their partition; one missing key does not
    /// stop the others from being derived.
    pub fn derive_all(&mut self, header: &NcaHeader) -> PartitionKeys {
        let mut keys = PartitionKeys::default();
        for partition in header.partitions() {
            let result = self.derive(partition);
            if let Err(err) = &result {
                debug!("Partition {} has no usable key: {}", partition.index, err);
            }
            keys.slots[partition.index] = Some(result);
        }
        keys
    }
}

impl fmt::Debug for KeyDeriver<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDeriver")
            .field("key_area", &self.key_area)
            .field("key_area_key_index", &self.key_area_key_index)
            .field("revision", &self.revision)
            .field("uses_title_key", &self.rights_id.is_some())
            .finish_non_exhaustive()
    }
}

/// Derivation result per partition slot
#[derive(Debug, Default)]
pub struct PartitionKeys {
    slots: [Option<NcaResult<Option<ContentKey>>>; MAX_PARTITIONS],
}

impl PartitionKeys {
    /// Take the result for slot `index`, leaving nothing behind
    ///
    /// Returns `None` for absent partitions or results already taken.
    pub fn take(&mut self, index: usize) -> Option<NcaResult<Option<ContentKey>>> {
        self.slots.get_mut(index).and_then(Option::take)
    }

    /// Whether slot `index` derived successfully
    pub fn is_ok(&self, index: usize) -> bool {
        matches!(self.slots.get(index), Some(Some(Ok(_))))
    }
}
