//! Key material store
//!
//! Holds the externally supplied keys an NCA needs: the header key, the
//! key-area keys per (index, revision), the title key encryption keys per
//! revision and any known title keys. The store performs no derivation of its
//! own; it is a read-only lookup once loaded.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use crate::aes128::Aes128Key;
use crate::error::CryptoError;
use crate::xts::AesXtsKey;

/// Number of master key revisions a key file can name (`_00` through `_1f`)
pub const MAX_KEY_REVISIONS: u8 = 0x20;

/// Which key-area key family wraps an NCA's key area
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyAreaKeyIndex {
    /// Regular applications
    Application,
    /// Ocean (system applets)
    Ocean,
    /// System titles
    System,
}

impl KeyAreaKeyIndex {
    /// Decode the header's key-area-key index byte
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Application),
            1 => Some(Self::Ocean),
            2 => Some(Self::System),
            _ => None,
        }
    }

    /// Name used in key files
    pub fn name(self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::Ocean => "ocean",
            Self::System => "system",
        }
    }
}

impl fmt::Display for KeyAreaKeyIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Master key material for decrypting NCAs
#[derive(Clone, Default)]
pub struct KeySet {
    header_key: Option<AesXtsKey>,
    key_area_keys: BTreeMap<(KeyAreaKeyIndex, u8), Aes128Key>,
    titlekeks: BTreeMap<u8, Aes128Key>,
    title_keys: HashMap<[u8; 16], Aes128Key>,
}

impl KeySet {
    /// Create an empty key set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the header XTS key
    pub fn set_header_key(&mut self, key: AesXtsKey) {
        self.header_key = Some(key);
    }

    /// Header XTS key, if loaded
    pub fn header_key(&self) -> Option<&AesXtsKey> {
        self.header_key.as_ref()
    }

    /// Add a key-area key for an index and master key revision
    pub fn add_key_area_key(&mut self, index: KeyAreaKeyIndex, revision: u8, key: Aes128Key) {
        self.key_area_keys.insert((index, revision), key);
    }

    /// Look up a key-area key
    pub fn key_area_key(&self, index: KeyAreaKeyIndex, revision: u8) -> Option<&Aes128Key> {
        self.key_area_keys.get(&(index, revision))
    }

    /// Add a title key encryption key for a master key revision
    pub fn add_titlekek(&mut self, revision: u8, key: Aes128Key) {
        self.titlekeks.insert(revision, key);
    }

    /// Look up a title key encryption key
    pub fn titlekek(&self, revision: u8) -> Option<&Aes128Key> {
        self.titlekeks.get(&revision)
    }

    /// Add an encrypted title key for a rights id
    pub fn add_title_key(&mut self, rights_id: [u8; 16], key: Aes128Key) {
        self.title_keys.insert(rights_id, key);
    }

    /// Look up the encrypted title key for a rights id
    pub fn title_key(&self, rights_id: &[u8; 16]) -> Option<&Aes128Key> {
        self.title_keys.get(rights_id)
    }

    /// Total number of keys held
    pub fn len(&self) -> usize {
        usize::from(self.header_key.is_some())
            + self.key_area_keys.len()
            + self.titlekeks.len()
            + self.title_keys.len()
    }

    /// Whether no keys are loaded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load keys from `name = hex` content
    ///
    /// Recognized names are `header_key`, `key_area_key_<family>_XX` and
    /// `titlekek_XX` where `XX` is the hex revision. Lines starting with `#`
    /// or `;` are comments, unknown names and malformed values are skipped.
    /// Returns the number of keys loaded.
    ///
    /// # Example
    ///
    /// ```
    /// use nxguard_crypto::keys::{KeyAreaKeyIndex, KeySet};
    ///
    /// let content = "
    /// ; comment
    /// key_area_key_application_00 = 000102030405060708090a0b0c0d0e0f
    /// titlekek_05 = 0f0e0d0c0b0a09080706050403020100
    /// ";
    ///
    /// let mut keys = KeySet::new();
    /// assert_eq!(keys.load_prod_keys(content), 2);
    /// assert!(keys.key_area_key(KeyAreaKeyIndex::Application, 0).is_some());
    /// assert!(keys.titlekek(5).is_some());
    /// ```
    pub fn load_prod_keys(&mut self, content: &str) -> usize {
        let mut count = 0;

        for (name, value) in key_value_lines(content) {
            if self.insert_named_key(&name.to_ascii_lowercase(), value).is_some() {
                count += 1;
            }
        }

        count
    }

    fn insert_named_key(&mut self, name: &str, value: &str) -> Option<()> {
        if name == "header_key" {
            self.set_header_key(AesXtsKey::from_hex(value).ok()?);
        } else if let Some(rest) = name.strip_prefix("key_area_key_") {
            let (index, revision) = parse_key_area_name(rest)?;
            self.add_key_area_key(index, revision, Aes128Key::from_hex(value).ok()?);
        } else if let Some(rest) = name.strip_prefix("titlekek_") {
            let revision = parse_revision(rest)?;
            self.add_titlekek(revision, Aes128Key::from_hex(value).ok()?);
        } else {
            return None;
        }
        Some(())
    }

    /// Load title keys from `rights_id = title_key` content
    ///
    /// Returns the number of title keys loaded.
    pub fn load_title_keys(&mut self, content: &str) -> usize {
        let mut count = 0;

        for (rights_id, value) in key_value_lines(content) {
            let mut id = [0u8; 16];
            if hex::decode_to_slice(rights_id, &mut id).is_err() {
                continue;
            }
            if let Ok(key) = Aes128Key::from_hex(value) {
                self.add_title_key(id, key);
                count += 1;
            }
        }

        count
    }

    /// Load a `name = hex` key file from disk
    pub fn load_prod_keys_file(&mut self, path: impl AsRef<Path>) -> Result<usize, CryptoError> {
        let content = std::fs::read_to_string(path)?;
        Ok(self.load_prod_keys(&content))
    }

    /// Load a title key file from disk
    pub fn load_title_keys_file(&mut self, path: impl AsRef<Path>) -> Result<usize, CryptoError> {
        let content = std::fs::read_to_string(path)?;
        Ok(self.load_title_keys(&content))
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySet")
            .field("header_key", &self.header_key.is_some())
            .field("key_area_keys", &self.key_area_keys.len())
            .field("titlekeks", &self.titlekeks.len())
            .field("title_keys", &self.title_keys.len())
            .finish()
    }
}

fn key_value_lines(content: &str) -> impl Iterator<Item = (&str, &str)> {
    content.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            return None;
        }
        let (name, value) = line.split_once('=')?;
        Some((name.trim(), value.trim()))
    })
}

fn parse_key_area_name(rest: &str) -> Option<(KeyAreaKeyIndex, u8)> {
    let (family, revision) = rest.rsplit_once('_')?;
    let index = match family {
        "application" => KeyAreaKeyIndex::Application,
        "ocean" => KeyAreaKeyIndex::Ocean,
        "system" => KeyAreaKeyIndex::System,
        _ => return None,
    };
    Some((index, parse_revision(revision)?))
}

fn parse_revision(s: &str) -> Option<u8> {
    u8::from_str_radix(s, 16)
        .ok()
        .filter(|&revision| revision < MAX_KEY_REVISIONS)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    const KEY_FILE: &str = "
# header
header_key = 000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f
key_area_key_application_00 = 11111111111111111111111111111111
key_area_key_ocean_0a       = 22222222222222222222222222222222
KEY_AREA_KEY_SYSTEM_1F      = 33333333333333333333333333333333
titlekek_02 = 44444444444444444444444444444444
key_area_key_bogus_00 = 55555555555555555555555555555555
key_area_key_system_20 = 66666666666666666666666666666666
titlekek_03 = 1234
master_key_00 = 77777777777777777777777777777777
";

    #[test]
    fn test_key_area_index_from_byte() {
        assert_eq!(KeyAreaKeyIndex::from_byte(0), Some(KeyAreaKeyIndex::Application));
        assert_eq!(KeyAreaKeyIndex::from_byte(2), Some(KeyAreaKeyIndex::System));
        assert_eq!(KeyAreaKeyIndex::from_byte(3), None);
        assert_eq!(KeyAreaKeyIndex::Ocean.to_string(), "ocean");
    }

    #[test]
    fn test_load_prod_keys() {
        let mut keys = KeySet::new();
        assert_eq!(keys.load_prod_keys(KEY_FILE), 5);
        assert_eq!(keys.len(), 5);

        assert_eq!(keys.header_key().unwrap().data_key()[1], 0x01);
        assert_eq!(
            keys.key_area_key(KeyAreaKeyIndex::Ocean, 0x0a).unwrap().as_bytes(),
            &[0x22; 16]
        );
        assert!(keys.key_area_key(KeyAreaKeyIndex::System, 0x1f).is_some());
        assert!(keys.key_area_key(KeyAreaKeyIndex::Application, 1).is_none());
        assert!(keys.titlekek(2).is_some());
        assert!(keys.titlekek(3).is_none());
    }

    #[test]
    fn test_load_title_keys() {
        let content = "
0100000000001000000000000000000a = 0123456789abcdef0123456789abcdef
not-a-rights-id = 0123456789abcdef0123456789abcdef
0100000000002000000000000000000a = short
";
        let mut keys = KeySet::new();
        assert_eq!(keys.load_title_keys(content), 1);

        let mut rights_id = [0u8; 16];
        hex::decode_to_slice("0100000000001000000000000000000a", &mut rights_id).unwrap();
        assert_eq!(keys.title_key(&rights_id).unwrap().as_bytes()[0], 0x01);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(KEY_FILE.as_bytes()).unwrap();

        let mut keys = KeySet::new();
        assert_eq!(keys.load_prod_keys_file(file.path()).unwrap(), 5);

        let missing = keys.load_title_keys_file(file.path().with_extension("missing"));
        assert!(matches!(missing, Err(CryptoError::Io(_))));
    }

    #[test]
    fn test_debug_does_not_leak_keys() {
        let mut keys = KeySet::new();
        keys.add_titlekek(0, Aes128Key::from_bytes([0xAB; 16]));
        let debug = format!("{keys:?}");
        assert!(!debug.contains("ab"));
        assert!(!debug.contains("171"));
        assert!(keys.titlekek(0).is_some());
    }
}
