//! Test utilities for nxguard
//!
//! Builds synthetic NCA images with real hash trees, real encryption and real
//! RSA signatures, along with the key material needed to open them.

#![allow(clippy::expect_used, clippy::cast_possible_truncation)]

use std::sync::OnceLock;

use nxguard_crypto::{
    Aes128Key, AesXtsKey, CtrCipher, KeyAreaKeyIndex, KeySet, NCA_SECTOR_SIZE, Sha256Hash,
    SignaturePublicKey, SignatureScheme, XtsCipher,
};
use rsa::rand_core::OsRng;
use rsa::{Pss, RsaPrivateKey};
use sha2::{Digest, Sha256};

/// Header key used to encrypt test headers
pub const TEST_HEADER_KEY: [u8; 32] = [
    0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0x1D, 0x1E, 0x1F,
    0x20, 0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27, 0x28, 0x29, 0x2A, 0x2B, 0x2C, 0x2D, 0x2E, 0x2F,
];

/// Application key-area key for [`TEST_KEY_GENERATION`]
pub const TEST_KEY_AREA_KEY: [u8; 16] = [0xA7; 16];

/// Title key encryption key for [`TEST_KEY_GENERATION`]
pub const TEST_TITLEKEK: [u8; 16] = [0x3C; 16];

/// Plaintext title key used for rights-id images
pub const TEST_TITLE_KEY: [u8; 16] = [0x5E; 16];

/// Rights id used for title-key images
pub const TEST_RIGHTS_ID: [u8; 16] = [
    0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0xAB, 0xCD, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03,
];

/// Plaintext key area: XTS data, XTS tweak, CTR, unused
pub const TEST_CONTENT_KEYS: [[u8; 16]; 4] = [[0xD1; 16], [0xD2; 16], [0xC7; 16], [0x00; 16]];

/// Key generation written into test headers (master key revision 2)
pub const TEST_KEY_GENERATION: u8 = 3;

const HEADER_SIZE: usize = 0xC00;
const MEDIA_UNIT: usize = 0x200;
const FS_HEADERS: usize = 0x400;
const FS_HEADER_SIZE: usize = 0x200;

/// Key set holding everything needed to open images from [`NcaBuilder`]
pub fn test_keys() -> KeySet {
    let revision = TEST_KEY_GENERATION - 1;
    let mut keys = KeySet::new();
    keys.set_header_key(AesXtsKey::from_bytes(&TEST_HEADER_KEY));
    keys.add_key_area_key(
        KeyAreaKeyIndex::Application,
        revision,
        Aes128Key::from_bytes(TEST_KEY_AREA_KEY),
    );
    keys.add_titlekek(revision, Aes128Key::from_bytes(TEST_TITLEKEK));
    keys
}

/// [`TEST_TITLE_KEY`] wrapped with [`TEST_TITLEKEK`], as a title key file
/// would store it
pub fn encrypted_title_key() -> Aes128Key {
    Aes128Key::from_bytes(
        Aes128Key::from_bytes(TEST_TITLEKEK).wrap_key(&Aes128Key::from_bytes(TEST_TITLE_KEY)),
    )
}

/// RSA-2048 key that signs every test header, generated once per process
pub fn signing_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut OsRng, 2048).expect("RSA key generation"))
}

/// Public half of [`signing_key`] for the PSS scheme headers use
pub fn signature_public_key() -> SignaturePublicKey {
    signature_public_key_for(SignatureScheme::RsaPssSha256)
}

/// Public half of [`signing_key`] bound to `scheme`
pub fn signature_public_key_for(scheme: SignatureScheme) -> SignaturePublicKey {
    SignaturePublicKey::new(signing_key().to_public_key(), scheme)
}

/// Deterministic, non-repeating-looking payload
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(2_654_435_761).rotate_left(u32::from(seed) % 32) as u8 ^ seed)
        .collect()
}

/// Partition encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    /// Plaintext
    None,
    /// AES-128-CTR with the key-area CTR key (or the title key)
    Ctr,
    /// AES-128-XTS with the key-area XTS keys
    Xts,
}

impl Encryption {
    fn type_byte(self) -> u8 {
        match self {
            Self::None => 1,
            Self::Xts => 2,
            Self::Ctr => 3,
        }
    }
}

/// Hash tree to build over a partition's data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashTree {
    /// One block-hash table
    Flat {
        /// Data block size
        block_size: u32,
    },
    /// IVFC tree; `levels` counts the data level too
    Layered {
        /// log2 of every level's block size
        block_size_log2: u32,
        /// Number of levels including data (1..=6)
        levels: usize,
    },
}

/// One partition to place in an image
#[derive(Debug, Clone)]
pub struct PartitionSpec {
    /// Payload the hash tree protects
    pub data: Vec<u8>,
    /// Hash-tree family and shape
    pub hash_tree: HashTree,
    /// Encryption mode
    pub encryption: Encryption,
    /// Upper half of the CTR counter
    pub ctr_upper: u64,
    /// Write a wrong master hash into the superblock
    pub corrupt_master_hash: bool,
    /// Hash type byte to write instead of the one matching `hash_tree`
    pub hash_type_override: Option<u8>,
    /// Encryption type byte to write instead of the one matching `encryption`
    pub encryption_type_override: Option<u8>,
}

impl PartitionSpec {
    /// Plaintext partition with a flat hash table
    pub fn flat(data: Vec<u8>, block_size: u32) -> Self {
        Self::new(data, HashTree::Flat { block_size })
    }

    /// Plaintext partition with an IVFC tree
    pub fn layered(data: Vec<u8>, block_size_log2: u32, levels: usize) -> Self {
        Self::new(
            data,
            HashTree::Layered {
                block_size_log2,
                levels,
            },
        )
    }

    fn new(data: Vec<u8>, hash_tree: HashTree) -> Self {
        Self {
            data,
            hash_tree,
            encryption: Encryption::None,
            ctr_upper: 0x0000_0001_0000_0000,
            corrupt_master_hash: false,
            hash_type_override: None,
            encryption_type_override: None,
        }
    }

    /// Use `encryption`
    #[must_use]
    pub fn encrypted(mut self, encryption: Encryption) -> Self {
        self.encryption = encryption;
        self
    }

    /// Store a master hash that does not match the tree
    #[must_use]
    pub fn with_corrupt_master_hash(mut self) -> Self {
        self.corrupt_master_hash = true;
        self
    }

    /// Write `value` as the FS header hash type
    #[must_use]
    pub fn with_hash_type(mut self, value: u8) -> Self {
        self.hash_type_override = Some(value);
        self
    }

    /// Write `value` as the FS header encryption type
    #[must_use]
    pub fn with_encryption_type(mut self, value: u8) -> Self {
        self.encryption_type_override = Some(value);
        self
    }
}

/// A hash tree laid out as plaintext partition bytes
#[derive(Debug, Clone)]
pub struct TreeImage {
    /// Plaintext partition contents, padded to a media unit multiple
    pub bytes: Vec<u8>,
    /// Superblock for the FS header
    pub hash_info: [u8; 0xF8],
    /// Offset of the data region within the partition
    pub data_offset: u64,
    /// Offset and size of every level, data last (flat: table then data)
    pub regions: Vec<(u64, u64)>,
}

fn align(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}

fn padded_hash(block: &[u8], block_size: usize) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(block);
    if block.len() < block_size {
        hasher.update(vec![0u8; block_size - block.len()]);
    }
    hasher.finalize().into()
}

/// Lay out `data` under a flat hash table
pub fn flat_tree(data: &[u8], block_size: u32, corrupt_master: bool) -> TreeImage {
    let table: Vec<u8> = data
        .chunks(block_size as usize)
        .flat_map(|block| *Sha256Hash::from_data(block).as_bytes())
        .collect();
    let data_offset = align(table.len().max(1), MEDIA_UNIT);

    let mut bytes = table.clone();
    bytes.resize(data_offset, 0);
    bytes.extend_from_slice(data);
    bytes.resize(align(bytes.len(), MEDIA_UNIT), 0);

    let mut master = *Sha256Hash::from_data(&table).as_bytes();
    if corrupt_master {
        master[0] ^= 0xFF;
    }

    let mut info = [0u8; 0xF8];
    info[..0x20].copy_from_slice(&master);
    info[0x20..0x24].copy_from_slice(&block_size.to_le_bytes());
    info[0x24..0x28].copy_from_slice(&2u32.to_le_bytes());
    info[0x28..0x30].copy_from_slice(&0u64.to_le_bytes());
    info[0x30..0x38].copy_from_slice(&(table.len() as u64).to_le_bytes());
    info[0x38..0x40].copy_from_slice(&(data_offset as u64).to_le_bytes());
    info[0x40..0x48].copy_from_slice(&(data.len() as u64).to_le_bytes());

    TreeImage {
        bytes,
        hash_info: info,
        data_offset: data_offset as u64,
        regions: vec![(0, table.len() as u64), (data_offset as u64, data.len() as u64)],
    }
}

/// Lay out `data` under an IVFC tree of `levels` levels (data included)
///
/// Hash levels start on media-unit boundaries; the data level starts on a
/// block boundary.
pub fn layered_tree(data: &[u8], block_size_log2: u32, levels: usize, corrupt_master: bool) -> TreeImage {
    assert!((1..=6).contains(&levels), "IVFC trees have 1 to 6 levels");
    let block_size = 1usize << block_size_log2;

    let mut contents = vec![data.to_vec()];
    for _ in 1..levels {
        let below = &contents[0];
        let hashes: Vec<u8> = below
            .chunks(block_size)
            .flat_map(|block| padded_hash(block, block_size))
            .collect();
        contents.insert(0, hashes);
    }

    let mut bytes = Vec::new();
    let mut regions = Vec::new();
    for (index, level) in contents.iter().enumerate() {
        let alignment = if index + 1 == levels { block_size } else { MEDIA_UNIT };
        let offset = align(bytes.len(), alignment);
        bytes.resize(offset, 0);
        bytes.extend_from_slice(level);
        regions.push((offset as u64, level.len() as u64));
    }
    bytes.resize(align(bytes.len().max(1), MEDIA_UNIT), 0);

    let mut master = padded_hash(&contents[0], block_size);
    if corrupt_master {
        master[0] ^= 0xFF;
    }

    let mut info = [0u8; 0xF8];
    info[..4].copy_from_slice(b"IVFC");
    info[4..8].copy_from_slice(&0x2_0000u32.to_le_bytes());
    info[8..12].copy_from_slice(&0x20u32.to_le_bytes());
    info[12..16].copy_from_slice(&(levels as u32 + 1).to_le_bytes());
    for (i, (offset, size)) in regions.iter().enumerate() {
        let base = 0x10 + i * 0x18;
        info[base..base + 8].copy_from_slice(&offset.to_le_bytes());
        info[base + 8..base + 16].copy_from_slice(&size.to_le_bytes());
        info[base + 16..base + 20].copy_from_slice(&block_size_log2.to_le_bytes());
    }
    info[0xA0..0xC0].fill(0x5A);
    info[0xC0..0xE0].copy_from_slice(&master);

    let data_offset = regions[levels - 1].0;
    TreeImage {
        bytes,
        hash_info: info,
        data_offset,
        regions,
    }
}

/// Where a partition landed in a built image
#[derive(Debug, Clone)]
pub struct BuiltPartition {
    /// Partition slot
    pub index: usize,
    /// Absolute offset in the image
    pub offset: u64,
    /// Size in bytes
    pub size: u64,
    /// Hash tree layout (plaintext)
    pub tree: TreeImage,
    /// Payload protected by the tree
    pub data: Vec<u8>,
}

impl BuiltPartition {
    /// Absolute offset of payload byte `at`
    pub fn data_byte(&self, at: u64) -> usize {
        (self.offset + self.tree.data_offset + at) as usize
    }

    /// Absolute offset of byte `at` of hash tree region `level`
    ///
    /// Region 0 is the table (flat) or the top level (layered).
    pub fn level_byte(&self, level: usize, at: u64) -> usize {
        (self.offset + self.tree.regions[level].0 + at) as usize
    }
}

/// A finished image
#[derive(Debug, Clone)]
pub struct BuiltNca {
    /// Complete container bytes
    pub image: Vec<u8>,
    /// Placed partitions, in slot order
    pub partitions: Vec<BuiltPartition>,
}

impl BuiltNca {
    /// Partition in slot `index`
    pub fn partition(&self, index: usize) -> &BuiltPartition {
        self.partitions
            .iter()
            .find(|p| p.index == index)
            .expect("no partition in that slot")
    }

    /// Flip one bit of payload byte `at` of partition `index` on disk
    pub fn flip_data_bit(&mut self, index: usize, at: u64, bit: u8) {
        let offset = self.partition(index).data_byte(at);
        self.image[offset] ^= 1 << (bit % 8);
    }

    /// Flip one bit of byte `at` of hash tree region `level` on disk
    pub fn flip_level_bit(&mut self, index: usize, level: usize, at: u64, bit: u8) {
        let offset = self.partition(index).level_byte(level, at);
        self.image[offset] ^= 1 << (bit % 8);
    }
}

/// Assembles NCA images
#[derive(Debug, Clone)]
pub struct NcaBuilder {
    magic: [u8; 4],
    key_generation: u8,
    key_area_key_index: u8,
    program_id: u64,
    signature_key_generation: u8,
    rights_id: Option<[u8; 16]>,
    encrypt_header: bool,
    sign: bool,
    slots: [Option<PartitionSpec>; 4],
}

impl Default for NcaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NcaBuilder {
    /// Signed NCA3 image with an encrypted header and no partitions
    pub fn new() -> Self {
        Self {
            magic: *b"NCA3",
            key_generation: TEST_KEY_GENERATION,
            key_area_key_index: 0,
            program_id: 0x0100_0000_0000_A000,
            signature_key_generation: 0,
            rights_id: None,
            encrypt_header: true,
            sign: true,
            slots: Default::default(),
        }
    }

    /// Use the NCA2 header layout
    #[must_use]
    pub fn nca2(mut self) -> Self {
        self.magic = *b"NCA2";
        self
    }

    /// Write arbitrary magic bytes
    #[must_use]
    pub fn magic(mut self, magic: [u8; 4]) -> Self {
        self.magic = magic;
        self
    }

    /// Leave the header block unencrypted
    #[must_use]
    pub fn plaintext_header(mut self) -> Self {
        self.encrypt_header = false;
        self
    }

    /// Leave both signatures zeroed
    #[must_use]
    pub fn unsigned(mut self) -> Self {
        self.sign = false;
        self
    }

    /// Override the key generation
    #[must_use]
    pub fn key_generation(mut self, generation: u8) -> Self {
        self.key_generation = generation;
        self
    }

    /// Override the signature key generation
    #[must_use]
    pub fn signature_key_generation(mut self, generation: u8) -> Self {
        self.signature_key_generation = generation;
        self
    }

    /// Take content keys from [`TEST_TITLE_KEY`] under [`TEST_RIGHTS_ID`]
    #[must_use]
    pub fn title_key(mut self) -> Self {
        self.rights_id = Some(TEST_RIGHTS_ID);
        self
    }

    /// Place `spec` in the next free slot
    #[must_use]
    pub fn partition(mut self, spec: PartitionSpec) -> Self {
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(spec);
        }
        self
    }

    /// Place `spec` in slot `index`
    #[must_use]
    pub fn partition_at(mut self, index: usize, spec: PartitionSpec) -> Self {
        self.slots[index] = Some(spec);
        self
    }

    /// Assemble the image
    pub fn build(&self) -> BuiltNca {
        let mut header = vec![0u8; HEADER_SIZE];
        let mut body = Vec::new();
        let mut partitions = Vec::new();

        for (index, slot) in self.slots.iter().enumerate() {
            let Some(spec) = slot else { continue };

            let tree = match spec.hash_tree {
                HashTree::Flat { block_size } => {
                    flat_tree(&spec.data, block_size, spec.corrupt_master_hash)
                }
                HashTree::Layered {
                    block_size_log2,
                    levels,
                } => layered_tree(&spec.data, block_size_log2, levels, spec.corrupt_master_hash),
            };

            let offset = HEADER_SIZE + body.len();
            let mut bytes = tree.bytes.clone();
            self.encrypt_partition(spec, offset as u64, &mut bytes);
            body.extend_from_slice(&bytes);

            let start = (offset / MEDIA_UNIT) as u32;
            let end = ((offset + bytes.len()) / MEDIA_UNIT) as u32;
            let entry = 0x240 + index * 0x10;
            header[entry..entry + 4].copy_from_slice(&start.to_le_bytes());
            header[entry + 4..entry + 8].copy_from_slice(&end.to_le_bytes());

            let fs = FS_HEADERS + index * FS_HEADER_SIZE;
            let fs_header = &mut header[fs..fs + FS_HEADER_SIZE];
            fs_header[0..2].copy_from_slice(&2u16.to_le_bytes());
            let (format, hash) = match spec.hash_tree {
                HashTree::Flat { .. } => (1, 2),
                HashTree::Layered { .. } => (0, 3),
            };
            fs_header[2] = format;
            fs_header[3] = spec.hash_type_override.unwrap_or(hash);
            fs_header[4] = spec
                .encryption_type_override
                .unwrap_or_else(|| spec.encryption.type_byte());
            fs_header[8..0x100].copy_from_slice(&tree.hash_info);
            fs_header[0x140..0x148].copy_from_slice(&spec.ctr_upper.to_le_bytes());

            let digest = Sha256Hash::from_data(fs_header);
            header[0x280 + index * 0x20..0x2A0 + index * 0x20].copy_from_slice(digest.as_bytes());

            partitions.push(BuiltPartition {
                index,
                offset: offset as u64,
                size: bytes.len() as u64,
                tree,
                data: spec.data.clone(),
            });
        }

        let content_size = (HEADER_SIZE + body.len()) as u64;
        self.write_fields(&mut header, content_size);

        if self.sign {
            let digest = Sha256::digest(&header[0x200..0x400]);
            let key = signing_key();
            for at in [0x000, 0x100] {
                let signature = key
                    .sign_with_rng(&mut OsRng, Pss::new::<Sha256>(), &digest)
                    .expect("PSS signing");
                header[at..at + 0x100].copy_from_slice(&signature);
            }
        }

        if self.encrypt_header {
            self.encrypt_header_block(&mut header);
        }

        let mut image = header;
        image.extend_from_slice(&body);
        BuiltNca { image, partitions }
    }

    fn write_fields(&self, header: &mut [u8], content_size: u64) {
        header[0x200..0x204].copy_from_slice(&self.magic);
        header[0x204] = 0;
        header[0x205] = 0;
        header[0x206] = self.key_generation.min(2);
        header[0x207] = self.key_area_key_index;
        header[0x208..0x210].copy_from_slice(&content_size.to_le_bytes());
        header[0x210..0x218].copy_from_slice(&self.program_id.to_le_bytes());
        header[0x21C..0x220].copy_from_slice(&0x000C_1100u32.to_le_bytes());
        header[0x220] = self.key_generation;
        header[0x221] = self.signature_key_generation;
        if let Some(rights_id) = self.rights_id {
            header[0x230..0x240].copy_from_slice(&rights_id);
        }

        let kek = Aes128Key::from_bytes(TEST_KEY_AREA_KEY);
        for (slot, key) in TEST_CONTENT_KEYS.iter().enumerate() {
            let wrapped = kek.wrap_key(&Aes128Key::from_bytes(*key));
            header[0x300 + slot * 0x10..0x310 + slot * 0x10].copy_from_slice(&wrapped);
        }
    }

    fn encrypt_partition(&self, spec: &PartitionSpec, offset: u64, bytes: &mut [u8]) {
        match spec.encryption {
            Encryption::None => {}
            Encryption::Ctr => {
                let key = if self.rights_id.is_some() {
                    Aes128Key::from_bytes(TEST_TITLE_KEY)
                } else {
                    Aes128Key::from_bytes(TEST_CONTENT_KEYS[2])
                };
                CtrCipher::new(&key, spec.ctr_upper).apply_keystream(offset, bytes);
            }
            Encryption::Xts => {
                let key = AesXtsKey::from_halves(TEST_CONTENT_KEYS[0], TEST_CONTENT_KEYS[1]);
                XtsCipher::new(&key)
                    .encrypt_sectors(bytes, NCA_SECTOR_SIZE, 0)
                    .expect("partition is sector aligned");
            }
        }
    }

    fn encrypt_header_block(&self, header: &mut [u8]) {
        let cipher = XtsCipher::new(&AesXtsKey::from_bytes(&TEST_HEADER_KEY));
        if &self.magic == b"NCA2" {
            cipher
                .encrypt_sectors(&mut header[..FS_HEADERS], NCA_SECTOR_SIZE, 0)
                .expect("aligned");
            for fs_header in header[FS_HEADERS..].chunks_exact_mut(FS_HEADER_SIZE) {
                cipher
                    .encrypt_sectors(fs_header, NCA_SECTOR_SIZE, 0)
                    .expect("aligned");
            }
        } else {
            cipher
                .encrypt_sectors(header, NCA_SECTOR_SIZE, 0)
                .expect("aligned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layered_tree_shape() {
        let data = payload(0x40000, 1);
        let tree = layered_tree(&data, 14, 3, false);
        assert_eq!(tree.regions.len(), 3);
        assert_eq!(tree.regions[0], (0, 0x20));
        assert_eq!(tree.regions[1], (0x200, 0x200));
        assert_eq!(tree.regions[2], (0x4000, 0x40000));
        assert_eq!(tree.data_offset, 0x4000);
        assert_eq!(&tree.bytes[0x4000..], &data[..]);
    }

    #[test]
    fn test_flat_tree_shape() {
        let data = payload(0x2100, 2);
        let tree = flat_tree(&data, 0x1000, false);
        assert_eq!(tree.regions, vec![(0, 0x60), (0x200, 0x2100)]);
        assert_eq!(tree.bytes.len(), 0x2400);
    }

    #[test]
    fn test_partitions_are_contiguous() {
        let built = NcaBuilder::new()
            .unsigned()
            .partition(PartitionSpec::flat(payload(0x1000, 3), 0x400))
            .partition(PartitionSpec::layered(payload(0x1000, 4), 10, 2))
            .build();
        let first = built.partition(0);
        let second = built.partition(1);
        assert_eq!(first.offset, 0xC00);
        assert_eq!(second.offset, first.offset + first.size);
        assert_eq!(built.image.len() as u64, second.offset + second.size);
    }
}
