//! AES-128-XTS with the NCA sector tweak
//!
//! NCA headers (and the rare XTS partition) use 0x200-byte sectors. The
//! tweak is the sector index stored big-endian across the whole 16-byte
//! tweak block, unlike IEEE 1619 which stores it little-endian.

use std::fmt;

use aes::Aes128;
use aes::cipher::KeyInit;
use xts_mode::Xts128;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Sector size used by every XTS region of an NCA
pub const NCA_SECTOR_SIZE: usize = 0x200;

/// AES-128-XTS key pair
///
/// The first half encrypts data, the second half encrypts the tweak.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AesXtsKey {
    data: [u8; 16],
    tweak: [u8; 16],
}

impl AesXtsKey {
    /// Create from the data key and the tweak key
    pub fn from_halves(data: [u8; 16], tweak: [u8; 16]) -> Self {
        Self { data, tweak }
    }

    /// Create from the 32-byte concatenated form used in key files
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let mut data = [0u8; 16];
        let mut tweak = [0u8; 16];
        data.copy_from_slice(&bytes[..16]);
        tweak.copy_from_slice(&bytes[16..]);
        Self { data, tweak }
    }

    /// Parse the 32-byte concatenated form from hex
    pub fn from_hex(hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex.trim())
            .map_err(|e| CryptoError::InvalidKeyFormat(format!("invalid hex: {e}")))?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeySize {
                expected: 32,
                actual: bytes.len(),
            })?;
        Ok(Self::from_bytes(&bytes))
    }

    /// Data (cipher) key half
    pub fn data_key(&self) -> &[u8; 16] {
        &self.data
    }

    /// Tweak key half
    pub fn tweak_key(&self) -> &[u8; 16] {
        &self.tweak
    }
}

impl fmt::Debug for AesXtsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesXtsKey(..)")
    }
}

fn nintendo_tweak(sector: u128) -> [u8; 16] {
    sector.to_be_bytes()
}

/// AES-128-XTS cipher over fixed-size sectors
pub struct XtsCipher {
    inner: Xts128<Aes128>,
}

impl XtsCipher {
    /// Create a cipher for the given key pair
    pub fn new(key: &AesXtsKey) -> Self {
        let data = Aes128::new((&key.data).into());
        let tweak = Aes128::new((&key.tweak).into());
        Self {
            inner: Xts128::new(data, tweak),
        }
    }

    /// Decrypt whole sectors in place, numbering them from `first_sector`
    pub fn decrypt_sectors(
        &self,
        data: &mut [u8],
        sector_size: usize,
        first_sector: u64,
    ) -> Result<(), CryptoError> {
        check_sector_multiple(data.len(), sector_size)?;
        self.inner.decrypt_area(
            data,
            sector_size,
            u128::from(first_sector),
            nintendo_tweak,
        );
        Ok(())
    }

    /// Encrypt whole sectors in place, numbering them from `first_sector`
    pub fn encrypt_sectors(
        &self,
        data: &mut [u8],
        sector_size: usize,
        first_sector: u64,
    ) -> Result<(), CryptoError> {
        check_sector_multiple(data.len(), sector_size)?;
        self.inner.encrypt_area(
            data,
            sector_size,
            u128::from(first_sector),
            nintendo_tweak,
        );
        Ok(())
    }
}

impl fmt::Debug for XtsCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XtsCipher").finish_non_exhaustive()
    }
}

fn check_sector_multiple(length: usize, sector_size: usize) -> Result<(), CryptoError> {
    if sector_size < 16 || sector_size % 16 != 0 || length % sector_size != 0 {
        return Err(CryptoError::InvalidDataLength {
            length,
            unit: sector_size,
        });
    }
    Ok(())
}
