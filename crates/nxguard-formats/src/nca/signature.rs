//! Header signature validation
//!
//! Both header signatures cover the same 0x200-byte region. The fixed-key
//! signature is checked with the key the caller registered for the header's
//! signature key generation. The ACID signature is only checked when the
//! caller supplies the ACID key, which normally comes from the program's own
//! metadata.

use std::collections::BTreeMap;
use std::fmt;

use nxguard_crypto::SignaturePublicKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::nca::header::NcaHeader;

/// Public keys for header signature checks, keyed by signature key generation
#[derive(Debug, Clone, Default)]
pub struct SignatureKeyTable {
    fixed_keys: BTreeMap<u8, SignaturePublicKey>,
    acid_key: Option<SignaturePublicKey>,
}

impl SignatureKeyTable {
    /// Empty table; every check is reported as unchecked
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the fixed key for `generation`, replacing any earlier one
    pub fn insert(&mut self, generation: u8, key: SignaturePublicKey) {
        self.fixed_keys.insert(generation, key);
    }

    /// Set the key for the ACID signature
    pub fn with_acid_key(mut self, key: SignaturePublicKey) -> Self {
        self.acid_key = Some(key);
        self
    }

    /// Fixed key for `generation`
    pub fn get(&self, generation: u8) -> Option<&SignaturePublicKey> {
        self.fixed_keys.get(&generation)
    }

    /// ACID key, if supplied
    pub fn acid_key(&self) -> Option<&SignaturePublicKey> {
        self.acid_key.as_ref()
    }
}

/// Outcome of one signature check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SignatureStatus {
    /// The signature matched the key
    Verified,
    /// The signature did not match
    Invalid {
        /// Why verification failed
        reason: String,
    },
    /// No key was available to check against
    Unchecked {
        /// Which key was missing
        reason: String,
    },
}

impl SignatureStatus {
    /// Whether the signature verified
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }

    /// Whether the signature was checked and failed
    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid { .. })
    }
}

impl fmt::Display for SignatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verified => f.write_str("verified"),
            Self::Invalid { reason } => write!(f, "invalid ({reason})"),
            Self::Unchecked { reason } => write!(f, "unchecked ({reason})"),
        }
    }
}

/// Result of checking both header signatures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureReport {
    /// Signature made with the fixed key
    pub fixed_key: SignatureStatus,
    /// Signature made with the ACID key
    pub acid: SignatureStatus,
}

impl SignatureReport {
    /// Report for a header whose signatures were not looked at
    pub fn unchecked(reason: &str) -> Self {
        Self {
            fixed_key: SignatureStatus::Unchecked {
                reason: reason.to_string(),
            },
            acid: SignatureStatus::Unchecked {
                reason: reason.to_string(),
            },
        }
    }

    /// Fixed-key signature verified and the ACID signature, if checked,
    /// did too
    pub fn is_authentic(&self) -> bool {
        self.fixed_key.is_verified() && !self.acid.is_invalid()
    }
}

fn check(
    key: Option<&SignaturePublicKey>,
    message: &[u8],
    signature: &[u8],
    missing: String,
) -> SignatureStatus {
    let Some(key) = key else {
        return SignatureStatus::Unchecked { reason: missing };
    };
    match key.verify(message, signature) {
        Ok(()) => SignatureStatus::Verified,
        Err(err) => SignatureStatus::Invalid {
            reason: err.to_string(),
        },
    }
}

/// Check both signatures of `header` against `keys`
///
/// Never fails; every outcome is recorded in the report.
pub fn verify_header(header: &NcaHeader, keys: &SignatureKeyTable) -> SignatureReport {
    let message = header.signed_region();
    let generation = header.signature_key_generation;

    let fixed_key = check(
        keys.get(generation),
        message,
        &header.fixed_key_signature,
        format!("no fixed key for signature key generation {generation}"),
    );
    let acid = check(
        keys.acid_key(),
        message,
        &header.acid_signature,
        "no ACID key supplied".to_string(),
    );

    match &fixed_key {
        SignatureStatus::Verified => debug!("Fixed-key signature verified"),
        SignatureStatus::Invalid { reason } => warn!("Fixed-key signature invalid: {}", reason),
        SignatureStatus::Unchecked { reason } => debug!("Fixed-key signature unchecked: {}", reason),
    }
    if acid.is_invalid() {
        warn!("ACID signature invalid: {}", acid);
    }

    SignatureReport { fixed_key, acid }
}
