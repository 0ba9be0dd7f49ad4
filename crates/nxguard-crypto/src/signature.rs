//! RSA signature verification
//!
//! NCA headers carry RSA-2048 signatures over SHA-256 digests. The fixed-key
//! signature uses PSS padding; PKCS#1 v1.5 is supported for tables that
//! describe other signers.

use std::fmt;

use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, Pss, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

/// Public exponent used by every console signing key
pub const DEFAULT_PUBLIC_EXPONENT: u32 = 0x10001;

/// Padding and digest combination of a signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureScheme {
    /// RSASSA-PSS with SHA-256 and a 32-byte salt
    RsaPssSha256,
    /// RSASSA-PKCS1-v1_5 with SHA-256
    RsaPkcs1v15Sha256,
}

impl fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RsaPssSha256 => f.write_str("RSA-PSS-SHA256"),
            Self::RsaPkcs1v15Sha256 => f.write_str("RSA-PKCS1-SHA256"),
        }
    }
}

/// An RSA public key bound to the scheme it verifies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignaturePublicKey {
    key: RsaPublicKey,
    scheme: SignatureScheme,
}

impl SignaturePublicKey {
    /// Wrap an existing RSA public key
    pub fn new(key: RsaPublicKey, scheme: SignatureScheme) -> Self {
        Self { key, scheme }
    }

    /// Build a key from a big-endian modulus and the standard exponent
    pub fn from_modulus(modulus: &[u8], scheme: SignatureScheme) -> Result<Self, CryptoError> {
        let key = RsaPublicKey::new(
            BigUint::from_bytes_be(modulus),
            BigUint::from(DEFAULT_PUBLIC_EXPONENT),
        )
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Ok(Self { key, scheme })
    }

    /// Build a key from a hex-encoded big-endian modulus
    pub fn from_modulus_hex(hex: &str, scheme: SignatureScheme) -> Result<Self, CryptoError> {
        let modulus = hex::decode(hex.trim())
            .map_err(|e| CryptoError::InvalidPublicKey(format!("invalid hex: {e}")))?;
        Self::from_modulus(&modulus, scheme)
    }

    /// Scheme this key verifies
    pub fn scheme(&self) -> SignatureScheme {
        self.scheme
    }

    /// Modulus size in bytes, which is also the signature size
    pub fn size(&self) -> usize {
        self.key.size()
    }

    /// Verify `signature` over the SHA-256 digest of `message`
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        if signature.len() != self.size() {
            return Err(CryptoError::InvalidSignatureSize {
                expected: self.size(),
                actual: signature.len(),
            });
        }

        let digest = Sha256::digest(message);
        let result = match self.scheme {
            SignatureScheme::RsaPssSha256 => {
                self.key.verify(Pss::new::<Sha256>(), &digest, signature)
            }
            SignatureScheme::RsaPkcs1v15Sha256 => {
                self.key
                    .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
            }
        };

        result.map_err(|e| CryptoError::SignatureMismatch(format!("{}: {e}", self.scheme)))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;
    use rsa::rand_core::OsRng;

    fn private_key() -> RsaPrivateKey {
        // Small key keeps the test quick; verification logic is size-agnostic.
        RsaPrivateKey::new(&mut OsRng, 1024).unwrap()
    }

    #[test]
    fn test_pss_verify() {
        let private = private_key();
        let public = SignaturePublicKey::new(private.to_public_key(), SignatureScheme::RsaPssSha256);

        let message = b"NCA3 header region";
        let digest = Sha256::digest(message);
        let signature = private
            .sign_with_rng(&mut OsRng, Pss::new::<Sha256>(), &digest)
            .unwrap();

        public.verify(message, &signature).unwrap();

        let result = public.verify(b"tampered region", &signature);
        assert!(matches!(result, Err(CryptoError::SignatureMismatch(_))));
    }

    #[test]
    fn test_pkcs1_verify() {
        let private = private_key();
        let public =
            SignaturePublicKey::new(private.to_public_key(), SignatureScheme::RsaPkcs1v15Sha256);

        let digest = Sha256::digest(b"payload");
        let signature = private.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).unwrap();
        public.verify(b"payload", &signature).unwrap();
    }

    #[test]
    fn test_scheme_mismatch_fails() {
        let private = private_key();
        let public = SignaturePublicKey::new(private.to_public_key(), SignatureScheme::RsaPssSha256);

        let digest = Sha256::digest(b"payload");
        let signature = private.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).unwrap();
        assert!(public.verify(b"payload", &signature).is_err());
    }

    #[test]
    fn test_signature_size_checked() {
        let private = private_key();
        let public = SignaturePublicKey::new(private.to_public_key(), SignatureScheme::RsaPssSha256);
        let result = public.verify(b"payload", &[0u8; 16]);
        assert!(matches!(
            result,
            Err(CryptoError::InvalidSignatureSize { expected: 128, actual: 16 })
        ));
    }

    #[test]
    fn test_from_modulus_round_trip() {
        let private = private_key();
        let modulus = private.to_public_key().n().to_bytes_be();
        let key =
            SignaturePublicKey::from_modulus_hex(&hex::encode(&modulus), SignatureScheme::RsaPssSha256)
                .unwrap();
        assert_eq!(key.size(), 128);
        assert!(SignaturePublicKey::from_modulus_hex("zz", SignatureScheme::RsaPssSha256).is_err());
    }
}
