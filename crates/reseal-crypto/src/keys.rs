//! RSA key pairs used to wrap per-envelope session keys
//!
//! The private half never leaves a `KeyPair`: callers get an unwrap
//! operation, not the key. Private key material is zeroized on drop.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{CryptoError, Result};

/// Default modulus size for newly generated keys
pub const DEFAULT_KEY_BITS: usize = 4096;

/// Stable short identifier of a public key: hex SHA-256 of its SPKI DER encoding
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of_spki_der(der: &[u8]) -> Self {
        let digest = ring::digest::digest(&ring::digest::SHA256, der);
        Self(digest.as_ref().iter().map(|b| format!("{:02x}", b)).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines and listings
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self> {
        let valid = s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit());
        if !valid {
            return Err(CryptoError::Malformed(format!("invalid fingerprint: {s}")));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

/// Public half of a sealing key
#[derive(Clone, Debug, PartialEq)]
pub struct PublicKey {
    inner: RsaPublicKey,
    fingerprint: Fingerprint,
}

impl PublicKey {
    fn from_rsa(inner: RsaPublicKey) -> Result<Self> {
        let der = inner
            .to_public_key_der()
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let fingerprint = Fingerprint::of_spki_der(der.as_bytes());
        Ok(Self { inner, fingerprint })
    }

    /// Parse an SPKI PEM ("BEGIN PUBLIC KEY") document
    pub fn from_pem(pem: &str) -> Result<Self> {
        let inner = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        Self::from_rsa(inner)
    }

    pub fn to_pem(&self) -> Result<String> {
        self.inner
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Encoding(e.to_string()))
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// RSA-OAEP(SHA-256) wrap of a session key
    pub(crate) fn wrap(&self, session_key: &[u8]) -> Result<Vec<u8>> {
        let mut rng = rand::thread_rng();
        self.inner
            .encrypt(&mut rng, Oaep::new::<Sha256>(), session_key)
            .map_err(|e| CryptoError::Encryption(e.to_string()))
    }
}

/// A sealing key pair. Immutable once created.
pub struct KeyPair {
    id: Fingerprint,
    created_at: DateTime<Utc>,
    public: PublicKey,
    secret: RsaPrivateKey,
}

impl KeyPair {
    /// Generate a fresh key pair. Entropy or generation failures are fatal.
    pub fn generate(bits: usize, created_at: DateTime<Utc>) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let secret = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Self::from_secret(secret, created_at)
    }

    /// Rebuild a key pair from its persisted PKCS#8 PEM form
    pub fn from_pkcs8_pem(pem: &str, created_at: DateTime<Utc>) -> Result<Self> {
        let secret = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        Self::from_secret(secret, created_at)
    }

    fn from_secret(secret: RsaPrivateKey, created_at: DateTime<Utc>) -> Result<Self> {
        let public = PublicKey::from_rsa(secret.to_public_key())?;
        Ok(Self {
            id: public.fingerprint().clone(),
            created_at,
            public,
            secret,
        })
    }

    pub fn id(&self) -> &Fingerprint {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Undo [`PublicKey::wrap`]. Fails if this key did not wrap the input.
    pub(crate) fn unwrap_session_key(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.secret
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::UnwrapFailed)
    }

    /// PKCS#8 PEM of the private key, for the keystore only
    pub(crate) fn to_pkcs8_pem(&self) -> Result<Zeroizing<String>> {
        self.secret
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Encoding(e.to_string()))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("secret", &"<redacted>")
            .finish()
    }
}
