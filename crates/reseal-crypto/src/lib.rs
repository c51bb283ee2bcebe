//! Reseal Crypto - hybrid sealing engine and rotating key registry
//!
//! This crate provides:
//! - ChaCha20-Poly1305 payload encryption bound to a scope label (AAD)
//! - RSA-OAEP wrapping of per-envelope session keys
//! - An ordered key history with a single active key
//! - An encrypted on-disk keystore that persists before it activates

pub mod cipher;
pub mod envelope;
pub mod keys;
pub mod keystore;
pub mod registry;
pub mod seal;

pub use cipher::CipherError;
pub use envelope::{Envelope, ScopeLabel, ScopeMode, FORMAT_VERSION, LEGACY_FORMAT_VERSION};
pub use keys::{Fingerprint, KeyPair, PublicKey, DEFAULT_KEY_BITS};
pub use keystore::{load_or_create_master_key, KeyStore};
pub use registry::{KeyRegistry, SharedRegistry};
pub use seal::{reencrypt, seal, unseal};

/// Errors that can occur in cryptographic operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("Key encoding error: {0}")]
    Encoding(String),

    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Envelope was sealed with unknown key {0}")]
    UnknownKey(Fingerprint),

    #[error("No key in the registry can open this envelope")]
    NoMatchingKey,

    #[error("Envelope failed authentication - corrupted, forged, or bound to another scope")]
    Tampered,

    #[error("Session key unwrap failed")]
    UnwrapFailed,

    #[error("Key registry has no active key")]
    NoActiveKey,

    #[error("Key {0} is already registered")]
    DuplicateKey(Fingerprint),

    #[error("Keystore error: {0}")]
    Keystore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
