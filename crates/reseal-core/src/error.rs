//! Failure taxonomy shared by the boundary, the store contract and the orchestrator

use std::fmt;

use reseal_crypto::CryptoError;
use serde::{Deserialize, Serialize};

use crate::boundary::UnsealError;
use crate::store::StoreError;

/// Why a single object could not be migrated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Envelope names a key the registry does not hold
    UnknownKey,
    /// Legacy envelope that no registered key can open
    NoMatchingKey,
    /// Authentication failed: corrupted, forged or bound to another identity
    Tampered,
    /// Caller is not allowed to unseal this scope
    Forbidden,
    /// Object kept changing underneath us
    Conflict,
    /// Store, network or rate-limit trouble that outlived the retry budget
    Transient,
    /// Nothing sensible can continue (no active key, store rejects us outright)
    Fatal,
    /// Run was cancelled before this object finished
    Aborted,
}

impl FailureKind {
    /// Worth another attempt with backoff
    pub fn is_transient(self) -> bool {
        matches!(self, FailureKind::Transient)
    }

    /// Cryptographic or authorization failures; permanent and isolated to one object
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            FailureKind::UnknownKey
                | FailureKind::NoMatchingKey
                | FailureKind::Tampered
                | FailureKind::Forbidden
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::UnknownKey => "unknown-key",
            FailureKind::NoMatchingKey => "no-matching-key",
            FailureKind::Tampered => "tampered",
            FailureKind::Forbidden => "forbidden",
            FailureKind::Conflict => "conflict",
            FailureKind::Transient => "transient",
            FailureKind::Fatal => "fatal",
            FailureKind::Aborted => "aborted",
        })
    }
}

/// Anything that can be sorted into a [`FailureKind`]
pub trait Classify {
    fn kind(&self) -> FailureKind;
}

impl Classify for CryptoError {
    fn kind(&self) -> FailureKind {
        match self {
            CryptoError::UnknownKey(_) => FailureKind::UnknownKey,
            CryptoError::NoMatchingKey => FailureKind::NoMatchingKey,
            CryptoError::Tampered
            | CryptoError::Malformed(_)
            | CryptoError::UnwrapFailed
            | CryptoError::Cipher(_) => FailureKind::Tampered,
            CryptoError::KeyGeneration(_)
            | CryptoError::Encryption(_)
            | CryptoError::Encoding(_)
            | CryptoError::NoActiveKey
            | CryptoError::DuplicateKey(_)
            | CryptoError::Keystore(_)
            | CryptoError::Io(_) => FailureKind::Fatal,
        }
    }
}

/// Errors from processing one object
#[derive(Debug, thiserror::Error)]
pub enum ResealError {
    #[error(transparent)]
    Unseal(#[from] UnsealError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Backup failed, object left untouched: {0}")]
    Backup(StoreError),

    #[error("Object changed concurrently {attempts} times; giving up")]
    ConflictRetriesExhausted { attempts: u32 },

    #[error("Aborted: {0}")]
    Aborted(String),
}

impl Classify for ResealError {
    fn kind(&self) -> FailureKind {
        match self {
            ResealError::Unseal(e) => e.kind(),
            ResealError::Crypto(e) => e.kind(),
            ResealError::Store(e) | ResealError::Backup(e) => e.kind(),
            ResealError::ConflictRetriesExhausted { .. } => FailureKind::Conflict,
            ResealError::Aborted(_) => FailureKind::Aborted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reseal_crypto::Fingerprint;

    #[test]
    fn test_crypto_classification() {
        let fp = Fingerprint::of_spki_der(b"k");
        assert_eq!(CryptoError::UnknownKey(fp).kind(), FailureKind::UnknownKey);
        assert_eq!(CryptoError::NoMatchingKey.kind(), FailureKind::NoMatchingKey);
        assert_eq!(CryptoError::Malformed("x".into()).kind(), FailureKind::Tampered);
        assert_eq!(CryptoError::NoActiveKey.kind(), FailureKind::Fatal);
    }

    #[test]
    fn test_permanent_vs_transient() {
        assert!(FailureKind::Tampered.is_permanent());
        assert!(FailureKind::Forbidden.is_permanent());
        assert!(!FailureKind::Conflict.is_permanent());
        assert!(FailureKind::Transient.is_transient());
        assert!(!FailureKind::Fatal.is_transient());
    }

    #[test]
    fn test_display_matches_serde() {
        let json = serde_json::to_string(&FailureKind::NoMatchingKey).unwrap();
        assert_eq!(json, format!("\"{}\"", FailureKind::NoMatchingKey));
    }
}
