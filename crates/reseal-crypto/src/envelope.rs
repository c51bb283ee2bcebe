//! Sealed value format and scope binding

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cipher::{NONCE_SIZE, TAG_SIZE};
use crate::keys::Fingerprint;
use crate::{CryptoError, Result};

/// Envelopes written today. Always carry a key fingerprint.
pub const FORMAT_VERSION: u8 = 2;
/// Legacy envelopes: no fingerprint, unsealed by scanning every key.
pub const LEGACY_FORMAT_VERSION: u8 = 1;

/// How tightly a sealed value is bound to the identity of the object holding it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScopeMode {
    /// Bound to namespace and name
    Strict,
    /// Bound to the namespace; the object may be renamed
    NamespaceWide,
    /// Not bound; may be moved anywhere
    ClusterWide,
}

impl fmt::Display for ScopeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScopeMode::Strict => "strict",
            ScopeMode::NamespaceWide => "namespace-wide",
            ScopeMode::ClusterWide => "cluster-wide",
        })
    }
}

impl FromStr for ScopeMode {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "strict" => Ok(ScopeMode::Strict),
            "namespace-wide" => Ok(ScopeMode::NamespaceWide),
            "cluster-wide" => Ok(ScopeMode::ClusterWide),
            other => Err(CryptoError::Malformed(format!("unknown scope: {other}"))),
        }
    }
}

/// The identity a sealed value is bound to. Serialized into the AAD.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum ScopeLabel {
    Strict { namespace: String, name: String },
    NamespaceWide { namespace: String },
    ClusterWide,
}

impl ScopeLabel {
    pub fn strict(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ScopeLabel::Strict {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The label a caller asserts for an object identity under `mode`
    pub fn for_object(mode: ScopeMode, namespace: &str, name: &str) -> Self {
        match mode {
            ScopeMode::Strict => Self::strict(namespace, name),
            ScopeMode::NamespaceWide => ScopeLabel::NamespaceWide {
                namespace: namespace.to_string(),
            },
            ScopeMode::ClusterWide => ScopeLabel::ClusterWide,
        }
    }

    pub fn mode(&self) -> ScopeMode {
        match self {
            ScopeLabel::Strict { .. } => ScopeMode::Strict,
            ScopeLabel::NamespaceWide { .. } => ScopeMode::NamespaceWide,
            ScopeLabel::ClusterWide => ScopeMode::ClusterWide,
        }
    }

    /// Namespace the label is confined to, if any
    pub fn namespace(&self) -> Option<&str> {
        match self {
            ScopeLabel::Strict { namespace, .. } | ScopeLabel::NamespaceWide { namespace } => {
                Some(namespace)
            }
            ScopeLabel::ClusterWide => None,
        }
    }

    /// Reject labels whose AAD would collide with another label's.
    /// Namespaces and names must be non-empty and free of `/`.
    pub fn validate(&self) -> Result<()> {
        let parts: Vec<&str> = match self {
            ScopeLabel::Strict { namespace, name } => vec![namespace.as_str(), name.as_str()],
            ScopeLabel::NamespaceWide { namespace } => vec![namespace.as_str()],
            ScopeLabel::ClusterWide => Vec::new(),
        };
        for part in parts {
            if part.is_empty() || part.contains('/') {
                return Err(CryptoError::Malformed(format!(
                    "invalid scope component {part:?}"
                )));
            }
        }
        Ok(())
    }

    /// Additional authenticated data: "ns/name", "ns" or empty
    pub fn aad(&self) -> Vec<u8> {
        match self {
            ScopeLabel::Strict { namespace, name } => format!("{namespace}/{name}").into_bytes(),
            ScopeLabel::NamespaceWide { namespace } => namespace.clone().into_bytes(),
            ScopeLabel::ClusterWide => Vec::new(),
        }
    }
}

impl fmt::Display for ScopeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeLabel::Strict { namespace, name } => write!(f, "{namespace}/{name}"),
            ScopeLabel::NamespaceWide { namespace } => write!(f, "{namespace}/*"),
            ScopeLabel::ClusterWide => f.write_str("*"),
        }
    }
}

/// A sealed value: ChaCha20-Poly1305 ciphertext plus an RSA-OAEP wrapped session key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub format_version: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_fingerprint: Option<Fingerprint>,
    pub scope: ScopeLabel,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub wrapped_session_key: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub auth_tag: Vec<u8>,
}

impl Envelope {
    /// Fingerprint used for key selection. Legacy envelopes have none.
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        match self.format_version {
            LEGACY_FORMAT_VERSION => None,
            _ => self.key_fingerprint.as_ref(),
        }
    }

    /// True when the envelope was sealed under `active` and needs no migration
    pub fn is_sealed_under(&self, active: &Fingerprint) -> bool {
        self.fingerprint() == Some(active)
    }

    /// Reject structurally broken envelopes before any key is touched
    pub fn validate(&self) -> Result<()> {
        if self.format_version != FORMAT_VERSION && self.format_version != LEGACY_FORMAT_VERSION {
            return Err(CryptoError::Malformed(format!(
                "unsupported format version {}",
                self.format_version
            )));
        }
        if self.nonce.len() != NONCE_SIZE {
            return Err(CryptoError::Malformed(format!(
                "nonce must be {NONCE_SIZE} bytes, got {}",
                self.nonce.len()
            )));
        }
        if self.auth_tag.len() != TAG_SIZE {
            return Err(CryptoError::Malformed(format!(
                "auth tag must be {TAG_SIZE} bytes, got {}",
                self.auth_tag.len()
            )));
        }
        if self.wrapped_session_key.is_empty() {
            return Err(CryptoError::Malformed("empty wrapped session key".into()));
        }
        Ok(())
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CryptoError::Encoding(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| CryptoError::Malformed(e.to_string()))
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope {
            format_version: FORMAT_VERSION,
            key_fingerprint: Some(Fingerprint::of_spki_der(b"key")),
            scope: ScopeLabel::strict("prod", "db"),
            nonce: vec![1; NONCE_SIZE],
            wrapped_session_key: vec![2; 128],
            ciphertext: vec![3; 10],
            auth_tag: vec![4; TAG_SIZE],
        }
    }

    #[test]
    fn test_scope_aad() {
        assert_eq!(ScopeLabel::strict("ns1", "secret1").aad(), b"ns1/secret1");
        assert_eq!(
            ScopeLabel::for_object(ScopeMode::NamespaceWide, "ns1", "secret1").aad(),
            b"ns1"
        );
        assert!(ScopeLabel::for_object(ScopeMode::ClusterWide, "ns1", "x").aad().is_empty());
    }

    #[test]
    fn test_ambiguous_scopes_rejected() {
        assert!(ScopeLabel::strict("a", "b").validate().is_ok());
        assert!(ScopeLabel::ClusterWide.validate().is_ok());

        // "a/b/c" could otherwise be either of these
        assert!(ScopeLabel::strict("a", "b/c").validate().is_err());
        assert!(ScopeLabel::strict("a/b", "c").validate().is_err());
        assert!(ScopeLabel::for_object(ScopeMode::NamespaceWide, "a/b", "x").validate().is_err());
        // Empty namespace would share the cluster-wide AAD
        assert!(ScopeLabel::for_object(ScopeMode::NamespaceWide, "", "x").validate().is_err());
    }

    #[test]
    fn test_scope_mode_parse() {
        for mode in [ScopeMode::Strict, ScopeMode::NamespaceWide, ScopeMode::ClusterWide] {
            assert_eq!(mode.to_string().parse::<ScopeMode>().unwrap(), mode);
        }
        assert!("global".parse::<ScopeMode>().is_err());
    }

    #[test]
    fn test_json_shape() {
        let json: serde_json::Value = serde_json::from_slice(&sample().to_bytes().unwrap()).unwrap();
        assert_eq!(json["formatVersion"], 2);
        assert_eq!(json["scope"]["mode"], "strict");
        assert_eq!(json["nonce"], "AQEBAQEBAQEBAQEB");
    }

    #[test]
    fn test_legacy_has_no_fingerprint() {
        let mut env = sample();
        env.format_version = LEGACY_FORMAT_VERSION;
        assert!(env.fingerprint().is_none());
        assert!(!env.is_sealed_under(&Fingerprint::of_spki_der(b"key")));

        env.key_fingerprint = None;
        let json = String::from_utf8(env.to_bytes().unwrap()).unwrap();
        assert!(!json.contains("keyFingerprint"));
        assert_eq!(Envelope::from_bytes(json.as_bytes()).unwrap(), env);
    }

    #[test]
    fn test_validate() {
        assert!(sample().validate().is_ok());

        let mut bad_version = sample();
        bad_version.format_version = 9;
        assert!(matches!(bad_version.validate(), Err(CryptoError::Malformed(_))));

        let mut short_tag = sample();
        short_tag.auth_tag.truncate(3);
        assert!(short_tag.validate().is_err());
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            Envelope::from_bytes(b"{not json"),
            Err(CryptoError::Malformed(_))
        ));
    }
}
