//! Sealed objects as the store hands them out

use std::collections::BTreeMap;
use std::fmt;

use reseal_crypto::{Envelope, Fingerprint, ScopeLabel};
use serde::{Deserialize, Serialize};

/// Identity of a stored object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Store-assigned version used for optimistic concurrency
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(pub String);

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resource holding named envelopes plus identity metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedObject {
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    pub encrypted_data: BTreeMap<String, Envelope>,
}

impl SealedObject {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            annotations: BTreeMap::new(),
            encrypted_data: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>, envelope: Envelope) -> Self {
        self.encrypted_data.insert(field.into(), envelope);
        self
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(&self.namespace, &self.name)
    }

    /// Label an envelope of this object must have been sealed for
    pub fn claim_for(&self, envelope: &Envelope) -> ScopeLabel {
        ScopeLabel::for_object(envelope.scope.mode(), &self.namespace, &self.name)
    }

    /// Fields not yet sealed under `active`
    pub fn stale_fields<'a>(&'a self, active: &'a Fingerprint) -> impl Iterator<Item = &'a str> + 'a {
        self.encrypted_data
            .iter()
            .filter(move |(_, envelope)| !envelope.is_sealed_under(active))
            .map(|(field, _)| field.as_str())
    }

    pub fn needs_migration(&self, active: &Fingerprint) -> bool {
        self.stale_fields(active).next().is_some()
    }
}

/// An object together with the version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub object: SealedObject,
    pub version: VersionToken,
}
