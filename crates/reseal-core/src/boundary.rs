//! Secure unseal boundary - allowlist model
//!
//! The only place plaintext is produced. Every request is checked against an
//! identity -> namespace allowlist before any key material is touched;
//! anything not explicitly granted is denied.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reseal_crypto::{CryptoError, Envelope, PublicKey, ScopeLabel, SharedRegistry};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{Classify, FailureKind};

/// Grant covering every namespace, and the only grant that covers cluster-wide scopes
pub const ALL_NAMESPACES: &str = "*";

/// An authenticated caller. Authentication itself belongs to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerIdentity(String);

impl CallerIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reasons a caller can be denied
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessDenied {
    #[error("Identity {0} has no grants")]
    UnknownIdentity(CallerIdentity),
    #[error("Identity {caller} may not unseal {scope}")]
    NotGranted { caller: CallerIdentity, scope: String },
}

/// Default-deny allowlist from caller identity to namespace grants
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessPolicy {
    grants: BTreeMap<CallerIdentity, BTreeSet<String>>,
}

impl AccessPolicy {
    /// A policy that denies everyone
    pub fn empty() -> Self {
        Self::default()
    }

    /// Grant `identity` access to `namespace` (`"*"` for all)
    pub fn allow(&mut self, identity: &CallerIdentity, namespace: &str) {
        self.grants
            .entry(identity.clone())
            .or_default()
            .insert(namespace.to_string());
    }

    /// Builder form of [`AccessPolicy::allow`]
    pub fn with_grant(mut self, identity: &str, namespace: &str) -> Self {
        self.allow(&CallerIdentity::new(identity), namespace);
        self
    }

    /// Drop a single grant
    pub fn revoke(&mut self, identity: &CallerIdentity, namespace: &str) {
        if let Some(grants) = self.grants.get_mut(identity) {
            grants.remove(namespace);
            if grants.is_empty() {
                self.grants.remove(identity);
            }
        }
    }

    pub fn identities(&self) -> impl Iterator<Item = &CallerIdentity> + '_ {
        self.grants.keys()
    }

    /// Check whether `caller` may unseal values bound to `scope`
    pub fn check(&self, caller: &CallerIdentity, scope: &ScopeLabel) -> Result<(), AccessDenied> {
        let grants = self
            .grants
            .get(caller)
            .ok_or_else(|| AccessDenied::UnknownIdentity(caller.clone()))?;

        if grants.contains(ALL_NAMESPACES) {
            return Ok(());
        }

        // Cluster-wide values can be moved into any namespace, so only a
        // wildcard grant covers them.
        let allowed = match scope.namespace() {
            Some(namespace) => grants.contains(namespace),
            None => false,
        };

        if allowed {
            Ok(())
        } else {
            Err(AccessDenied::NotGranted {
                caller: caller.clone(),
                scope: scope.to_string(),
            })
        }
    }
}

/// What a caller asks the boundary to open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsealRequest {
    pub envelope: Envelope,
    /// Identity the caller asserts the envelope belongs to
    pub scope: ScopeLabel,
}

#[derive(Error, Debug)]
pub enum UnsealError {
    #[error(transparent)]
    Forbidden(#[from] AccessDenied),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Error reported by a remote boundary
    #[error("Remote boundary refused ({kind}): {message}")]
    Remote { kind: FailureKind, message: String },

    #[error("Unseal boundary unavailable: {0}")]
    Unavailable(String),
}

impl Classify for UnsealError {
    fn kind(&self) -> FailureKind {
        match self {
            UnsealError::Forbidden(_) => FailureKind::Forbidden,
            UnsealError::Crypto(e) => e.kind(),
            UnsealError::Remote { kind, .. } => *kind,
            UnsealError::Unavailable(_) => FailureKind::Transient,
        }
    }
}

/// Owns the key registry and the access policy
pub struct UnsealBoundary {
    registry: SharedRegistry,
    policy: AccessPolicy,
}

impl UnsealBoundary {
    pub fn new(registry: SharedRegistry, policy: AccessPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    /// Public half of the active key, for sealing
    pub async fn public_key(&self) -> Result<PublicKey, UnsealError> {
        let registry = self.registry.read().await;
        Ok(registry.active()?.public_key().clone())
    }

    /// Authorize, then decrypt
    pub async fn unseal(
        &self,
        caller: &CallerIdentity,
        request: &UnsealRequest,
    ) -> Result<Zeroizing<Vec<u8>>, UnsealError> {
        if let Err(denied) = self.policy.check(caller, &request.scope) {
            warn!(caller = %caller, scope = %request.scope, "unseal denied");
            return Err(denied.into());
        }
        // The policy was checked against the claim, so the envelope must carry it
        if request.envelope.scope != request.scope {
            warn!(caller = %caller, scope = %request.scope, "envelope scope does not match claim");
            return Err(CryptoError::Tampered.into());
        }

        let registry = self.registry.read().await;
        let plaintext = reseal_crypto::unseal(&request.envelope, &request.scope, &registry)
            .map_err(|e| {
                debug!(caller = %caller, scope = %request.scope, error = %e, "unseal failed");
                e
            })?;
        debug!(caller = %caller, scope = %request.scope, "unsealed");
        Ok(plaintext)
    }

    /// Same checks as [`UnsealBoundary::unseal`] without handing out the plaintext
    pub async fn verify(
        &self,
        caller: &CallerIdentity,
        request: &UnsealRequest,
    ) -> Result<(), UnsealError> {
        self.unseal(caller, request).await.map(drop)
    }
}

/// How the orchestrator obtains plaintext
#[async_trait]
pub trait UnsealService: Send + Sync {
    /// Public key new envelopes are sealed under
    async fn active_key(&self) -> Result<PublicKey, UnsealError>;

    async fn unseal(&self, request: &UnsealRequest) -> Result<Zeroizing<Vec<u8>>, UnsealError>;
}

/// An in-process boundary bound to one identity
#[derive(Clone)]
pub struct LocalUnsealer {
    boundary: Arc<UnsealBoundary>,
    caller: CallerIdentity,
}

impl LocalUnsealer {
    pub fn new(boundary: Arc<UnsealBoundary>, caller: CallerIdentity) -> Self {
        Self { boundary, caller }
    }
}

#[async_trait]
impl UnsealService for LocalUnsealer {
    async fn active_key(&self) -> Result<PublicKey, UnsealError> {
        self.boundary.public_key().await
    }

    async fn unseal(&self, request: &UnsealRequest) -> Result<Zeroizing<Vec<u8>>, UnsealError> {
        self.boundary.unseal(&self.caller, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reseal_crypto::KeyRegistry;

    fn registry() -> SharedRegistry {
        let mut registry = KeyRegistry::new(1024);
        registry.generate(Utc::now()).unwrap();
        registry.into_shared()
    }

    #[test]
    fn test_default_deny() {
        let policy = AccessPolicy::empty();
        let caller = CallerIdentity::new("ci");
        let result = policy.check(&caller, &ScopeLabel::strict("prod", "db"));
        assert!(matches!(result, Err(AccessDenied::UnknownIdentity(_))));
    }

    #[test]
    fn test_namespace_grants() {
        let policy = AccessPolicy::empty()
            .with_grant("ci", "prod")
            .with_grant("ops", ALL_NAMESPACES);
        let ci = CallerIdentity::new("ci");
        let ops = CallerIdentity::new("ops");

        assert!(policy.check(&ci, &ScopeLabel::strict("prod", "db")).is_ok());
        assert!(policy
            .check(&ci, &ScopeLabel::NamespaceWide { namespace: "prod".into() })
            .is_ok());
        assert!(policy.check(&ci, &ScopeLabel::strict("staging", "db")).is_err());
        assert!(policy.check(&ci, &ScopeLabel::ClusterWide).is_err());

        assert!(policy.check(&ops, &ScopeLabel::ClusterWide).is_ok());
        assert!(policy.check(&ops, &ScopeLabel::strict("staging", "db")).is_ok());
    }

    #[test]
    fn test_revoke() {
        let mut policy = AccessPolicy::empty().with_grant("ci", "prod");
        let ci = CallerIdentity::new("ci");
        policy.revoke(&ci, "prod");
        assert_eq!(policy.identities().count(), 0);
        assert!(policy.check(&ci, &ScopeLabel::strict("prod", "db")).is_err());
    }

    #[test]
    fn test_policy_json_shape() {
        let policy: AccessPolicy =
            serde_json::from_str(r#"{"ci": ["prod", "staging"], "ops": ["*"]}"#).unwrap();
        assert!(policy
            .check(&CallerIdentity::new("ci"), &ScopeLabel::strict("staging", "x"))
            .is_ok());
        assert!(policy
            .check(&CallerIdentity::new("ops"), &ScopeLabel::ClusterWide)
            .is_ok());
    }

    #[tokio::test]
    async fn test_forbidden_before_decrypt() {
        let boundary = UnsealBoundary::new(registry(), AccessPolicy::empty().with_grant("ci", "prod"));
        let key = boundary.public_key().await.unwrap();
        let scope = ScopeLabel::strict("staging", "db");
        let envelope = reseal_crypto::seal(b"pw", &scope, &key).unwrap();

        let request = UnsealRequest { envelope, scope };
        let err = boundary
            .unseal(&CallerIdentity::new("ci"), &request)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Forbidden);
    }

    #[tokio::test]
    async fn test_unseal_and_verify() {
        let boundary = Arc::new(UnsealBoundary::new(
            registry(),
            AccessPolicy::empty().with_grant("ci", "prod"),
        ));
        let unsealer = LocalUnsealer::new(Arc::clone(&boundary), CallerIdentity::new("ci"));
        let key = unsealer.active_key().await.unwrap();

        let scope = ScopeLabel::strict("prod", "db");
        let envelope = reseal_crypto::seal(b"hunter2", &scope, &key).unwrap();
        let request = UnsealRequest { envelope, scope };

        let plaintext = unsealer.unseal(&request).await.unwrap();
        assert_eq!(plaintext.as_slice(), b"hunter2");
        assert!(boundary.verify(&CallerIdentity::new("ci"), &request).await.is_ok());
    }

    #[tokio::test]
    async fn test_moved_envelope_is_tampered() {
        let boundary = UnsealBoundary::new(registry(), AccessPolicy::empty().with_grant("ops", "*"));
        let key = boundary.public_key().await.unwrap();
        let envelope = reseal_crypto::seal(b"pw", &ScopeLabel::strict("ns1", "secret1"), &key).unwrap();

        let request = UnsealRequest {
            envelope,
            scope: ScopeLabel::strict("ns2", "secret1"),
        };
        let err = boundary
            .verify(&CallerIdentity::new("ops"), &request)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Tampered);
    }

    #[tokio::test]
    async fn test_relabelled_envelope_is_tampered_for_granted_caller() {
        let boundary = UnsealBoundary::new(
            registry(),
            AccessPolicy::empty().with_grant("eve", "attacker"),
        );
        let key = boundary.public_key().await.unwrap();
        let mut envelope =
            reseal_crypto::seal(b"prod-secret", &ScopeLabel::strict("prod", "db"), &key).unwrap();
        envelope.scope = ScopeLabel::strict("attacker", "x");

        let request = UnsealRequest {
            envelope,
            scope: ScopeLabel::strict("attacker", "x"),
        };
        let err = boundary
            .unseal(&CallerIdentity::new("eve"), &request)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Tampered);
    }

    #[tokio::test]
    async fn test_empty_registry_is_fatal() {
        let boundary = UnsealBoundary::new(KeyRegistry::new(1024).into_shared(), AccessPolicy::empty());
        let err = boundary.public_key().await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Fatal);
    }
}
