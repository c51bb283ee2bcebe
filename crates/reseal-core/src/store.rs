//! Object store contract
//!
//! The orchestrator only needs list, get and a conditional update. Backends
//! decide what a version token looks like; callers treat it as opaque.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error::{Classify, FailureKind};
use crate::object::{ObjectRef, SealedObject, VersionToken, Versioned};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Version conflict on {0}")]
    Conflict(ObjectRef),

    #[error("Object not found: {0}")]
    NotFound(ObjectRef),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store error: {0}")]
    Fatal(String),
}

impl Classify for StoreError {
    fn kind(&self) -> FailureKind {
        match self {
            // A vanished object is a concurrent change, not a broken store
            StoreError::Conflict(_) | StoreError::NotFound(_) => FailureKind::Conflict,
            StoreError::Unavailable(_) => FailureKind::Transient,
            StoreError::Fatal(_) => FailureKind::Fatal,
        }
    }
}

/// Which objects a run covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListScope {
    Namespace(String),
    AllNamespaces,
}

impl ListScope {
    pub fn contains(&self, namespace: &str) -> bool {
        match self {
            ListScope::Namespace(ns) => ns == namespace,
            ListScope::AllNamespaces => true,
        }
    }
}

/// Trait for object stores so the orchestrator doesn't care about implementation
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(&self, scope: &ListScope) -> Result<Vec<Versioned>, StoreError>;

    async fn get(&self, object: &ObjectRef) -> Result<Option<Versioned>, StoreError>;

    /// Replace the object only if it is still at `expected`
    async fn update(
        &self,
        object: &SealedObject,
        expected: &VersionToken,
    ) -> Result<VersionToken, StoreError>;
}

/// Where prior versions go before they are overwritten
#[async_trait]
pub trait BackupSink: Send + Sync {
    async fn backup(&self, previous: &Versioned) -> Result<(), StoreError>;
}

/// A saved prior version
#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub object: SealedObject,
    pub version: VersionToken,
    pub taken_at: DateTime<Utc>,
}

/// Process-local store. Versions come from one store-wide counter, so a
/// deleted and re-created object never reuses an old token.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<ObjectRef, (SealedObject, u64)>>,
    backups: Mutex<Vec<BackupRecord>>,
    last_version: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite unconditionally
    pub fn put(&self, object: SealedObject) -> Result<VersionToken, StoreError> {
        let mut objects = self.lock_objects()?;
        let version = self.next_version();
        objects.insert(object.object_ref(), (object, version));
        Ok(VersionToken(version.to_string()))
    }

    /// Returns false if the object did not exist
    pub fn remove(&self, object: &ObjectRef) -> Result<bool, StoreError> {
        Ok(self.lock_objects()?.remove(object).is_some())
    }

    pub fn backups(&self) -> Vec<BackupRecord> {
        self.backups.lock().map(|b| b.clone()).unwrap_or_default()
    }

    /// Callers hold the objects lock
    fn next_version(&self) -> u64 {
        self.last_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn lock_objects(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<ObjectRef, (SealedObject, u64)>>, StoreError> {
        self.objects
            .lock()
            .map_err(|e| StoreError::Fatal(e.to_string()))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, scope: &ListScope) -> Result<Vec<Versioned>, StoreError> {
        let objects = self.lock_objects()?;
        Ok(objects
            .values()
            .filter(|(object, _)| scope.contains(&object.namespace))
            .map(|(object, version)| Versioned {
                object: object.clone(),
                version: VersionToken(version.to_string()),
            })
            .collect())
    }

    async fn get(&self, object: &ObjectRef) -> Result<Option<Versioned>, StoreError> {
        let objects = self.lock_objects()?;
        Ok(objects.get(object).map(|(object, version)| Versioned {
            object: object.clone(),
            version: VersionToken(version.to_string()),
        }))
    }

    async fn update(
        &self,
        object: &SealedObject,
        expected: &VersionToken,
    ) -> Result<VersionToken, StoreError> {
        let key = object.object_ref();
        let mut objects = self.lock_objects()?;
        let entry = objects
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if entry.1.to_string() != expected.0 {
            return Err(StoreError::Conflict(key));
        }
        entry.0 = object.clone();
        entry.1 = self.next_version();
        Ok(VersionToken(entry.1.to_string()))
    }
}

#[async_trait]
impl BackupSink for MemoryStore {
    async fn backup(&self, previous: &Versioned) -> Result<(), StoreError> {
        let mut backups = self
            .backups
            .lock()
            .map_err(|e| StoreError::Fatal(e.to_string()))?;
        backups.push(BackupRecord {
            object: previous.object.clone(),
            version: previous.version.clone(),
            taken_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conditional_update() {
        let store = MemoryStore::new();
        let v1 = store.put(SealedObject::new("prod", "db")).unwrap();

        let mut changed = SealedObject::new("prod", "db");
        changed.annotations.insert("owner".into(), "team-a".into());
        let v2 = store.update(&changed, &v1).await.unwrap();
        assert_ne!(v1, v2);

        let stale = store.update(&changed, &v1).await;
        assert!(matches!(stale, Err(StoreError::Conflict(_))));

        let current = store.get(&ObjectRef::new("prod", "db")).await.unwrap().unwrap();
        assert_eq!(current.version, v2);
        assert_eq!(current.object.annotations["owner"], "team-a");
    }

    #[tokio::test]
    async fn test_list_scope() {
        let store = MemoryStore::new();
        store.put(SealedObject::new("prod", "a")).unwrap();
        store.put(SealedObject::new("prod", "b")).unwrap();
        store.put(SealedObject::new("staging", "a")).unwrap();

        let prod = store.list(&ListScope::Namespace("prod".into())).await.unwrap();
        assert_eq!(prod.len(), 2);
        assert_eq!(store.list(&ListScope::AllNamespaces).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_recreated_object_gets_fresh_version() {
        let store = MemoryStore::new();
        let first = store.put(SealedObject::new("prod", "db")).unwrap();
        assert!(store.remove(&ObjectRef::new("prod", "db")).unwrap());
        let second = store.put(SealedObject::new("prod", "db")).unwrap();
        assert_ne!(first, second);

        let result = store.update(&SealedObject::new("prod", "db"), &first).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_update_missing_object() {
        let store = MemoryStore::new();
        let result = store
            .update(&SealedObject::new("prod", "gone"), &VersionToken("1".into()))
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        // A concurrent delete must not halt a whole run
        assert_ne!(err.kind(), FailureKind::Fatal);
    }
}
