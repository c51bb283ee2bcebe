//! Ordered key history with a single active key
//!
//! The registry is a plain owned value. Processes that share one wrap it in
//! [`SharedRegistry`]; nothing here is global.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::keys::{Fingerprint, KeyPair, DEFAULT_KEY_BITS};
use crate::{CryptoError, Result};

/// Registry handle shared between the unseal boundary and whoever rotates keys
pub type SharedRegistry = Arc<tokio::sync::RwLock<KeyRegistry>>;

#[derive(Debug)]
pub struct KeyRegistry {
    /// Oldest first; the last entry is the active key
    keys: Vec<Arc<KeyPair>>,
    index: HashMap<Fingerprint, usize>,
    key_bits: usize,
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_BITS)
    }
}

impl KeyRegistry {
    /// Empty registry generating `key_bits` RSA keys
    pub fn new(key_bits: usize) -> Self {
        Self {
            keys: Vec::new(),
            index: HashMap::new(),
            key_bits,
        }
    }

    pub fn into_shared(self) -> SharedRegistry {
        Arc::new(tokio::sync::RwLock::new(self))
    }

    pub fn key_bits(&self) -> usize {
        self.key_bits
    }

    /// Creation time for a key that must become active: `now`, or just after
    /// the active key if the clock went backwards.
    pub fn next_created_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.keys.last() {
            Some(active) if now <= active.created_at() => {
                active.created_at() + Duration::milliseconds(1)
            }
            _ => now,
        }
    }

    /// Create a key, append it and make it active
    pub fn generate(&mut self, now: DateTime<Utc>) -> Result<Arc<KeyPair>> {
        let key = KeyPair::generate(self.key_bits, self.next_created_at(now))?;
        info!(fingerprint = %key.id().short(), "generated sealing key");
        self.insert(key)
    }

    /// Add an existing key, keeping creation order.
    ///
    /// A key created at the same instant as an existing one sorts after it.
    pub fn insert(&mut self, key: KeyPair) -> Result<Arc<KeyPair>> {
        if self.index.contains_key(key.id()) {
            return Err(CryptoError::DuplicateKey(key.id().clone()));
        }
        let key = Arc::new(key);
        let position = self
            .keys
            .partition_point(|k| k.created_at() <= key.created_at());
        self.keys.insert(position, Arc::clone(&key));
        self.reindex();
        Ok(key)
    }

    /// The key all new seals use
    pub fn active(&self) -> Result<&Arc<KeyPair>> {
        self.keys.last().ok_or(CryptoError::NoActiveKey)
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<&Arc<KeyPair>> {
        self.index.get(fingerprint).map(|&i| &self.keys[i])
    }

    /// All keys, most recent first
    pub fn all(&self) -> impl Iterator<Item = &Arc<KeyPair>> + '_ {
        self.keys.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Drop every key `removable` selects, except the active one.
    ///
    /// Callers are responsible for making sure no unmigrated envelope still
    /// references a removed key.
    pub fn prune<F>(&mut self, mut removable: F) -> Vec<Fingerprint>
    where
        F: FnMut(&KeyPair) -> bool,
    {
        let Some(active) = self.keys.last().map(|k| k.id().clone()) else {
            return Vec::new();
        };

        let mut removed = Vec::new();
        self.keys.retain(|k| {
            let drop = k.id() != &active && removable(k);
            if drop {
                removed.push(k.id().clone());
            }
            !drop
        });
        if !removed.is_empty() {
            self.reindex();
            info!(count = removed.len(), "pruned sealing keys");
        }
        removed
    }

    fn reindex(&mut self) {
        self.index = self
            .keys
            .iter()
            .enumerate()
            .map(|(i, k)| (k.id().clone(), i))
            .collect();
    }
}
