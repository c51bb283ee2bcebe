//! Durable, encrypted key history
//!
//! Private keys are stored as PKCS#8 PEM sealed with ChaCha20-Poly1305 under a
//! master key that lives outside the keystore file. Every mutation is written
//! to disk (temp file, fsync, rename) before the in-memory registry changes, so
//! a crash can never leave the active key pointing at a key that was not saved.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use ring::rand::SecureRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::cipher::{self, KEY_SIZE};
use crate::keys::{Fingerprint, KeyPair};
use crate::registry::KeyRegistry;
use crate::{CryptoError, Result};

const KEYSTORE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeystoreFile {
    version: u32,
    keys: Vec<StoredKey>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredKey {
    id: Fingerprint,
    created_at: DateTime<Utc>,
    nonce: String,
    sealed_private_key: String,
    tag: String,
}

pub struct KeyStore {
    path: PathBuf,
    master_key: Zeroizing<[u8; KEY_SIZE]>,
}

impl KeyStore {
    pub fn new(path: PathBuf, master_key: Zeroizing<[u8; KEY_SIZE]>) -> Self {
        Self { path, master_key }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the key history. A missing file yields an empty registry.
    pub fn load(&self, key_bits: usize) -> Result<KeyRegistry> {
        let mut registry = KeyRegistry::new(key_bits);
        if !self.path.exists() {
            return Ok(registry);
        }

        let data = fs::read(&self.path)?;
        let file: KeystoreFile =
            serde_json::from_slice(&data).map_err(|e| CryptoError::Keystore(e.to_string()))?;
        if file.version != KEYSTORE_VERSION {
            return Err(CryptoError::Keystore(format!(
                "unsupported keystore version {}",
                file.version
            )));
        }

        for stored in &file.keys {
            let pem = self.open_key(stored)?;
            let pem = std::str::from_utf8(&pem)
                .map_err(|_| CryptoError::Keystore("private key is not UTF-8".into()))?;
            let key = KeyPair::from_pkcs8_pem(pem, stored.created_at)?;
            if key.id() != &stored.id {
                return Err(CryptoError::Keystore(format!(
                    "fingerprint mismatch for stored key {}",
                    stored.id.short()
                )));
            }
            registry.insert(key)?;
        }

        debug!(path = %self.path.display(), keys = registry.len(), "loaded keystore");
        Ok(registry)
    }

    /// Generate a key, persist it, then make it active in `registry`
    pub fn rotate(&self, registry: &mut KeyRegistry, now: DateTime<Utc>) -> Result<Arc<KeyPair>> {
        let key = KeyPair::generate(registry.key_bits(), registry.next_created_at(now))?;

        let mut snapshot: Vec<&KeyPair> = registry.all().map(|k| &**k).collect();
        snapshot.push(&key);
        self.write(&snapshot)?;

        info!(fingerprint = %key.id().short(), "rotated sealing key");
        registry.insert(key)
    }

    /// Persist the pruned history, then prune `registry` to match
    pub fn prune<F>(&self, registry: &mut KeyRegistry, mut removable: F) -> Result<Vec<Fingerprint>>
    where
        F: FnMut(&KeyPair) -> bool,
    {
        let active = registry.active()?.id().clone();
        let doomed: HashSet<Fingerprint> = registry
            .all()
            .map(|k| &**k)
            .filter(|k| k.id() != &active && removable(k))
            .map(|k| k.id().clone())
            .collect();
        if doomed.is_empty() {
            return Ok(Vec::new());
        }

        let remaining: Vec<&KeyPair> = registry
            .all()
            .map(|k| &**k)
            .filter(|k| !doomed.contains(k.id()))
            .collect();
        self.write(&remaining)?;

        Ok(registry.prune(|k| doomed.contains(k.id())))
    }

    /// Write the full registry as-is
    pub fn persist(&self, registry: &KeyRegistry) -> Result<()> {
        let keys: Vec<&KeyPair> = registry.all().map(|k| &**k).collect();
        self.write(&keys)
    }

    fn write(&self, keys: &[&KeyPair]) -> Result<()> {
        let mut stored = keys
            .iter()
            .map(|k| self.seal_key(k))
            .collect::<Result<Vec<_>>>()?;
        stored.sort_by_key(|k| k.created_at);

        let file = KeystoreFile {
            version: KEYSTORE_VERSION,
            keys: stored,
        };
        let data =
            serde_json::to_vec_pretty(&file).map_err(|e| CryptoError::Keystore(e.to_string()))?;
        write_atomic(&self.path, &data)
    }

    fn seal_key(&self, key: &KeyPair) -> Result<StoredKey> {
        let pem = key.to_pkcs8_pem()?;
        let nonce = cipher::generate_nonce();
        let (ciphertext, tag) = cipher::encrypt(
            self.master_key.as_ref(),
            &nonce,
            pem.as_bytes(),
            key.id().as_str().as_bytes(),
        )?;
        Ok(StoredKey {
            id: key.id().clone(),
            created_at: key.created_at(),
            nonce: STANDARD.encode(nonce),
            sealed_private_key: STANDARD.encode(ciphertext),
            tag: STANDARD.encode(tag),
        })
    }

    fn open_key(&self, stored: &StoredKey) -> Result<Zeroizing<Vec<u8>>> {
        let decode = |field: &str| {
            STANDARD
                .decode(field)
                .map_err(|e| CryptoError::Keystore(e.to_string()))
        };
        cipher::decrypt(
            self.master_key.as_ref(),
            &decode(&stored.nonce)?,
            &decode(&stored.sealed_private_key)?,
            &decode(&stored.tag)?,
            stored.id.as_str().as_bytes(),
        )
        .map_err(|_| {
            CryptoError::Keystore(format!(
                "cannot decrypt key {} - wrong master key or corrupted keystore",
                stored.id.short()
            ))
        })
    }
}

/// Read the master key at `path`, creating it with fresh randomness if absent
pub fn load_or_create_master_key(path: &Path) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    if path.exists() {
        let bytes = Zeroizing::new(fs::read(path)?);
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::Keystore(format!(
                "master key must be {KEY_SIZE} bytes, found {}",
                bytes.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(&bytes);
        return Ok(key);
    }

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    ring::rand::SystemRandom::new()
        .fill(key.as_mut())
        .map_err(|_| CryptoError::KeyGeneration("system randomness unavailable".into()))?;
    write_atomic(path, key.as_ref())?;
    info!(path = %path.display(), "created master key");
    Ok(key)
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let tmp = path.with_extension("tmp");
    {
        let mut file = open_private(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::File::create(path)
}
