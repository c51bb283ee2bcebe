//! On-disk layout of a reseal home directory and the access policy file
//!
//! ```text
//! ~/.reseal/
//!   master.key    32 random bytes, mode 0600
//!   keys.json     encrypted keystore
//!   objects.db    SQLite object store
//!   policy.json   bearer token digests and namespace grants
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use reseal_core::{AccessPolicy, CallerIdentity};
use reseal_crypto::{load_or_create_master_key, KeyRegistry, KeyStore};
use reseal_store::SqliteStore;
use ring::rand::SecureRandom;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Identity used by commands that unseal in-process
pub const LOCAL_IDENTITY: &str = "local";

pub struct Home {
    root: PathBuf,
}

impl Home {
    /// `--home`/`RESEAL_HOME` if given, otherwise `~/.reseal`
    pub fn resolve(explicit: Option<PathBuf>) -> anyhow::Result<Self> {
        let root = match explicit {
            Some(root) => root,
            None => dirs::home_dir()
                .context("No home directory; pass --home")?
                .join(".reseal"),
        };
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn master_key_path(&self) -> PathBuf {
        self.root.join("master.key")
    }

    pub fn keystore_path(&self) -> PathBuf {
        self.root.join("keys.json")
    }

    pub fn store_path(&self) -> PathBuf {
        self.root.join("objects.db")
    }

    pub fn policy_path(&self) -> PathBuf {
        self.root.join("policy.json")
    }

    /// Keystore handle; creates the master key on first use
    pub fn keystore(&self) -> anyhow::Result<KeyStore> {
        let master_key = load_or_create_master_key(&self.master_key_path())
            .with_context(|| format!("Failed to load master key from {}", self.root.display()))?;
        Ok(KeyStore::new(self.keystore_path(), master_key))
    }

    /// Load the key registry, failing if `reseal init` has not run
    pub fn load_registry(&self, key_bits: usize) -> anyhow::Result<(KeyStore, KeyRegistry)> {
        if !self.keystore_path().exists() {
            bail!(
                "No keystore at {} - run `reseal init` first",
                self.keystore_path().display()
            );
        }
        let keystore = self.keystore()?;
        let registry = keystore
            .load(key_bits)
            .context("Failed to load keystore")?;
        Ok((keystore, registry))
    }

    pub fn open_store(&self) -> anyhow::Result<SqliteStore> {
        SqliteStore::open(&self.store_path())
            .with_context(|| format!("Failed to open {}", self.store_path().display()))
    }

    pub fn load_policy(&self) -> anyhow::Result<PolicyFile> {
        PolicyFile::load(&self.policy_path())
    }
}

/// Bearer token digests mapped to identities, plus the grants of each identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyFile {
    /// Hex SHA-256 of a bearer token -> identity
    #[serde(default)]
    pub tokens: BTreeMap<String, CallerIdentity>,
    #[serde(default)]
    pub grants: AccessPolicy,
}

impl PolicyFile {
    /// Missing file means an empty, deny-all policy
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_slice(&data).with_context(|| format!("Invalid policy file {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Register a fresh token for `identity` and return it. Only the digest is kept.
    pub fn issue_token(&mut self, identity: &CallerIdentity) -> anyhow::Result<SecretString> {
        let mut raw = zeroize::Zeroizing::new([0u8; 32]);
        ring::rand::SystemRandom::new()
            .fill(raw.as_mut())
            .map_err(|_| anyhow::anyhow!("system randomness unavailable"))?;
        let token = URL_SAFE_NO_PAD.encode(&raw[..]);
        self.tokens.insert(token_digest(&token), identity.clone());
        Ok(SecretString::new(token))
    }

    /// Identity behind a presented bearer token
    pub fn identify(&self, token: &SecretString) -> Option<&CallerIdentity> {
        self.tokens.get(&token_digest(token.expose_secret()))
    }
}

pub fn token_digest(token: &str) -> String {
    ring::digest::digest(&ring::digest::SHA256, token.as_bytes())
        .as_ref()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
