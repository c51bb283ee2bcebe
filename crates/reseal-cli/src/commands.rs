use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Utc;
use reseal_core::{
    AccessPolicy, CallerIdentity, CancelSignal, ListScope, LocalUnsealer, ObjectRef, ObjectStore,
    Orchestrator, ReencryptConfig, SealedObject, StoreError, UnsealBoundary, UnsealRequest,
    UnsealService, VersionToken, ALL_NAMESPACES,
};
use reseal_crypto::{Envelope, Fingerprint, KeyRegistry, PublicKey, ScopeLabel, ScopeMode};
use reseal_store::SqliteStore;
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::client::RemoteUnsealer;
use crate::config::{Home, PolicyFile, LOCAL_IDENTITY};
use crate::server::{self, AppState};
use crate::{FieldArgs, ReencryptArgs};

pub fn init(home: &Home, bits: usize) -> anyhow::Result<()> {
    fs::create_dir_all(home.root())
        .with_context(|| format!("Failed to create {}", home.root().display()))?;

    let keystore = home.keystore()?;
    if keystore.exists() {
        bail!("Already initialized at {}", home.root().display());
    }
    let mut registry = KeyRegistry::new(bits);
    let key = keystore.rotate(&mut registry, Utc::now())?;

    home.open_store()?;
    if !home.policy_path().exists() {
        PolicyFile::default().save(&home.policy_path())?;
    }

    println!("Initialized {}", home.root().display());
    println!("  active key {}", key.id());
    Ok(())
}

pub fn rotate(home: &Home, bits: usize) -> anyhow::Result<()> {
    let (keystore, mut registry) = home.load_registry(bits)?;
    let key = keystore.rotate(&mut registry, Utc::now())?;
    println!("{}", key.id());
    Ok(())
}

pub fn list_keys(home: &Home, bits: usize) -> anyhow::Result<()> {
    let (_, registry) = home.load_registry(bits)?;
    let active = registry.active()?.id().clone();
    for key in registry.all() {
        let marker = if key.id() == &active { "active" } else { "" };
        println!("{}  {}  {}", key.id(), key.created_at().to_rfc3339(), marker);
    }
    Ok(())
}

/// Keep the newest `keep` keys. Refuses to drop a key that stored
/// envelopes still name, or any key while legacy envelopes exist.
pub async fn prune(home: &Home, bits: usize, keep: usize, force: bool) -> anyhow::Result<()> {
    if keep == 0 {
        bail!("--keep must be at least 1");
    }
    let (keystore, mut registry) = home.load_registry(bits)?;
    let keep_ids: HashSet<Fingerprint> = registry.all().take(keep).map(|k| k.id().clone()).collect();

    let store = home.open_store()?;
    let usage = KeyUsage::scan(&store).await?;

    let candidates: Vec<Fingerprint> = registry
        .all()
        .filter(|k| !keep_ids.contains(k.id()))
        .map(|k| k.id().clone())
        .collect();
    if candidates.is_empty() {
        println!("Nothing to prune");
        return Ok(());
    }

    if !force {
        if usage.legacy > 0 {
            bail!(
                "{} legacy envelope(s) may need any key; run `reseal reencrypt` first or pass --force",
                usage.legacy
            );
        }
        let in_use: Vec<&Fingerprint> = candidates.iter().filter(|f| usage.keys.contains(*f)).collect();
        if !in_use.is_empty() {
            for fingerprint in &in_use {
                warn!(fingerprint = %fingerprint.short(), "key still referenced by stored envelopes");
            }
            bail!(
                "{} key(s) are still referenced; run `reseal reencrypt` first or pass --force",
                in_use.len()
            );
        }
    }

    let removed = keystore.prune(&mut registry, |k| !keep_ids.contains(k.id()))?;
    for fingerprint in &removed {
        println!("pruned {}", fingerprint);
    }
    Ok(())
}

struct KeyUsage {
    keys: HashSet<Fingerprint>,
    legacy: usize,
}

impl KeyUsage {
    async fn scan(store: &dyn ObjectStore) -> anyhow::Result<Self> {
        let mut usage = KeyUsage {
            keys: HashSet::new(),
            legacy: 0,
        };
        for versioned in store.list(&ListScope::AllNamespaces).await? {
            for envelope in versioned.object.encrypted_data.values() {
                match envelope.fingerprint() {
                    Some(fingerprint) => {
                        usage.keys.insert(fingerprint.clone());
                    }
                    None => usage.legacy += 1,
                }
            }
        }
        Ok(usage)
    }
}

pub fn cert(home: &Home, bits: usize) -> anyhow::Result<()> {
    let (_, registry) = home.load_registry(bits)?;
    print!("{}", registry.active()?.public_key().to_pem()?);
    Ok(())
}

pub async fn seal(
    home: &Home,
    bits: usize,
    field: &FieldArgs,
    scope: &str,
    cert: Option<&Path>,
) -> anyhow::Result<()> {
    let mode: ScopeMode = scope.parse()?;
    let public_key = match cert {
        Some(path) => {
            let pem = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            PublicKey::from_pem(&pem)?
        }
        None => {
            let (_, registry) = home.load_registry(bits)?;
            registry.active()?.public_key().clone()
        }
    };

    let mut value = zeroize::Zeroizing::new(Vec::new());
    std::io::stdin()
        .read_to_end(&mut value)
        .context("Failed to read value from stdin")?;
    let label = ScopeLabel::for_object(mode, &field.namespace, &field.name);
    let envelope = reseal_crypto::seal(&value, &label, &public_key)?;

    let store = home.open_store()?;
    let object_ref = ObjectRef::new(&field.namespace, &field.name);
    let version = store_field(&store, &object_ref, &field.field, envelope).await?;

    info!(object = %object_ref, field = %field.field, scope = %label, "sealed");
    println!(
        "sealed {}/{} under {} (version {})",
        object_ref,
        field.field,
        public_key.fingerprint().short(),
        version
    );
    Ok(())
}

const SEAL_WRITE_ATTEMPTS: usize = 5;

/// Write one field without clobbering a concurrent writer: a new object is
/// inserted only if still absent, an existing one is updated only at the
/// version it was read at. Conflicts re-read and re-apply the field.
async fn store_field(
    store: &SqliteStore,
    object_ref: &ObjectRef,
    field: &str,
    envelope: Envelope,
) -> anyhow::Result<VersionToken> {
    for attempt in 1..=SEAL_WRITE_ATTEMPTS {
        let written = match store.get(object_ref).await? {
            Some(existing) => {
                let object = existing.object.with_field(field, envelope.clone());
                store.update(&object, &existing.version).await
            }
            None => {
                let object = SealedObject::new(&object_ref.namespace, &object_ref.name)
                    .with_field(field, envelope.clone());
                store.create(&object)
            }
        };
        match written {
            Ok(version) => return Ok(version),
            Err(StoreError::Conflict(_)) | Err(StoreError::NotFound(_)) => {
                debug!(object = %object_ref, attempt, "concurrent write, re-reading");
            }
            Err(e) => return Err(e.into()),
        }
    }
    bail!(
        "{} kept changing underneath; gave up after {} attempts",
        object_ref,
        SEAL_WRITE_ATTEMPTS
    )
}

pub async fn unseal(home: &Home, bits: usize, field: &FieldArgs, reveal: bool) -> anyhow::Result<()> {
    let store = home.open_store()?;
    let object_ref = ObjectRef::new(&field.namespace, &field.name);
    let current = store
        .get(&object_ref)
        .await?
        .with_context(|| format!("No object {}", object_ref))?;
    let envelope = current
        .object
        .encrypted_data
        .get(&field.field)
        .with_context(|| format!("{} has no field {}", object_ref, field.field))?
        .clone();

    let unsealer = local_unsealer(home, bits)?;
    let scope = current.object.claim_for(&envelope);
    let plaintext = unsealer.unseal(&UnsealRequest { envelope, scope }).await?;

    if reveal {
        match std::str::from_utf8(&plaintext) {
            Ok(text) => println!("{}", text),
            Err(_) => println!("{:02x?}", plaintext.as_slice()),
        }
    } else {
        println!("{} ({} bytes, pass --reveal to print)", "*".repeat(8), plaintext.len());
    }
    Ok(())
}

/// Returns the process exit code: 0 all succeeded, 2 some failed, 3 aborted
pub async fn reencrypt(home: &Home, bits: usize, args: ReencryptArgs) -> anyhow::Result<i32> {
    let store = Arc::new(home.open_store()?);
    let unsealer: Arc<dyn UnsealService> = match (&args.unseal_url, args.token) {
        (Some(url), Some(token)) => Arc::new(RemoteUnsealer::new(url, SecretString::new(token))?),
        (Some(_), None) => bail!("--unseal-url needs --token or RESEAL_TOKEN"),
        (None, _) => Arc::new(local_unsealer(home, bits)?),
    };

    let scope = match args.namespace {
        Some(namespace) => ListScope::Namespace(namespace),
        None => ListScope::AllNamespaces,
    };
    let config = ReencryptConfig::default()
        .with_scope(scope)
        .with_concurrency(args.concurrency)
        .with_dry_run(args.dry_run)
        .with_force(args.force)
        .with_backup(args.backup)
        .with_rate_limit(args.rate_limit)
        .with_timeout(args.timeout_secs.map(Duration::from_secs));

    let cancel = CancelSignal::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel("interrupted");
        }
    });

    let report = Orchestrator::new(store.clone(), unsealer, config)
        .with_backup(store)
        .run(&cancel)
        .await;

    if let Some(path) = &args.report {
        report
            .write_json(path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
    }
    for failure in report.failures() {
        eprintln!(
            "  {}/{}: {} {}",
            failure.namespace,
            failure.name,
            failure.kind.map(|k| k.to_string()).unwrap_or_default(),
            failure.detail.as_deref().unwrap_or("")
        );
    }
    println!("{}", report);
    Ok(report.exit_code())
}

pub async fn serve(home: &Home, bits: usize, listen: SocketAddr) -> anyhow::Result<()> {
    let (_, registry) = home.load_registry(bits)?;
    let policy = home.load_policy()?;
    if policy.tokens.is_empty() {
        warn!("no tokens issued; every unseal request will be refused (see `reseal grant`)");
    }
    let boundary = Arc::new(UnsealBoundary::new(registry.into_shared(), policy.grants.clone()));

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    let shutdown = CancelSignal::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel("interrupted");
        }
    });

    server::serve(listener, AppState::new(boundary, policy), shutdown).await?;
    Ok(())
}

pub async fn list_objects(home: &Home, namespace: Option<String>) -> anyhow::Result<()> {
    let store = home.open_store()?;
    let scope = match namespace {
        Some(namespace) => ListScope::Namespace(namespace),
        None => ListScope::AllNamespaces,
    };
    for versioned in store.list(&scope).await? {
        let object = &versioned.object;
        println!("{}  (version {})", object.object_ref(), versioned.version);
        for (field, envelope) in &object.encrypted_data {
            let key = envelope
                .fingerprint()
                .map(|f| f.short().to_string())
                .unwrap_or_else(|| "legacy".to_string());
            println!("  {}  {}  {}", field, envelope.scope.mode(), key);
        }
    }
    Ok(())
}

pub fn grant(home: &Home, identity: &str, namespaces: &[String]) -> anyhow::Result<()> {
    if identity == LOCAL_IDENTITY {
        bail!("`{}` is reserved for in-process commands", LOCAL_IDENTITY);
    }
    let mut policy = home.load_policy()?;
    let identity = CallerIdentity::new(identity);
    let token = policy.issue_token(&identity)?;
    for namespace in namespaces {
        policy.grants.allow(&identity, namespace);
    }
    policy.save(&home.policy_path())?;

    eprintln!("Token for {} (shown once):", identity);
    println!("{}", token.expose_secret());
    Ok(())
}

/// In-process boundary with access to every namespace
fn local_unsealer(home: &Home, bits: usize) -> anyhow::Result<LocalUnsealer> {
    let (_, registry) = home.load_registry(bits)?;
    let identity = CallerIdentity::new(LOCAL_IDENTITY);
    let policy = AccessPolicy::empty().with_grant(identity.as_str(), ALL_NAMESPACES);
    let boundary = Arc::new(UnsealBoundary::new(registry.into_shared(), policy));
    Ok(LocalUnsealer::new(boundary, identity))
}
