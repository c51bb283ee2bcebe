//! Reseal CLI - migrate sealed secrets to the active key
//!
//! Usage:
//!   reseal init                 Create master key, keystore, store and policy
//!   reseal keys rotate|list|prune
//!   reseal cert                 Print the active public key
//!   reseal seal / unseal        Write or read one sealed field
//!   reseal reencrypt            Re-seal every stale object
//!   reseal serve                Run the HTTP unseal boundary
//!   reseal grant                Issue a bearer token with namespace grants

mod client;
mod commands;
mod config;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use reseal_crypto::DEFAULT_KEY_BITS;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Home;

#[derive(Parser)]
#[command(name = "reseal")]
#[command(author, version, about = "Re-encrypt sealed secrets under the active key")]
#[command(
    long_about = "Reseal - key rotation for sealed secrets.\n\n\
    Objects carry envelopes sealed under a public key; after a rotation, \
    `reseal reencrypt` migrates every envelope to the new key without \
    letting plaintext leave the unseal boundary's control."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding keys, store and policy (default ~/.reseal)
    #[arg(long, global = true, env = "RESEAL_HOME")]
    home: Option<PathBuf>,

    /// RSA modulus size for new keys
    #[arg(long, global = true, default_value_t = DEFAULT_KEY_BITS)]
    key_bits: usize,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the master key, the first sealing key, the store and an empty policy
    Init,

    /// Manage sealing keys
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },

    /// Print the active public key as PEM
    Cert,

    /// Seal a value read from stdin into an object field
    Seal {
        #[command(flatten)]
        field: FieldArgs,

        /// strict, namespace-wide or cluster-wide
        #[arg(long, default_value = "strict")]
        scope: String,

        /// Seal under this PEM public key instead of the local active key
        #[arg(long)]
        cert: Option<PathBuf>,
    },

    /// Unseal one field (masked unless --reveal)
    Unseal {
        #[command(flatten)]
        field: FieldArgs,

        /// Print the plaintext
        #[arg(long)]
        reveal: bool,
    },

    /// Re-seal every object that is not yet under the active key
    Reencrypt(ReencryptArgs),

    /// Serve the unseal boundary over HTTP
    Serve {
        #[arg(long, default_value = "127.0.0.1:8420")]
        listen: SocketAddr,
    },

    /// Inspect stored objects
    Objects {
        #[command(subcommand)]
        action: ObjectsAction,
    },

    /// Issue a bearer token for IDENTITY and grant it NAMESPACES ("*" for all)
    Grant {
        identity: String,
        #[arg(required = true)]
        namespaces: Vec<String>,
    },
}

#[derive(Subcommand)]
enum KeysAction {
    /// Generate a new active key
    Rotate,
    /// List keys, newest first
    List,
    /// Drop all but the newest N keys
    Prune {
        #[arg(long)]
        keep: usize,
        /// Prune even if stored envelopes still need the keys
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum ObjectsAction {
    /// List objects and the key each field is sealed under
    List {
        #[arg(long)]
        namespace: Option<String>,
    },
}

#[derive(Args)]
struct FieldArgs {
    #[arg(long)]
    namespace: String,
    #[arg(long)]
    name: String,
    #[arg(long)]
    field: String,
}

#[derive(Args)]
struct ReencryptArgs {
    /// Only objects in this namespace
    #[arg(long, conflicts_with = "all_namespaces", required_unless_present = "all_namespaces")]
    namespace: Option<String>,

    /// Every namespace
    #[arg(long)]
    all_namespaces: bool,

    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Store calls per second
    #[arg(long)]
    rate_limit: Option<u32>,

    /// Report what would change without writing
    #[arg(long)]
    dry_run: bool,

    /// Keep going after fatal store errors
    #[arg(long)]
    force: bool,

    /// Save each object's prior version before updating it
    #[arg(long)]
    backup: bool,

    /// Write the JSON report here
    #[arg(long)]
    report: Option<PathBuf>,

    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Unseal through a remote boundary instead of the local keystore
    #[arg(long, requires = "token")]
    unseal_url: Option<String>,

    /// Bearer token for --unseal-url
    #[arg(long, env = "RESEAL_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries PEMs, tokens and plaintext
    let default = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let home = Home::resolve(cli.home)?;
    let bits = cli.key_bits;

    match cli.command {
        Commands::Init => commands::init(&home, bits)?,

        Commands::Keys { action } => match action {
            KeysAction::Rotate => commands::rotate(&home, bits)?,
            KeysAction::List => commands::list_keys(&home, bits)?,
            KeysAction::Prune { keep, force } => commands::prune(&home, bits, keep, force).await?,
        },

        Commands::Cert => commands::cert(&home, bits)?,

        Commands::Seal { field, scope, cert } => {
            commands::seal(&home, bits, &field, &scope, cert.as_deref()).await?
        }

        Commands::Unseal { field, reveal } => commands::unseal(&home, bits, &field, reveal).await?,

        Commands::Reencrypt(args) => {
            let code = commands::reencrypt(&home, bits, args).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }

        Commands::Serve { listen } => commands::serve(&home, bits, listen).await?,

        Commands::Objects { action } => match action {
            ObjectsAction::List { namespace } => commands::list_objects(&home, namespace).await?,
        },

        Commands::Grant {
            identity,
            namespaces,
        } => commands::grant(&home, &identity, &namespaces)?,
    }

    Ok(())
}
