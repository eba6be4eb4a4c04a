//! SAO Storage Node
//!
//! One binary runs both roles of the storage pipeline:
//!
//! 1. **Processing worker**: answers encrypt/decrypt requests from other
//!    nodes over libp2p, pulls their chunks over HTTP, seals or opens them
//!    and serves the result from its staging directory.
//!
//! 2. **Store orchestrator**: splits uploads into chunks, has trusted peers
//!    seal them, and stores the combined ciphertext in the object store.
//!
//! `sao-node run` keeps a worker online. `store`, `fetch` and `delete` bring
//! the same node up for a single orchestrator operation and stop it again.

mod node;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use sao_core::network::load_or_generate_keypair;
use sao_core::storage::Database;
use sao_core::store::ObjectReader;
use sao_core::{Config, Context, RepoLayout, StoreRequest};

use node::Node;

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "sao-node", version, about = "SAO encrypted storage node")]
struct Args {
    /// Node repo directory (config, keys, databases, staging)
    #[arg(long, env = "SAO_REPO")]
    repo: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the repo with a default configuration and a node key
    Init,

    /// Run the node until Ctrl-C
    Run,

    /// Upload a file
    Store {
        /// File to upload
        path: PathBuf,

        /// Price; any non-zero price stores the file encrypted
        #[arg(long, default_value_t = 0)]
        price: u64,

        /// File id to use instead of a generated one
        #[arg(long)]
        file_id: Option<String>,

        /// Uploading client id
        #[arg(long, default_value = "cli")]
        client_id: String,

        /// MIME type recorded with the file
        #[arg(long, default_value = "application/octet-stream")]
        content_type: String,

        /// Seconds to wait for the trusted peers to connect
        #[arg(long, default_value_t = 10)]
        connect_timeout_secs: u64,
    },

    /// Download a file
    Fetch {
        /// File id returned by `store`
        file_id: String,

        /// Output path
        #[arg(short, long)]
        out: PathBuf,

        /// Seconds to wait for the trusted peers to connect
        #[arg(long, default_value_t = 10)]
        connect_timeout_secs: u64,
    },

    /// Remove a file from the object store and the catalog
    Delete {
        /// File id returned by `store`
        file_id: String,
    },
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let default_filter = if args.verbose {
        "sao_core=debug,sao_node=debug,tower_http=debug"
    } else {
        "sao_core=info,sao_node=info,tower_http=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let layout = RepoLayout::new(repo_root(args.repo)?);

    match args.command {
        Command::Init => init(&layout),
        Command::Run => run(layout).await,
        Command::Store {
            path,
            price,
            file_id,
            client_id,
            content_type,
            connect_timeout_secs,
        } => {
            let node = Node::start(layout).await?;
            let result = async {
                if price > 0 {
                    node.wait_for_peers(Duration::from_secs(connect_timeout_secs))
                        .await?;
                }
                store(&node, path, price, file_id, client_id, content_type).await
            }
            .await;
            node.stop().await;
            result
        }
        Command::Fetch {
            file_id,
            out,
            connect_timeout_secs,
        } => {
            let node = Node::start(layout).await?;
            let result = async {
                // Free files never need a peer
                if let Err(e) = node
                    .wait_for_peers(Duration::from_secs(connect_timeout_secs))
                    .await
                {
                    tracing::warn!(error = %e, "Fetching without peers");
                }
                fetch(&node, &file_id, out).await
            }
            .await;
            node.stop().await;
            result
        }
        Command::Delete { file_id } => {
            let node = Node::start(layout).await?;
            let result: Result<()> = async {
                node.store_service()?.delete_file(&file_id).await?;
                println!("deleted {}", file_id);
                Ok(())
            }
            .await;
            node.stop().await;
            result
        }
    }
}

fn repo_root(repo: Option<PathBuf>) -> Result<PathBuf> {
    match repo {
        Some(path) => Ok(path),
        None => dirs::home_dir()
            .map(|home| home.join(".sao-node"))
            .ok_or_else(|| eyre!("no home directory, pass --repo")),
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

fn init(layout: &RepoLayout) -> Result<()> {
    layout.ensure()?;

    let config_file = layout.config_file();
    if config_file.exists() {
        tracing::info!(path = %config_file.display(), "Keeping existing configuration");
    } else {
        std::fs::write(&config_file, Config::default().to_toml()?)
            .wrap_err_with(|| format!("Failed to write {}", config_file.display()))?;
        tracing::info!(path = %config_file.display(), "Wrote default configuration");
    }

    // Opening applies the schemas
    Database::open(Some(&layout.keystore_db()))?;
    Database::open(Some(&layout.catalog_db()))?;

    let keypair = load_or_generate_keypair(&layout.node_key())?;
    println!("peer id: {}", keypair.public().to_peer_id());
    println!("repo:    {}", layout.root().display());
    Ok(())
}

async fn run(layout: RepoLayout) -> Result<()> {
    let node = Node::start(layout).await?;
    tracing::info!(peer_id = %node.network().peer_id(), version = sao_core::VERSION, "SAO node running");

    tokio::signal::ctrl_c()
        .await
        .wrap_err("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");
    node.stop().await;
    Ok(())
}

async fn store(
    node: &Node,
    path: PathBuf,
    price: u64,
    file_id: Option<String>,
    client_id: String,
    content_type: String,
) -> Result<()> {
    let file = tokio::fs::File::open(&path)
        .await
        .wrap_err_with(|| format!("Failed to open {}", path.display()))?;
    let size = file.metadata().await?.len();
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());

    let request = StoreRequest {
        file_id,
        filename,
        content_type,
        size,
        price,
        client_id,
    };
    let reader: ObjectReader = Box::new(file);
    let record = node
        .store_service()?
        .store_file(&Context::background(), reader, request)
        .await?;

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn fetch(node: &Node, file_id: &str, out: PathBuf) -> Result<()> {
    let (record, mut reader) = node
        .store_service()?
        .get_file(&Context::background(), file_id)
        .await?;

    let mut output = tokio::fs::File::create(&out)
        .await
        .wrap_err_with(|| format!("Failed to create {}", out.display()))?;
    let copied = tokio::io::copy(&mut reader, &mut output).await?;
    if copied != record.size {
        return Err(eyre!("wrote {} bytes, expected {}", copied, record.size));
    }

    tracing::info!(file_id, bytes = copied, out = %out.display(), "Fetched file");
    Ok(())
}
