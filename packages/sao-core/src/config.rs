//! Node configuration.
//!
//! Read from `<repo>/config.toml`. Every section falls back to defaults,
//! so a missing section (or an empty file) yields a working single-node
//! setup.
//!
//! ```toml
//! [api_server]
//! ip = "0.0.0.0"
//! port = 5151
//! exposed_path = "http://10.0.0.5:5151"
//!
//! [libp2p]
//! listen_addresses = ["/ip4/0.0.0.0/tcp/5153"]
//! direct_peers = ["/ip4/10.0.0.6/tcp/5153/p2p/12D3KooW..."]
//!
//! [store]
//! part_count = 2
//! peer_order = "shuffled"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the configuration file inside the repo directory
pub const CONFIG_FILE: &str = "config.toml";
/// Node identity key file
pub const NODE_KEY_FILE: &str = "libp2p.key";
/// Key custody database
pub const KEYSTORE_DB: &str = "keystore.db";
/// File catalog database
pub const CATALOG_DB: &str = "catalog.db";

/// Plaintext chunks are streamed through memory in windows of this size
pub const DEFAULT_CHUNK_THRESHOLD: u64 = 512 * 1024 * 1024;

/// Complete node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// HTTP file server
    pub api_server: ApiServerConfig,
    /// Peer-to-peer messaging
    pub libp2p: Libp2pConfig,
    /// Bulk transfer limits
    pub transport: TransportConfig,
    /// Processing worker
    pub proc: ProcConfig,
    /// Store orchestrator
    pub store: StoreConfig,
}

/// HTTP file server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiServerConfig {
    /// Bind address
    pub ip: String,
    /// Bind port
    pub port: u16,
    /// Path prefix mounted in front of every route
    pub context_path: String,
    /// Externally reachable base URL advertised to peers
    pub exposed_path: String,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".into(),
            port: 5151,
            context_path: String::new(),
            exposed_path: "http://127.0.0.1:5151".into(),
        }
    }
}

/// libp2p settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Libp2pConfig {
    /// Multiaddrs to listen on
    pub listen_addresses: Vec<String>,
    /// Multiaddrs dialed on startup. Entries ending in `/p2p/<id>` form the
    /// trusted-peer allowlist.
    pub direct_peers: Vec<String>,
}

impl Default for Libp2pConfig {
    fn default() -> Self {
        Self {
            listen_addresses: vec!["/ip4/0.0.0.0/tcp/5153".into()],
            direct_peers: Vec::new(),
        }
    }
}

/// Bulk transfer settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Upper bound on a single chunk transfer
    pub max_transfer_duration_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_transfer_duration_secs: 3600,
        }
    }
}

impl TransportConfig {
    /// Transfer bound as a duration
    pub fn max_transfer_duration(&self) -> Duration {
        Duration::from_secs(self.max_transfer_duration_secs)
    }
}

/// Processing worker settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcConfig {
    /// Time allowed to read an inbound request
    pub read_deadline_secs: u64,
    /// Time allowed for a request/response exchange to complete
    pub write_deadline_secs: u64,
    /// Largest accepted envelope
    pub max_message_size: usize,
}

impl Default for ProcConfig {
    fn default() -> Self {
        Self {
            read_deadline_secs: 10,
            write_deadline_secs: 300,
            max_message_size: 1024 * 1024,
        }
    }
}

impl ProcConfig {
    /// Request read bound
    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.read_deadline_secs)
    }

    /// Exchange bound
    pub fn write_deadline(&self) -> Duration {
        Duration::from_secs(self.write_deadline_secs)
    }
}

/// Order in which candidate peers are tried
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PeerOrder {
    /// Allowlist order from the configuration
    #[default]
    Configured,
    /// Fresh random order per chunk
    Shuffled,
}

/// Content-addressed backend selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Files under `<repo>/objects`
    #[default]
    Local,
    /// An IPFS HTTP API endpoint
    Ipfs,
}

/// IPFS endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IpfsConfig {
    /// API base URL
    pub url: String,
    /// Basic auth user, if the endpoint requires it
    pub project_id: String,
    /// Basic auth password
    pub project_secret: String,
}

impl Default for IpfsConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:5001".into(),
            project_id: String::new(),
            project_secret: String::new(),
        }
    }
}

/// Store orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Number of chunks a priced upload is split into
    pub part_count: usize,
    /// Streaming window for split and combine
    pub chunk_threshold: u64,
    /// Peers tried per chunk before giving up
    pub max_peer_attempts: usize,
    /// Candidate ordering
    pub peer_order: PeerOrder,
    /// Chunks processed concurrently
    pub chunk_concurrency: usize,
    /// Where sealed objects are stored
    pub backend: Backend,
    /// IPFS endpoint, used when `backend = "ipfs"`
    pub ipfs: IpfsConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            part_count: 2,
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            max_peer_attempts: 3,
            peer_order: PeerOrder::Configured,
            chunk_concurrency: 1,
            backend: Backend::Local,
            ipfs: IpfsConfig::default(),
        }
    }
}

impl Config {
    /// Load `<repo>/config.toml`
    pub fn load(repo: &Path) -> Result<Self> {
        let path = repo.join(CONFIG_FILE);
        let text = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Parse configuration text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Reject values the pipeline cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.store.part_count == 0 {
            return Err(Error::Config("store.part_count must be at least 1".into()));
        }
        if self.store.chunk_threshold == 0 {
            return Err(Error::Config("store.chunk_threshold must be positive".into()));
        }
        if self.store.chunk_concurrency == 0 {
            return Err(Error::Config("store.chunk_concurrency must be at least 1".into()));
        }
        if self.store.max_peer_attempts == 0 {
            return Err(Error::Config("store.max_peer_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Peer ids of every `direct_peers` entry carrying a `/p2p/<id>` suffix,
    /// in configuration order
    pub fn trusted_peer_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for addr in &self.libp2p.direct_peers {
            if let Some((_, id)) = addr.rsplit_once("/p2p/") {
                let id = id.trim_end_matches('/');
                if !id.is_empty() && !ids.iter().any(|known| known == id) {
                    ids.push(id.to_string());
                }
            }
        }
        ids
    }

    /// Base URL prefixed to every advertised file path
    pub fn advertised_base(&self) -> String {
        format!(
            "{}{}",
            self.api_server.exposed_path.trim_end_matches('/'),
            self.api_server.context_path.trim_end_matches('/')
        )
    }
}

/// Well-known paths inside a node repo
#[derive(Debug, Clone)]
pub struct RepoLayout {
    root: PathBuf,
}

impl RepoLayout {
    /// Wrap a repo root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Repo root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `config.toml`
    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Persisted node identity
    pub fn node_key(&self) -> PathBuf {
        self.root.join(NODE_KEY_FILE)
    }

    /// Key custody database
    pub fn keystore_db(&self) -> PathBuf {
        self.root.join(KEYSTORE_DB)
    }

    /// File catalog database
    pub fn catalog_db(&self) -> PathBuf {
        self.root.join(CATALOG_DB)
    }

    /// Worker staging directory
    pub fn proc_stage(&self) -> PathBuf {
        self.root.join("staging").join("proc")
    }

    /// Orchestrator staging directory
    pub fn store_stage(&self) -> PathBuf {
        self.root.join("staging").join("store")
    }

    /// Local object store root
    pub fn objects(&self) -> PathBuf {
        self.root.join("objects")
    }

    /// Assembled plaintext of downloaded files, kept off the file server
    pub fn download_cache(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Create every directory the node writes into
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.proc_stage(),
            self.store_stage(),
            self.objects(),
            self.download_cache(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}
