//! A running node: libp2p, the file server and the processing worker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use sao_core::config::Backend;
use sao_core::network::{load_or_generate_keypair, NetworkConfig, NetworkHandle, NetworkService};
use sao_core::proc::server::file_router;
use sao_core::storage::{Database, SqliteCatalog, SqliteKeyStore};
use sao_core::store::{IpfsStore, LocalObjectStore, ObjectStore};
use sao_core::transfer::HttpTransport;
use sao_core::{Config, ProcNode, ProcSettings, RepoLayout, StoreService, StoreSettings};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

pub struct Node {
    layout: RepoLayout,
    config: Config,
    transport: Arc<HttpTransport>,
    network: NetworkService,
    worker: JoinHandle<()>,
    server: JoinHandle<()>,
    server_stop: oneshot::Sender<()>,
}

impl Node {
    /// Bring up every service the repo at `layout` is configured for
    pub async fn start(layout: RepoLayout) -> Result<Self> {
        let config = Config::load(layout.root())
            .wrap_err("repo is not initialised, run `sao-node init` first")?;
        layout.ensure()?;

        // ── Identity & Network ──────────────────────────────────────────────

        let keypair = load_or_generate_keypair(&layout.node_key())?;
        let (network, inbound) = NetworkService::start(keypair, NetworkConfig::from_config(&config)?)?;
        let peer_id = network.handle().peer_id().to_string();

        // ── Processing Worker ───────────────────────────────────────────────

        let transport = Arc::new(HttpTransport::new()?);
        let keys = SqliteKeyStore::new(Database::open(Some(&layout.keystore_db()))?, peer_id);
        let worker = Arc::new(ProcNode::new(
            ProcSettings::from_config(&config, &layout),
            Arc::new(keys),
            transport.clone(),
        )?);
        let worker = tokio::spawn(worker.serve(inbound));

        // ── File Server ─────────────────────────────────────────────────────

        let app = file_router(
            &layout.proc_stage(),
            &layout.store_stage(),
            &config.api_server.context_path,
        )
        .layer(TraceLayer::new_for_http());

        let addr = format!("{}:{}", config.api_server.ip, config.api_server.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .wrap_err_with(|| format!("Failed to bind {}", addr))?;
        tracing::info!(addr = %addr, advertised = %config.advertised_base(), "File server listening");

        let (server_stop, stop_rx) = oneshot::channel();
        let server = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = stop_rx.await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "File server stopped");
            }
        });

        Ok(Self {
            layout,
            config,
            transport,
            network,
            worker,
            server,
            server_stop,
        })
    }

    pub fn network(&self) -> NetworkHandle {
        self.network.handle()
    }

    /// Orchestrator over the configured backend, asking connected peers
    pub fn store_service(&self) -> Result<StoreService> {
        let object_store: Arc<dyn ObjectStore> = match self.config.store.backend {
            Backend::Local => Arc::new(LocalObjectStore::new(self.layout.objects())?),
            Backend::Ipfs => Arc::new(IpfsStore::new(&self.config.store.ipfs)?),
        };
        let catalog = SqliteCatalog::new(Database::open(Some(&self.layout.catalog_db()))?);

        let service = StoreService::new(
            StoreSettings::from_config(&self.config, &self.layout),
            object_store,
            Arc::new(catalog),
            self.transport.clone(),
            Arc::new(self.network()),
        )?;
        Ok(service)
    }

    /// Wait until every trusted peer is connected, or `timeout` passes
    ///
    /// Fails only when none of them connected.
    pub async fn wait_for_peers(&self, timeout: Duration) -> Result<()> {
        let trusted = self.config.trusted_peer_ids();
        if trusted.is_empty() {
            return Err(eyre!("no direct peers with a /p2p/ id are configured"));
        }

        let handle = self.network();
        let started = Instant::now();
        loop {
            let connected: Vec<String> = handle
                .connected_peers()
                .iter()
                .map(|p| p.to_string())
                .collect();
            let ready = trusted.iter().filter(|id| connected.contains(id)).count();

            if ready == trusted.len() {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                if ready == 0 {
                    return Err(eyre!("none of {} trusted peers connected", trusted.len()));
                }
                tracing::warn!(ready, trusted = trusted.len(), "Continuing with a subset of peers");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Stop the file server, then the network, then the worker
    pub async fn stop(self) {
        let _ = self.server_stop.send(());
        let _ = self.server.await;
        self.network.shutdown().await;
        // The worker exits once the inbound stream closes
        let _ = self.worker.await;
        tracing::info!("Node stopped");
    }
}
