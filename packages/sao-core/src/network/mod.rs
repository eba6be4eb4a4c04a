//! # Network Module
//!
//! Peer-to-peer messaging between orchestrators and processing workers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      NETWORK ARCHITECTURE                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌───────────────────────────────────────────────────────────────────┐ │
//! │  │                     NetworkService                                 │ │
//! │  │                                                                    │ │
//! │  │  NetworkHandle ──commands──► event loop ──► Swarm<SaoBehaviour>   │ │
//! │  │  (cloneable)   ◄─responses──            ◄── swarm events          │ │
//! │  │                                   │                                │ │
//! │  │                                   ▼                                │ │
//! │  │                      mpsc<InboundRequest> ──► ProcNode::serve     │ │
//! │  └───────────────────────────────────────────────────────────────────┘ │
//! │                                                                         │
//! │  Transport: TCP + DNS + Noise + Yamux on tokio                        │
//! │  Protocols: identify, ping, /sao/file/encrypt, /sao/file/decrypt     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only envelopes travel over libp2p streams. Chunk bytes move out of band
//! through the descriptors carried in the envelopes.

pub mod behaviour;
pub mod channel;
pub mod codec;
mod event_loop;
pub mod identity;
pub mod protocols;

pub use behaviour::{ExchangeLimits, SaoBehaviour};
pub use channel::{Libp2pPeerChannel, PeerChannel, PeerDirectory, StaticDirectory};
pub use codec::{SaoCodec, WireFormat};
pub use identity::load_or_generate_keypair;
pub use protocols::{
    FileDecryptRequest, FileDecryptResponse, FileEncryptRequest, FileEncryptResponse, Frame,
    DECRYPT_PROTOCOL, ENCRYPT_PROTOCOL,
};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use libp2p::{
    identity::Keypair, multiaddr::Protocol, noise, request_response::ResponseChannel, tcp, yamux,
    Multiaddr, PeerId, Swarm, SwarmBuilder,
};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{Error, Result};
use event_loop::{run_event_loop, EventLoopState};

const COMMAND_CHANNEL_SIZE: usize = 256;
const INBOUND_CHANNEL_SIZE: usize = 64;

/// Network configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Addresses to listen on
    pub listen_addrs: Vec<Multiaddr>,
    /// Peers dialled at startup
    pub direct_peers: Vec<Multiaddr>,
    /// Stream limits for both exchanges
    pub limits: ExchangeLimits,
    /// How long an idle connection is kept open
    pub idle_connection_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec![],
            direct_peers: vec![],
            limits: ExchangeLimits {
                read_deadline: codec::DEFAULT_READ_DEADLINE,
                request_timeout: Duration::from_secs(300),
                max_message_size: codec::DEFAULT_MAX_MESSAGE_SIZE,
            },
            idle_connection_timeout: Duration::from_secs(60),
        }
    }
}

impl NetworkConfig {
    /// Network settings from the node configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            listen_addrs: parse_addrs(&config.libp2p.listen_addresses)?,
            direct_peers: parse_addrs(&config.libp2p.direct_peers)?,
            limits: ExchangeLimits {
                read_deadline: config.proc.read_deadline(),
                request_timeout: config.proc.write_deadline(),
                max_message_size: config.proc.max_message_size,
            },
            ..Self::default()
        })
    }
}

fn parse_addrs(addrs: &[String]) -> Result<Vec<Multiaddr>> {
    addrs
        .iter()
        .map(|a| {
            a.parse::<Multiaddr>()
                .map_err(|e| Error::Config(format!("invalid multiaddr {:?}: {}", a, e)))
        })
        .collect()
}

/// Peer id carried by the trailing `/p2p/` component of `addr`
pub fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

// ============================================================================
// COMMANDS AND INBOUND REQUESTS
// ============================================================================

/// Commands sent to the event loop
pub(crate) enum NetworkCommand {
    SendEncrypt {
        peer: PeerId,
        request: FileEncryptRequest,
        response_tx: oneshot::Sender<Result<FileEncryptResponse>>,
    },
    SendDecrypt {
        peer: PeerId,
        request: FileDecryptRequest,
        response_tx: oneshot::Sender<Result<FileDecryptResponse>>,
    },
    RespondEncrypt {
        channel: ResponseChannel<FileEncryptResponse>,
        response: FileEncryptResponse,
    },
    RespondDecrypt {
        channel: ResponseChannel<FileDecryptResponse>,
        response: FileDecryptResponse,
    },
    Dial(Multiaddr),
    AddPeerAddress {
        peer_id: PeerId,
        addr: Multiaddr,
    },
    Shutdown,
}

impl std::fmt::Debug for NetworkCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendEncrypt { peer, request, .. } => f
                .debug_struct("SendEncrypt")
                .field("peer", peer)
                .field("file_id", &request.file_id)
                .field("offset", &request.offset)
                .finish(),
            Self::SendDecrypt { peer, request, .. } => f
                .debug_struct("SendDecrypt")
                .field("peer", peer)
                .field("file_id", &request.file_id)
                .field("offset", &request.offset)
                .finish(),
            Self::RespondEncrypt { response, .. } => f
                .debug_struct("RespondEncrypt")
                .field("accepted", &response.accepted)
                .finish(),
            Self::RespondDecrypt { response, .. } => f
                .debug_struct("RespondDecrypt")
                .field("accepted", &response.accepted)
                .finish(),
            Self::Dial(addr) => f.debug_tuple("Dial").field(addr).finish(),
            Self::AddPeerAddress { peer_id, addr } => f
                .debug_struct("AddPeerAddress")
                .field("peer_id", peer_id)
                .field("addr", addr)
                .finish(),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Sends exactly one response back over an inbound stream
pub struct Responder<Resp> {
    channel: ResponseChannel<Resp>,
    command_tx: mpsc::Sender<NetworkCommand>,
    wrap: fn(ResponseChannel<Resp>, Resp) -> NetworkCommand,
}

impl<Resp> Responder<Resp> {
    /// Queue `response` on the stream the request arrived on
    pub async fn respond(self, response: Resp) -> Result<()> {
        self.command_tx
            .send((self.wrap)(self.channel, response))
            .await
            .map_err(|_| Error::Transport("network service stopped".into()))
    }
}

impl<Resp> std::fmt::Debug for Responder<Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder").finish_non_exhaustive()
    }
}

/// A request received from a remote peer
#[derive(Debug)]
pub enum InboundRequest {
    /// Seal a chunk
    Encrypt {
        /// Requesting peer
        peer: PeerId,
        /// Envelope as read off the stream
        request: Frame<FileEncryptRequest>,
        /// Reply handle
        responder: Responder<FileEncryptResponse>,
    },
    /// Open a chunk
    Decrypt {
        /// Requesting peer
        peer: PeerId,
        /// Envelope as read off the stream
        request: Frame<FileDecryptRequest>,
        /// Reply handle
        responder: Responder<FileDecryptResponse>,
    },
}

// ============================================================================
// SERVICE
// ============================================================================

/// Cloneable control surface of a running [`NetworkService`]
#[derive(Debug, Clone)]
pub struct NetworkHandle {
    peer_id: PeerId,
    command_tx: mpsc::Sender<NetworkCommand>,
    connected: Arc<RwLock<HashSet<PeerId>>>,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
}

impl NetworkHandle {
    /// Our peer id
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Peers with an open connection
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.connected.read().iter().copied().collect()
    }

    /// Addresses the swarm is listening on
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs.read().clone()
    }

    /// Send an encrypt request and wait for the answer
    pub async fn send_encrypt(
        &self,
        peer: PeerId,
        request: FileEncryptRequest,
    ) -> Result<FileEncryptResponse> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(NetworkCommand::SendEncrypt {
            peer,
            request,
            response_tx,
        })
        .await?;
        response_rx
            .await
            .map_err(|_| Error::Transport("network service stopped".into()))?
    }

    /// Send a decrypt request and wait for the answer
    pub async fn send_decrypt(
        &self,
        peer: PeerId,
        request: FileDecryptRequest,
    ) -> Result<FileDecryptResponse> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(NetworkCommand::SendDecrypt {
            peer,
            request,
            response_tx,
        })
        .await?;
        response_rx
            .await
            .map_err(|_| Error::Transport("network service stopped".into()))?
    }

    /// Dial `addr`
    pub async fn dial(&self, addr: Multiaddr) -> Result<()> {
        self.send(NetworkCommand::Dial(addr)).await
    }

    /// Remember an address for `peer_id`
    pub async fn add_peer_address(&self, peer_id: PeerId, addr: Multiaddr) -> Result<()> {
        self.send(NetworkCommand::AddPeerAddress { peer_id, addr })
            .await
    }

    async fn send(&self, command: NetworkCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| Error::Transport("network service stopped".into()))
    }
}

/// Running libp2p node
pub struct NetworkService {
    handle: NetworkHandle,
    event_loop: JoinHandle<()>,
}

impl NetworkService {
    /// Build the swarm, start listening, dial the direct peers and spawn the
    /// event loop
    ///
    /// Returns the service and the stream of inbound requests. Must be
    /// called from within a tokio runtime.
    pub fn start(
        keypair: Keypair,
        config: NetworkConfig,
    ) -> Result<(Self, mpsc::Receiver<InboundRequest>)> {
        let peer_id = PeerId::from(keypair.public());
        let mut swarm = Self::build_swarm(keypair, &config)?;

        for addr in &config.listen_addrs {
            swarm
                .listen_on(addr.clone())
                .map_err(|e| Error::Transport(format!("Failed to listen on {}: {}", addr, e)))?;
        }

        for addr in &config.direct_peers {
            match peer_id_of(addr) {
                Some(peer) => {
                    swarm.add_peer_address(peer, addr.clone());
                }
                None => tracing::warn!(addr = %addr, "Direct peer has no /p2p/ component"),
            }
            if let Err(e) = swarm.dial(addr.clone()) {
                tracing::warn!(addr = %addr, error = %e, "Failed to dial direct peer");
            }
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);

        let handle = NetworkHandle {
            peer_id,
            command_tx: command_tx.clone(),
            connected: Arc::new(RwLock::new(HashSet::new())),
            listen_addrs: Arc::new(RwLock::new(vec![])),
        };

        let state = EventLoopState::new(
            handle.connected.clone(),
            handle.listen_addrs.clone(),
            inbound_tx,
            command_tx,
        );
        let event_loop = tokio::spawn(run_event_loop(swarm, command_rx, state));

        tracing::info!(peer_id = %peer_id, "Network service started");
        Ok((Self { handle, event_loop }, inbound_rx))
    }

    /// Control handle
    pub fn handle(&self) -> NetworkHandle {
        self.handle.clone()
    }

    /// Stop the event loop and wait for it to exit
    pub async fn shutdown(self) {
        let _ = self.handle.command_tx.send(NetworkCommand::Shutdown).await;
        let _ = self.event_loop.await;
    }

    fn build_swarm(keypair: Keypair, config: &NetworkConfig) -> Result<Swarm<SaoBehaviour>> {
        let public_key = keypair.public();
        let limits = config.limits;
        let idle = config.idle_connection_timeout;

        let swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| Error::Transport(format!("Failed to configure TCP: {}", e)))?
            .with_dns()
            .map_err(|e| Error::Transport(format!("Failed to configure DNS: {}", e)))?
            .with_behaviour(|_key| Ok(SaoBehaviour::new(public_key.clone(), limits)))
            .map_err(|e| Error::Protocol(format!("Failed to create behaviour: {}", e)))?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(idle))
            .build();

        Ok(swarm)
    }
}
