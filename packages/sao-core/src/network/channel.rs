//! Peer request channels as the orchestrator sees them.
//!
//! The orchestrator never touches the swarm. It asks a [`PeerDirectory`]
//! which peers are reachable and gets a [`PeerChannel`] per peer, which may
//! be a libp2p stream or an in-process worker.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use libp2p::PeerId;
use parking_lot::RwLock;

use super::protocols::{
    FileDecryptRequest, FileDecryptResponse, FileEncryptRequest, FileEncryptResponse,
};
use super::NetworkHandle;
use crate::context::Context;
use crate::error::Result;

/// Request/response access to one worker
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Identity of the worker on the other end
    fn peer_id(&self) -> String;

    /// Ask the worker to seal a chunk
    async fn encrypt(&self, ctx: &Context, request: FileEncryptRequest)
        -> Result<FileEncryptResponse>;

    /// Ask the worker to open a chunk
    async fn decrypt(&self, ctx: &Context, request: FileDecryptRequest)
        -> Result<FileDecryptResponse>;
}

/// Lookup of reachable workers
pub trait PeerDirectory: Send + Sync {
    /// Peers currently reachable
    fn known_peers(&self) -> Vec<String>;

    /// Channel to `peer_id`, if it is reachable
    fn channel(&self, peer_id: &str) -> Option<Arc<dyn PeerChannel>>;
}

/// Channel over the libp2p request-response protocols
#[derive(Debug, Clone)]
pub struct Libp2pPeerChannel {
    network: NetworkHandle,
    peer: PeerId,
}

impl Libp2pPeerChannel {
    /// Channel to `peer` through `network`
    pub fn new(network: NetworkHandle, peer: PeerId) -> Self {
        Self { network, peer }
    }
}

#[async_trait]
impl PeerChannel for Libp2pPeerChannel {
    fn peer_id(&self) -> String {
        self.peer.to_string()
    }

    async fn encrypt(
        &self,
        ctx: &Context,
        request: FileEncryptRequest,
    ) -> Result<FileEncryptResponse> {
        ctx.run(self.network.send_encrypt(self.peer, request)).await
    }

    async fn decrypt(
        &self,
        ctx: &Context,
        request: FileDecryptRequest,
    ) -> Result<FileDecryptResponse> {
        ctx.run(self.network.send_decrypt(self.peer, request)).await
    }
}

impl PeerDirectory for NetworkHandle {
    fn known_peers(&self) -> Vec<String> {
        self.connected_peers()
            .into_iter()
            .map(|p| p.to_string())
            .collect()
    }

    fn channel(&self, peer_id: &str) -> Option<Arc<dyn PeerChannel>> {
        let peer = PeerId::from_str(peer_id).ok()?;
        Some(Arc::new(Libp2pPeerChannel::new(self.clone(), peer)))
    }
}

/// Fixed set of channels
///
/// Used when workers run in the same process, and in tests.
#[derive(Default)]
pub struct StaticDirectory {
    peers: RwLock<Vec<(String, Arc<dyn PeerChannel>)>>,
}

impl StaticDirectory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `channel` under its own peer id, replacing any previous one
    pub fn insert(&self, channel: Arc<dyn PeerChannel>) {
        let id = channel.peer_id();
        let mut peers = self.peers.write();
        peers.retain(|(known, _)| known != &id);
        peers.push((id, channel));
    }

    /// Forget `peer_id`
    pub fn remove(&self, peer_id: &str) {
        self.peers.write().retain(|(known, _)| known != peer_id);
    }
}

impl FromIterator<Arc<dyn PeerChannel>> for StaticDirectory {
    fn from_iter<I: IntoIterator<Item = Arc<dyn PeerChannel>>>(iter: I) -> Self {
        let directory = Self::new();
        for channel in iter {
            directory.insert(channel);
        }
        directory
    }
}

impl PeerDirectory for StaticDirectory {
    fn known_peers(&self) -> Vec<String> {
        self.peers.read().iter().map(|(id, _)| id.clone()).collect()
    }

    fn channel(&self, peer_id: &str) -> Option<Arc<dyn PeerChannel>> {
        self.peers
            .read()
            .iter()
            .find(|(id, _)| id == peer_id)
            .map(|(_, channel)| channel.clone())
    }
}

impl std::fmt::Debug for StaticDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticDirectory")
            .field("peers", &self.known_peers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Refusing(&'static str);

    #[async_trait]
    impl PeerChannel for Refusing {
        fn peer_id(&self) -> String {
            self.0.to_string()
        }

        async fn encrypt(
            &self,
            _ctx: &Context,
            _request: FileEncryptRequest,
        ) -> Result<FileEncryptResponse> {
            Ok(FileEncryptResponse::rejected())
        }

        async fn decrypt(
            &self,
            _ctx: &Context,
            _request: FileDecryptRequest,
        ) -> Result<FileDecryptResponse> {
            Ok(FileDecryptResponse::rejected())
        }
    }

    #[test]
    fn test_static_directory_keeps_insert_order() {
        let directory: StaticDirectory = [
            Arc::new(Refusing("b")) as Arc<dyn PeerChannel>,
            Arc::new(Refusing("a")),
        ]
        .into_iter()
        .collect();

        assert_eq!(directory.known_peers(), vec!["b", "a"]);
        assert!(directory.channel("a").is_some());
        assert!(directory.channel("c").is_none());

        directory.remove("b");
        assert_eq!(directory.known_peers(), vec!["a"]);
    }

    #[test]
    fn test_static_directory_replaces_same_id() {
        let directory = StaticDirectory::new();
        directory.insert(Arc::new(Refusing("a")));
        directory.insert(Arc::new(Refusing("a")));
        assert_eq!(directory.known_peers().len(), 1);
    }
}
