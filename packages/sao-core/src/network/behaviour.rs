//! # Network Behaviour
//!
//! Combined libp2p behaviour for a storage node.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SAO BEHAVIOUR                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐   │
//! │  │  Identify   │  │    Ping     │  │   Encrypt   │  │   Decrypt   │   │
//! │  │             │  │             │  │  req/resp   │  │  req/resp   │   │
//! │  │ Exchange    │  │ Keepalive   │  │             │  │             │   │
//! │  │ peer info   │  │ detection   │  │ seal chunk  │  │ open chunk  │   │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each exchange gets its own request-response behaviour so the protocol id
//! on the stream always matches the envelope type inside it.

use std::time::Duration;

use libp2p::{
    identify, ping,
    request_response::{self, ProtocolSupport},
    swarm::NetworkBehaviour,
    StreamProtocol,
};

use super::codec::{SaoCodec, WireFormat};
use super::protocols::{
    FileDecryptRequest, FileDecryptResponse, FileEncryptRequest, FileEncryptResponse,
    DECRYPT_PROTOCOL, ENCRYPT_PROTOCOL,
};

/// Protocol version for identification
pub const PROTOCOL_VERSION: &str = "/sao/1.0.0";

/// Agent version for identification
pub const AGENT_VERSION: &str = concat!("sao-core/", env!("CARGO_PKG_VERSION"));

/// Codec of the encrypt exchange
pub type EncryptCodec = SaoCodec<FileEncryptRequest, FileEncryptResponse>;

/// Codec of the decrypt exchange
pub type DecryptCodec = SaoCodec<FileDecryptRequest, FileDecryptResponse>;

/// Limits applied to both exchanges
#[derive(Debug, Clone, Copy)]
pub struct ExchangeLimits {
    /// Time allowed to read an inbound request
    pub read_deadline: Duration,
    /// Time allowed for an outbound request to be answered
    pub request_timeout: Duration,
    /// Largest envelope accepted
    pub max_message_size: usize,
}

/// Combined behaviour for a storage node
#[derive(NetworkBehaviour)]
pub struct SaoBehaviour {
    /// Identify protocol - exchanges listen addresses on connect
    pub identify: identify::Behaviour,

    /// Ping protocol - keepalive
    pub ping: ping::Behaviour,

    /// `/sao/file/encrypt/0.0.1`
    pub encrypt: request_response::Behaviour<EncryptCodec>,

    /// `/sao/file/decrypt/0.0.1`
    pub decrypt: request_response::Behaviour<DecryptCodec>,
}

impl SaoBehaviour {
    /// Create the behaviour for a node with `local_public_key`
    pub fn new(local_public_key: libp2p::identity::PublicKey, limits: ExchangeLimits) -> Self {
        let identify_config = identify::Config::new(PROTOCOL_VERSION.to_string(), local_public_key)
            .with_agent_version(AGENT_VERSION.to_string())
            .with_interval(Duration::from_secs(60));
        let identify = identify::Behaviour::new(identify_config);

        let ping_config = ping::Config::new()
            .with_interval(Duration::from_secs(30))
            .with_timeout(Duration::from_secs(20));
        let ping = ping::Behaviour::new(ping_config);

        let rr_config =
            request_response::Config::default().with_request_timeout(limits.request_timeout);

        let encrypt = request_response::Behaviour::with_codec(
            EncryptCodec::new(
                WireFormat::Json,
                limits.max_message_size,
                limits.read_deadline,
            ),
            [(StreamProtocol::new(ENCRYPT_PROTOCOL), ProtocolSupport::Full)],
            rr_config.clone(),
        );
        let decrypt = request_response::Behaviour::with_codec(
            DecryptCodec::new(
                WireFormat::Json,
                limits.max_message_size,
                limits.read_deadline,
            ),
            [(StreamProtocol::new(DECRYPT_PROTOCOL), ProtocolSupport::Full)],
            rr_config,
        );

        Self {
            identify,
            ping,
            encrypt,
            decrypt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;

    #[test]
    fn test_protocol_version() {
        assert!(PROTOCOL_VERSION.starts_with("/sao/"));
        assert!(AGENT_VERSION.starts_with("sao-core/"));
    }

    #[test]
    fn test_behaviour_creation() {
        let keypair = Keypair::generate_ed25519();
        let limits = ExchangeLimits {
            read_deadline: Duration::from_secs(10),
            request_timeout: Duration::from_secs(300),
            max_message_size: 1024 * 1024,
        };
        let _behaviour = SaoBehaviour::new(keypair.public(), limits);
    }
}
