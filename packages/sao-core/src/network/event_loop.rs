//! # Network Event Loop
//!
//! Drives the swarm.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        EVENT LOOP                                       │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  NetworkHandle ──► command_rx ──┐                                      │
//! │                                  │   tokio::select! {                   │
//! │                                  ├──►  command = rx.recv()              │
//! │  swarm.select_next_some() ──────┘      event = swarm.next()            │
//! │                                      }                                  │
//! │                                                                         │
//! │  outbound: request id ──► pending oneshot, resolved on                 │
//! │            Response or OutboundFailure                                 │
//! │  inbound:  Request ──► inbound_tx ──► ProcNode, answered through       │
//! │            Responder ──► RespondEncrypt / RespondDecrypt command       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use libp2p::{
    identify,
    request_response::{self, OutboundRequestId, ResponseChannel},
    swarm::SwarmEvent,
    Multiaddr, PeerId, Swarm,
};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use super::behaviour::{SaoBehaviour, SaoBehaviourEvent};
use super::protocols::{FileDecryptResponse, FileEncryptResponse, Frame};
use super::{InboundRequest, NetworkCommand, Responder};
use crate::error::{Error, Result};

type Pending<Resp> = HashMap<OutboundRequestId, oneshot::Sender<Result<Resp>>>;

/// Shared state for the event loop
pub(crate) struct EventLoopState {
    connected: Arc<RwLock<HashSet<PeerId>>>,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    inbound_tx: mpsc::Sender<InboundRequest>,
    command_tx: mpsc::Sender<NetworkCommand>,
    pending_encrypt: Pending<FileEncryptResponse>,
    pending_decrypt: Pending<FileDecryptResponse>,
}

impl EventLoopState {
    pub(crate) fn new(
        connected: Arc<RwLock<HashSet<PeerId>>>,
        listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
        inbound_tx: mpsc::Sender<InboundRequest>,
        command_tx: mpsc::Sender<NetworkCommand>,
    ) -> Self {
        Self {
            connected,
            listen_addrs,
            inbound_tx,
            command_tx,
            pending_encrypt: HashMap::new(),
            pending_decrypt: HashMap::new(),
        }
    }
}

/// Run until a shutdown command arrives or every handle is dropped
pub(crate) async fn run_event_loop(
    mut swarm: Swarm<SaoBehaviour>,
    mut command_rx: mpsc::Receiver<NetworkCommand>,
    mut state: EventLoopState,
) {
    tracing::info!("Network event loop starting");

    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                Some(NetworkCommand::Shutdown) => {
                    tracing::info!("Shutdown command received, exiting event loop");
                    break;
                }
                Some(command) => handle_command(command, &mut swarm, &mut state),
                None => {
                    tracing::info!("Command channel closed, exiting event loop");
                    break;
                }
            },
            event = swarm.select_next_some() => {
                handle_swarm_event(event, &mut swarm, &mut state);
            }
        }
    }

    // Anyone still waiting learns the service is gone.
    state.pending_encrypt.clear();
    state.pending_decrypt.clear();
    tracing::info!("Network event loop stopped");
}

fn handle_command(
    command: NetworkCommand,
    swarm: &mut Swarm<SaoBehaviour>,
    state: &mut EventLoopState,
) {
    match command {
        NetworkCommand::SendEncrypt {
            peer,
            request,
            response_tx,
        } => {
            tracing::debug!(peer = %peer, file_id = %request.file_id, offset = request.offset, "Sending encrypt request");
            let id = swarm
                .behaviour_mut()
                .encrypt
                .send_request(&peer, Frame::Valid(request));
            state.pending_encrypt.insert(id, response_tx);
        }
        NetworkCommand::SendDecrypt {
            peer,
            request,
            response_tx,
        } => {
            tracing::debug!(peer = %peer, file_id = %request.file_id, offset = request.offset, "Sending decrypt request");
            let id = swarm
                .behaviour_mut()
                .decrypt
                .send_request(&peer, Frame::Valid(request));
            state.pending_decrypt.insert(id, response_tx);
        }
        NetworkCommand::RespondEncrypt { channel, response } => {
            if swarm
                .behaviour_mut()
                .encrypt
                .send_response(channel, response)
                .is_err()
            {
                tracing::debug!("Encrypt response dropped, stream already closed");
            }
        }
        NetworkCommand::RespondDecrypt { channel, response } => {
            if swarm
                .behaviour_mut()
                .decrypt
                .send_response(channel, response)
                .is_err()
            {
                tracing::debug!("Decrypt response dropped, stream already closed");
            }
        }
        NetworkCommand::Dial(addr) => {
            if let Err(e) = swarm.dial(addr.clone()) {
                tracing::warn!(addr = %addr, error = %e, "Dial failed");
            }
        }
        NetworkCommand::AddPeerAddress { peer_id, addr } => {
            swarm.add_peer_address(peer_id, addr);
        }
        NetworkCommand::Shutdown => {}
    }
}

fn handle_swarm_event(
    event: SwarmEvent<SaoBehaviourEvent>,
    swarm: &mut Swarm<SaoBehaviour>,
    state: &mut EventLoopState,
) {
    match event {
        SwarmEvent::NewListenAddr { address, .. } => {
            tracing::info!(address = %address, "Listening");
            state.listen_addrs.write().push(address);
        }
        SwarmEvent::ExpiredListenAddr { address, .. } => {
            state.listen_addrs.write().retain(|a| a != &address);
        }
        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            tracing::debug!(peer = %peer_id, "Connection established");
            state.connected.write().insert(peer_id);
        }
        SwarmEvent::ConnectionClosed {
            peer_id,
            num_established,
            ..
        } => {
            if num_established == 0 {
                tracing::debug!(peer = %peer_id, "Peer disconnected");
                state.connected.write().remove(&peer_id);
            }
        }
        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
            tracing::warn!(peer = ?peer_id, error = %error, "Outgoing connection failed");
        }
        SwarmEvent::Behaviour(SaoBehaviourEvent::Identify(identify::Event::Received {
            peer_id,
            info,
            ..
        })) => {
            for addr in info.listen_addrs {
                swarm.add_peer_address(peer_id, addr);
            }
        }
        SwarmEvent::Behaviour(SaoBehaviourEvent::Encrypt(event)) => {
            if let Some((peer, request, channel)) =
                on_exchange_event("encrypt", event, &mut state.pending_encrypt)
            {
                let responder = Responder {
                    channel,
                    command_tx: state.command_tx.clone(),
                    wrap: |channel, response| NetworkCommand::RespondEncrypt { channel, response },
                };
                deliver(
                    state,
                    InboundRequest::Encrypt {
                        peer,
                        request,
                        responder,
                    },
                );
            }
        }
        SwarmEvent::Behaviour(SaoBehaviourEvent::Decrypt(event)) => {
            if let Some((peer, request, channel)) =
                on_exchange_event("decrypt", event, &mut state.pending_decrypt)
            {
                let responder = Responder {
                    channel,
                    command_tx: state.command_tx.clone(),
                    wrap: |channel, response| NetworkCommand::RespondDecrypt { channel, response },
                };
                deliver(
                    state,
                    InboundRequest::Decrypt {
                        peer,
                        request,
                        responder,
                    },
                );
            }
        }
        _ => {}
    }
}

/// Dropping the request closes its stream, which the sender sees as a
/// failed exchange.
fn deliver(state: &EventLoopState, request: InboundRequest) {
    match state.inbound_tx.try_send(request) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!("Inbound request queue full, dropping request");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::debug!("No inbound request consumer, dropping request");
        }
    }
}

/// Resolve outbound exchanges; hand back inbound requests
fn on_exchange_event<Req, Resp>(
    protocol: &str,
    event: request_response::Event<Frame<Req>, Resp>,
    pending: &mut Pending<Resp>,
) -> Option<(PeerId, Frame<Req>, ResponseChannel<Resp>)> {
    match event {
        request_response::Event::Message { peer, message, .. } => match message {
            request_response::Message::Request {
                request, channel, ..
            } => {
                tracing::debug!(peer = %peer, protocol, "Inbound request");
                Some((peer, request, channel))
            }
            request_response::Message::Response {
                request_id,
                response,
            } => {
                if let Some(tx) = pending.remove(&request_id) {
                    let _ = tx.send(Ok(response));
                }
                None
            }
        },
        request_response::Event::OutboundFailure {
            peer,
            request_id,
            error,
            ..
        } => {
            tracing::warn!(peer = %peer, protocol, error = %error, "Outbound request failed");
            if let Some(tx) = pending.remove(&request_id) {
                let error = match error {
                    request_response::OutboundFailure::Timeout => {
                        Error::Timeout(format!("{} request to {}", protocol, peer))
                    }
                    other => Error::Protocol(format!("{} request to {}: {}", protocol, peer, other)),
                };
                let _ = tx.send(Err(error));
            }
            None
        }
        request_response::Event::InboundFailure { peer, error, .. } => {
            tracing::warn!(peer = %peer, protocol, error = %error, "Inbound request failed");
            None
        }
        request_response::Event::ResponseSent { peer, .. } => {
            tracing::debug!(peer = %peer, protocol, "Response sent");
            None
        }
    }
}
