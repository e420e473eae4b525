//! Room signaling.
//!
//! Clients talk to a relay that tracks room membership. The relay side lives
//! in [`registry`]; [`hub`] wires the registry to in-process connections and
//! [`server`] exposes a hub over WebSocket. [`ws`] is the matching client.

pub mod hub;
pub mod registry;
pub mod server;
pub mod ws;

pub use hub::RelayHub;
pub use registry::{ConnectionId, Outbound, RoomRegistry};
pub use ws::WsSignaling;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::SignalingError;
use crate::protocol::{ClientMessage, ServerMessage};

/// Outgoing half of a relay connection.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, message: ClientMessage) -> Result<(), SignalingError>;

    /// Disconnect from the relay. The relay treats this as leaving every room.
    async fn close(&self);
}

/// A live relay connection: the sender plus the stream of relay messages.
pub struct SignalingConnection {
    pub transport: Arc<dyn SignalingTransport>,
    pub events: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Thin request helpers over a [`SignalingTransport`].
#[derive(Clone)]
pub struct SignalingClient {
    transport: Arc<dyn SignalingTransport>,
}

impl SignalingClient {
    pub fn new(transport: Arc<dyn SignalingTransport>) -> Self {
        Self { transport }
    }

    pub async fn join(&self, room: &str, peer_id: &str) -> Result<(), SignalingError> {
        self.transport
            .send(ClientMessage::Join {
                room: room.to_string(),
                peer_id: peer_id.to_string(),
            })
            .await
    }

    pub async fn leave(&self, room: &str) -> Result<(), SignalingError> {
        self.transport
            .send(ClientMessage::Leave {
                room: room.to_string(),
            })
            .await
    }

    pub async fn list_peers(&self) -> Result<(), SignalingError> {
        self.transport.send(ClientMessage::ListPeers).await
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}
