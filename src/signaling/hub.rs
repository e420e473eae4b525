//! In-process relay.
//!
//! Owns a [`RoomRegistry`] and one outbound queue per connection. Used directly
//! by tests and embedded clients, and by the relay daemon which bridges each
//! WebSocket connection onto a hub connection.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use super::registry::{ConnectionId, Outbound, RoomRegistry};
use super::{SignalingConnection, SignalingTransport};
use crate::error::SignalingError;
use crate::protocol::{ClientMessage, ServerMessage};

#[derive(Default)]
struct HubState {
    registry: RoomRegistry,
    sinks: HashMap<ConnectionId, mpsc::UnboundedSender<ServerMessage>>,
}

impl HubState {
    fn deliver(&self, outbound: Vec<Outbound>) {
        for Outbound { to, message } in outbound {
            if let Some(sink) = self.sinks.get(&to) {
                if sink.send(message).is_err() {
                    debug!("Connection {} no longer reading", to);
                }
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct RelayHub {
    state: Arc<Mutex<HubState>>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new relay connection.
    pub fn connect(&self) -> SignalingConnection {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = match self.state.lock() {
            Ok(mut state) => {
                let conn = state.registry.register();
                state.sinks.insert(conn, tx);
                conn
            }
            Err(_) => 0,
        };
        SignalingConnection {
            transport: Arc::new(HubConnection {
                hub: self.clone(),
                conn,
            }),
            events: rx,
        }
    }

    pub fn members(&self, room: &str) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.registry.members(room))
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.registry.room_count())
            .unwrap_or(0)
    }
}

struct HubConnection {
    hub: RelayHub,
    conn: ConnectionId,
}

#[async_trait]
impl SignalingTransport for HubConnection {
    async fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        let mut state = self.hub.state.lock().map_err(|_| SignalingError::Closed)?;
        if !state.sinks.contains_key(&self.conn) {
            return Err(SignalingError::Closed);
        }
        let outbound = state.registry.handle(self.conn, message);
        state.deliver(outbound);
        Ok(())
    }

    async fn close(&self) {
        if let Ok(mut state) = self.hub.state.lock() {
            let outbound = state.registry.disconnect(self.conn);
            state.sinks.remove(&self.conn);
            state.deliver(outbound);
        }
    }
}
