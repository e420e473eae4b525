//! In-process transport. Every [`MemoryTransport`] created from the same
//! [`MemoryNetwork`] can reach the others by peer id.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    next_channel_id, ChannelHandle, ChannelId, ChannelKind, ChannelState, Frame, PeerChannel,
    PeerTransport, StateCell, TransportEvent, TransportSession,
};
use crate::error::TransportError;

#[derive(Default)]
struct NetworkInner {
    endpoints: HashMap<String, mpsc::UnboundedSender<TransportEvent>>,
    channels: HashMap<String, Vec<Arc<MemoryChannel>>>,
}

/// Shared switchboard for in-process peers.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            self_id: Mutex::new(None),
            fail_open: false,
        }
    }

    /// A transport whose identity never becomes available.
    pub fn unavailable_transport(&self) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            self_id: Mutex::new(None),
            fail_open: true,
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.endpoints.len()).unwrap_or(0)
    }

    fn register(&self, id: &str, events: mpsc::UnboundedSender<TransportEvent>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.endpoints.insert(id.to_string(), events);
        }
    }

    fn unregister(&self, id: &str) -> Vec<Arc<MemoryChannel>> {
        match self.inner.lock() {
            Ok(mut inner) => {
                inner.endpoints.remove(id);
                inner.channels.remove(id).unwrap_or_default()
            }
            Err(_) => Vec::new(),
        }
    }

    fn endpoint(&self, id: &str) -> Option<mpsc::UnboundedSender<TransportEvent>> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.endpoints.get(id).cloned())
    }

    fn track(&self, owner: &str, channel: Arc<MemoryChannel>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner
                .channels
                .entry(owner.to_string())
                .or_default()
                .push(channel);
        }
    }
}

#[derive(Debug)]
struct ChannelEnd {
    id: ChannelId,
    owner: String,
    events: mpsc::UnboundedSender<TransportEvent>,
}

/// One side of an in-process channel pair. Both sides share a state cell.
#[derive(Debug)]
pub struct MemoryChannel {
    local: ChannelEnd,
    remote: ChannelEnd,
    kind: ChannelKind,
    dialer: String,
    state: Arc<StateCell>,
}

#[async_trait]
impl PeerChannel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.local.id
    }

    fn peer_id(&self) -> &str {
        &self.remote.owner
    }

    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn dialer(&self) -> &str {
        &self.dialer
    }

    fn state(&self) -> ChannelState {
        self.state.get()
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.state.get() != ChannelState::Open {
            return Err(TransportError::ChannelClosed {
                peer_id: self.remote.owner.clone(),
            });
        }
        self.remote
            .events
            .send(TransportEvent::Message {
                channel: self.remote.id,
                peer_id: self.local.owner.clone(),
                kind: self.kind,
                frame,
            })
            .map_err(|_| TransportError::SendFailed {
                message: format!("peer {} is gone", self.remote.owner),
            })
    }

    async fn close(&self) {
        if !self.state.finish(ChannelState::Closed) {
            return;
        }
        let _ = self.local.events.send(TransportEvent::Closed {
            channel: self.local.id,
            peer_id: self.remote.owner.clone(),
            kind: self.kind,
        });
        let _ = self.remote.events.send(TransportEvent::Closed {
            channel: self.remote.id,
            peer_id: self.local.owner.clone(),
            kind: self.kind,
        });
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    self_id: Mutex<Option<(String, mpsc::UnboundedSender<TransportEvent>)>>,
    fail_open: bool,
}

impl MemoryTransport {
    fn current(&self) -> Option<(String, mpsc::UnboundedSender<TransportEvent>)> {
        self.self_id.lock().ok().and_then(|guard| guard.clone())
    }

    fn take_current(&self) -> Option<String> {
        self.self_id
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .map(|(id, _)| id)
    }

    async fn release(&self) {
        if let Some(id) = self.take_current() {
            let channels = self.network.unregister(&id);
            debug!("Releasing memory endpoint {} ({} channels)", id, channels.len());
            for channel in channels {
                channel.close().await;
            }
        }
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn open(&self) -> Result<TransportSession, TransportError> {
        if self.fail_open {
            return Err(TransportError::IdentityUnavailable {
                message: "memory endpoint configured to fail".to_string(),
            });
        }
        self.release().await;

        let self_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.network.register(&self_id, tx.clone());
        if let Ok(mut guard) = self.self_id.lock() {
            *guard = Some((self_id.clone(), tx));
        }
        info!("Memory endpoint opened: {}", self_id);

        Ok(TransportSession {
            self_id,
            events: rx,
        })
    }

    async fn connect(
        &self,
        peer_id: &str,
        kind: ChannelKind,
    ) -> Result<ChannelHandle, TransportError> {
        let (self_id, local_events) = self.current().ok_or(TransportError::Shutdown)?;
        let remote_events =
            self.network
                .endpoint(peer_id)
                .ok_or_else(|| TransportError::ConnectFailed {
                    peer_id: peer_id.to_string(),
                    message: "no such endpoint".to_string(),
                })?;

        let state = Arc::new(StateCell::new(ChannelState::Connecting));
        let local_id = next_channel_id();
        let remote_id = next_channel_id();

        let outbound = Arc::new(MemoryChannel {
            local: ChannelEnd {
                id: local_id,
                owner: self_id.clone(),
                events: local_events.clone(),
            },
            remote: ChannelEnd {
                id: remote_id,
                owner: peer_id.to_string(),
                events: remote_events.clone(),
            },
            kind,
            dialer: self_id.clone(),
            state: state.clone(),
        });
        let inbound = Arc::new(MemoryChannel {
            local: ChannelEnd {
                id: remote_id,
                owner: peer_id.to_string(),
                events: remote_events.clone(),
            },
            remote: ChannelEnd {
                id: local_id,
                owner: self_id.clone(),
                events: local_events.clone(),
            },
            kind,
            dialer: self_id.clone(),
            state: state.clone(),
        });

        self.network.track(&self_id, outbound.clone());
        self.network.track(peer_id, inbound.clone());

        state.set(ChannelState::Open);
        let delivered = remote_events
            .send(TransportEvent::Incoming(inbound))
            .and_then(|_| {
                remote_events.send(TransportEvent::Opened {
                    channel: remote_id,
                    peer_id: self_id.clone(),
                    kind,
                })
            });
        if delivered.is_err() {
            state.set(ChannelState::Errored);
            return Err(TransportError::ConnectFailed {
                peer_id: peer_id.to_string(),
                message: "endpoint stopped listening".to_string(),
            });
        }
        let _ = local_events.send(TransportEvent::Opened {
            channel: local_id,
            peer_id: peer_id.to_string(),
            kind,
        });

        debug!("Memory {} channel {} -> {}", kind, self_id, peer_id);
        Ok(outbound)
    }

    async fn shutdown(&self) {
        self.release().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_pair_delivers_in_order() {
        let network = MemoryNetwork::new();
        let a = network.transport();
        let b = network.transport();
        let sa = a.open().await.unwrap();
        let mut sb = b.open().await.unwrap();

        let channel = a.connect(&sb.self_id, ChannelKind::Meta).await.unwrap();
        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(channel.dialer(), sa.self_id);

        let incoming = match sb.events.recv().await.unwrap() {
            TransportEvent::Incoming(ch) => ch,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(incoming.peer_id(), sa.self_id);
        assert_eq!(incoming.dialer(), sa.self_id);
        assert!(matches!(
            sb.events.recv().await.unwrap(),
            TransportEvent::Opened { kind: ChannelKind::Meta, .. }
        ));

        for i in 0..3 {
            channel.send(Frame::Text(i.to_string())).await.unwrap();
        }
        for i in 0..3 {
            match sb.events.recv().await.unwrap() {
                TransportEvent::Message { frame, channel, .. } => {
                    assert_eq!(channel, incoming.id());
                    assert_eq!(frame, Frame::Text(i.to_string()));
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_close_notifies_both_sides_once() {
        let network = MemoryNetwork::new();
        let a = network.transport();
        let b = network.transport();
        let mut sa = a.open().await.unwrap();
        let mut sb = b.open().await.unwrap();

        let channel = a.connect(&sb.self_id, ChannelKind::Data).await.unwrap();
        channel.close().await;
        channel.close().await;
        assert!(channel.send(Frame::Text("x".into())).await.is_err());

        // opened, closed
        assert!(matches!(sa.events.recv().await, Some(TransportEvent::Opened { .. })));
        assert!(matches!(sa.events.recv().await, Some(TransportEvent::Closed { .. })));
        assert!(sa.events.try_recv().is_err());

        // incoming, opened, closed
        for _ in 0..2 {
            sb.events.recv().await.unwrap();
        }
        assert!(matches!(sb.events.recv().await, Some(TransportEvent::Closed { .. })));
    }

    #[tokio::test]
    async fn test_unavailable_identity_and_unknown_peer() {
        let network = MemoryNetwork::new();
        assert!(matches!(
            network.unavailable_transport().open().await,
            Err(TransportError::IdentityUnavailable { .. })
        ));

        let a = network.transport();
        assert_eq!(
            a.connect("nobody", ChannelKind::Meta).await.unwrap_err(),
            TransportError::Shutdown
        );
        a.open().await.unwrap();
        assert!(matches!(
            a.connect("nobody", ChannelKind::Meta).await,
            Err(TransportError::ConnectFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_channels() {
        let network = MemoryNetwork::new();
        let a = network.transport();
        let b = network.transport();
        a.open().await.unwrap();
        let sb = b.open().await.unwrap();
        let channel = a.connect(&sb.self_id, ChannelKind::Meta).await.unwrap();

        b.shutdown().await;
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(network.endpoint_count(), 1);
    }
}
