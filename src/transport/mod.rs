//! Peer transport primitive.
//!
//! A transport hands out a self identity when opened and then dials or accepts
//! ordered, reliable channels to other peers. Two channels per peer are used:
//! [`ChannelKind::Meta`] for control messages and [`ChannelKind::Data`] for
//! file bytes. Everything that happens on a channel after it is created is
//! reported on the transport's event stream.

pub mod memory;
pub mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;

use crate::error::TransportError;

/// Channel role, also used as the label exchanged when a channel is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Meta,
    Data,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 2] = [ChannelKind::Meta, ChannelKind::Data];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Meta => "meta",
            ChannelKind::Data => "data",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
    Errored,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Connecting,
            1 => ChannelState::Open,
            2 => ChannelState::Closed,
            _ => ChannelState::Errored,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ChannelState::Connecting => 0,
            ChannelState::Open => 1,
            ChannelState::Closed => 2,
            ChannelState::Errored => 3,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, ChannelState::Connecting | ChannelState::Open)
    }
}

/// One message on a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-unique channel id, used to tell a replaced channel's late events
/// apart from the current one's.
pub type ChannelId = u64;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_channel_id() -> ChannelId {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Lock-free channel state shared between a channel handle and its I/O tasks.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: ChannelState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    pub(crate) fn get(&self) -> ChannelState {
        ChannelState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ChannelState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }

    /// Move a live channel to `terminal`. Returns false when it was already
    /// closed or errored, so close notifications fire once.
    pub(crate) fn finish(&self, terminal: ChannelState) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if !ChannelState::from_u8(current).is_live() {
                return false;
            }
            match self.0.compare_exchange(
                current,
                terminal.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

/// An ordered, reliable message channel to one remote peer.
#[async_trait]
pub trait PeerChannel: Send + Sync + fmt::Debug {
    fn id(&self) -> ChannelId;

    /// Remote peer id
    fn peer_id(&self) -> &str;

    fn kind(&self) -> ChannelKind;

    /// Peer id of the side that dialed this channel
    fn dialer(&self) -> &str;

    fn state(&self) -> ChannelState;

    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Close the channel. Idempotent.
    async fn close(&self);
}

pub type ChannelHandle = Arc<dyn PeerChannel>;

/// Everything a transport reports after [`PeerTransport::open`].
#[derive(Debug)]
pub enum TransportEvent {
    /// A remote peer dialed us
    Incoming(ChannelHandle),
    Opened {
        channel: ChannelId,
        peer_id: String,
        kind: ChannelKind,
    },
    Message {
        channel: ChannelId,
        peer_id: String,
        kind: ChannelKind,
        frame: Frame,
    },
    Closed {
        channel: ChannelId,
        peer_id: String,
        kind: ChannelKind,
    },
    Error {
        peer_id: Option<String>,
        error: TransportError,
    },
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Result of opening a transport: our id plus the event stream.
#[derive(Debug)]
pub struct TransportSession {
    pub self_id: String,
    pub events: TransportEvents,
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Acquire a self identity and start accepting channels.
    async fn open(&self) -> Result<TransportSession, TransportError>;

    /// Dial a channel of the given kind to a peer.
    async fn connect(
        &self,
        peer_id: &str,
        kind: ChannelKind,
    ) -> Result<ChannelHandle, TransportError>;

    /// Release the identity and close every channel.
    async fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_kind_labels() {
        assert_eq!(ChannelKind::Meta.to_string(), "meta");
        assert_eq!(serde_json::to_string(&ChannelKind::Data).unwrap(), "\"data\"");
    }

    #[test]
    fn test_state_cell_finishes_once() {
        let cell = StateCell::new(ChannelState::Connecting);
        cell.set(ChannelState::Open);
        assert_eq!(cell.get(), ChannelState::Open);
        assert!(cell.finish(ChannelState::Closed));
        assert!(!cell.finish(ChannelState::Errored));
        assert_eq!(cell.get(), ChannelState::Closed);
    }
}
