//! Peer link manager.
//!
//! Keeps at most one meta and one data channel per remote peer. When both
//! sides dial each other at the same time, the channel dialed by the peer with
//! the lexicographically smaller id wins and the other is closed; a channel
//! dialed again by the same side replaces the previous one.

use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::error::{SessionError, TransportError};
use crate::protocol::{DataMessage, FrameError, MetaMessage};
use crate::transport::{
    ChannelHandle, ChannelId, ChannelKind, ChannelState, Frame, PeerTransport,
};

#[derive(Debug, Default)]
struct PeerLink {
    meta: Option<ChannelHandle>,
    data: Option<ChannelHandle>,
}

impl PeerLink {
    fn slot(&self, kind: ChannelKind) -> &Option<ChannelHandle> {
        match kind {
            ChannelKind::Meta => &self.meta,
            ChannelKind::Data => &self.data,
        }
    }

    fn slot_mut(&mut self, kind: ChannelKind) -> &mut Option<ChannelHandle> {
        match kind {
            ChannelKind::Meta => &mut self.meta,
            ChannelKind::Data => &mut self.data,
        }
    }

    fn is_empty(&self) -> bool {
        self.meta.is_none() && self.data.is_none()
    }

    fn drain(&mut self) -> Vec<ChannelHandle> {
        self.meta.take().into_iter().chain(self.data.take()).collect()
    }
}

/// A decoded frame, tagged with the channel it arrived on.
#[derive(Debug)]
pub enum Inbound {
    Meta(MetaMessage),
    Data(DataMessage),
}

/// Decode a frame according to the kind of channel it arrived on.
pub fn decode_frame(kind: ChannelKind, frame: &Frame) -> Result<Inbound, FrameError> {
    match kind {
        ChannelKind::Meta => MetaMessage::decode(frame).map(Inbound::Meta),
        ChannelKind::Data => DataMessage::decode(frame).map(Inbound::Data),
    }
}

#[derive(Debug)]
pub struct LinkManager {
    self_id: String,
    links: HashMap<String, PeerLink>,
}

impl LinkManager {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            links: HashMap::new(),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Dial meta and data channels to a peer and register them.
    ///
    /// Both dials are attempted; the first failure is returned.
    pub async fn open_link(
        &mut self,
        transport: &dyn PeerTransport,
        peer_id: &str,
    ) -> Result<(), TransportError> {
        let mut first_error = None;
        for kind in ChannelKind::ALL {
            match transport.connect(peer_id, kind).await {
                Ok(channel) => {
                    if let Some(loser) = self.register(channel) {
                        loser.close().await;
                    }
                }
                Err(e) => {
                    warn!("Failed to open {} channel to {}: {}", kind, peer_id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Store a channel in its peer's slot.
    ///
    /// Returns the channel that lost a conflict, which the caller must close.
    /// A dead channel in the slot is simply replaced.
    pub fn register(&mut self, channel: ChannelHandle) -> Option<ChannelHandle> {
        let peer_id = channel.peer_id().to_string();
        let kind = channel.kind();
        let link = self.links.entry(peer_id.clone()).or_default();
        let slot = link.slot_mut(kind);

        let Some(existing) = slot.as_ref() else {
            debug!("Registered {} channel for {}", kind, peer_id);
            *slot = Some(channel);
            return None;
        };
        if existing.id() == channel.id() {
            return None;
        }
        if !existing.state().is_live() {
            *slot = Some(channel);
            return None;
        }

        let keep_new = if existing.dialer() == channel.dialer() {
            true
        } else {
            channel.dialer() < existing.dialer()
        };
        info!(
            "Duplicate {} channel with {}: keeping the one dialed by {}",
            kind,
            peer_id,
            if keep_new { channel.dialer() } else { existing.dialer() }
        );
        if keep_new {
            slot.replace(channel)
        } else {
            Some(channel)
        }
    }

    /// True when `channel` is the registered channel for `(peer_id, kind)`.
    pub fn is_current(&self, channel: ChannelId, peer_id: &str, kind: ChannelKind) -> bool {
        self.links
            .get(peer_id)
            .and_then(|link| link.slot(kind).as_ref())
            .map(|c| c.id() == channel)
            .unwrap_or(false)
    }

    /// The open channel of `kind` to `peer_id`.
    pub fn get_channel(
        &self,
        peer_id: &str,
        kind: ChannelKind,
    ) -> Result<ChannelHandle, SessionError> {
        self.links
            .get(peer_id)
            .and_then(|link| link.slot(kind).clone())
            .filter(|c| c.state() == ChannelState::Open)
            .ok_or_else(|| SessionError::NotConnected {
                peer_id: peer_id.to_string(),
                kind,
            })
    }

    /// Forget a channel the transport reported closed. Returns true when it
    /// was the registered one.
    pub fn channel_closed(&mut self, channel: ChannelId, peer_id: &str, kind: ChannelKind) -> bool {
        let Some(link) = self.links.get_mut(peer_id) else {
            return false;
        };
        let slot = link.slot_mut(kind);
        if slot.as_ref().map(|c| c.id()) != Some(channel) {
            return false;
        }
        *slot = None;
        if link.is_empty() {
            self.links.remove(peer_id);
        }
        true
    }

    /// Close and forget both channels to a peer.
    pub async fn close_link(&mut self, peer_id: &str) -> bool {
        let Some(mut link) = self.links.remove(peer_id) else {
            return false;
        };
        for channel in link.drain() {
            channel.close().await;
        }
        debug!("Closed link to {}", peer_id);
        true
    }

    pub async fn close_all(&mut self) {
        let peers: Vec<String> = self.links.keys().cloned().collect();
        for peer_id in peers {
            self.close_link(&peer_id).await;
        }
    }

    /// Every open channel of `kind`, one per peer.
    pub fn open_channels(&self, kind: ChannelKind) -> Vec<ChannelHandle> {
        self.links
            .values()
            .filter_map(|link| link.slot(kind).clone())
            .filter(|c| c.state() == ChannelState::Open)
            .collect()
    }

    pub fn has_link(&self, peer_id: &str) -> bool {
        self.links.contains_key(peer_id)
    }

    pub fn linked_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.links.keys().cloned().collect();
        peers.sort();
        peers
    }
}
