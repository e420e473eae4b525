//! Session controller.
//!
//! A single task owns all session state: room membership, peer identities,
//! links, offers and in-flight downloads. Callers talk to it through a
//! [`Client`] handle; everything that happens asynchronously is reported on
//! the [`ClientEvent`] stream returned by [`Client::spawn`].
//!
//! ```text
//!   Idle ──join──▶ Joining ──approve──▶ InRoom ──leave──▶ Leaving ──▶ Idle
//! ```
//!
//! Uploads run in their own tasks so a large file never blocks message
//! handling; everything else runs inline on the controller task.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::{Result, SessionError};
use crate::links::{decode_frame, Inbound, LinkManager};
use crate::offers::{FileOffer, LocalFile, LocalOfferSet, RemoteOfferTable};
use crate::protocol::{DataMessage, MetaMessage, PeerIdentity, ServerMessage};
use crate::signaling::{SignalingClient, SignalingConnection};
use crate::transfer::{self, DownloadProgress, InboundTransfers, TransferKey};
use crate::transport::{
    ChannelId, ChannelKind, PeerTransport, TransportEvent, TransportEvents,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Joining,
    InRoom,
    Leaving,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Joining => "joining",
            SessionState::InRoom => "in room",
            SessionState::Leaving => "leaving",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferDirection {
    Upload,
    Download,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Upload => f.write_str("upload"),
            TransferDirection::Download => f.write_str("download"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    JoinedRoom {
        room: String,
        self_id: String,
        peers: Vec<String>,
    },
    LeftRoom {
        room: String,
    },
    PeerJoined {
        peer_id: String,
    },
    PeerLeft {
        peer_id: String,
    },
    PeerInfoUpdated {
        peer: PeerIdentity,
    },
    LinkOpened {
        peer_id: String,
        kind: ChannelKind,
    },
    LinkClosed {
        peer_id: String,
        kind: ChannelKind,
    },
    LinkError {
        peer_id: Option<String>,
        error: String,
    },
    /// Full list of what the peer currently offers
    RemoteOffersUpdated {
        peer_id: String,
        offers: Vec<FileOffer>,
    },
    DownloadProgress(DownloadProgress),
    DownloadCompleted {
        peer_id: String,
        offer: FileOffer,
        path: PathBuf,
    },
    UploadProgress {
        peer_id: String,
        offer: FileOffer,
        percent: f32,
    },
    UploadCompleted {
        peer_id: String,
        offer: FileOffer,
    },
    TransferFailed {
        peer_id: String,
        offer: FileOffer,
        direction: TransferDirection,
        error: String,
    },
}

/// Point-in-time copy of the controller state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub room: Option<String>,
    pub self_id: Option<String>,
    pub display_name: String,
    pub peers: Vec<PeerIdentity>,
    pub linked_peers: Vec<String>,
    pub local_offers: Vec<FileOffer>,
    pub remote_offers: BTreeMap<String, Vec<FileOffer>>,
    pub downloads: Vec<DownloadProgress>,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum SessionCommand {
    Join {
        room: String,
        reply: Reply<Vec<String>>,
    },
    Leave {
        reply: Reply<()>,
    },
    Offer {
        files: Vec<LocalFile>,
        reply: Reply<Vec<FileOffer>>,
    },
    Unoffer {
        offer: FileOffer,
        reply: Reply<bool>,
    },
    RequestFile {
        peer_id: String,
        offer: FileOffer,
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<SessionSnapshot>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Fired once the handshake delay after a meta channel opened has elapsed.
struct HandshakeDue {
    peer_id: String,
    channel: ChannelId,
}

/// Handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl Client {
    /// Start the controller task.
    pub fn spawn(
        config: ClientConfig,
        signaling: SignalingConnection,
        transport: Arc<dyn PeerTransport>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(100);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (handshake_tx, handshake_rx) = mpsc::unbounded_channel();

        let controller = SessionController {
            display_name: config.display_name(),
            config,
            signaling: SignalingClient::new(signaling.transport),
            transport,
            transport_events: None,
            events: event_tx,
            handshake_tx,
            state: SessionState::Idle,
            room: None,
            pending_join: None,
            self_id: None,
            links: None,
            peers: BTreeMap::new(),
            local: LocalOfferSet::new(),
            remote: RemoteOfferTable::new(),
            inbound: InboundTransfers::new(),
            requested: HashSet::new(),
        };
        tokio::spawn(controller.run(cmd_rx, signaling.events, handshake_rx));

        (Self { cmd_tx }, event_rx)
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> SessionCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)?
    }

    /// Join a room. Resolves with the other peers in the room once the relay
    /// has approved the join and links to them have been initiated.
    pub async fn join_room(&self, room: &str) -> Result<Vec<String>> {
        let room = room.to_string();
        self.call(|reply| SessionCommand::Join { room, reply }).await
    }

    pub async fn leave_room(&self) -> Result<()> {
        self.call(|reply| SessionCommand::Leave { reply }).await
    }

    /// Add files to the local offer set. Returns the offers actually added.
    pub async fn offer_files(&self, files: Vec<LocalFile>) -> Result<Vec<FileOffer>> {
        self.call(|reply| SessionCommand::Offer { files, reply }).await
    }

    pub async fn offer_paths<P: AsRef<Path>>(&self, paths: &[P]) -> Result<Vec<FileOffer>> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            files.push(LocalFile::from_path(path).await?);
        }
        self.offer_files(files).await
    }

    /// Withdraw an offer. Returns false when it was not offered.
    pub async fn unoffer_file(&self, offer: &FileOffer) -> Result<bool> {
        let offer = offer.clone();
        self.call(|reply| SessionCommand::Unoffer { offer, reply }).await
    }

    /// Ask `peer_id` to send one of the files it offered.
    pub async fn request_file(&self, peer_id: &str, offer: &FileOffer) -> Result<()> {
        let peer_id = peer_id.to_string();
        let offer = offer.clone();
        self.call(|reply| SessionCommand::RequestFile {
            peer_id,
            offer,
            reply,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.call(|reply| SessionCommand::Snapshot { reply }).await
    }

    /// Leave the room if in one, disconnect from the relay and stop the task.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| SessionCommand::Shutdown { reply }).await
    }
}

struct SessionController {
    config: ClientConfig,
    display_name: String,
    signaling: SignalingClient,
    transport: Arc<dyn PeerTransport>,
    transport_events: Option<TransportEvents>,
    events: mpsc::UnboundedSender<ClientEvent>,
    handshake_tx: mpsc::UnboundedSender<HandshakeDue>,

    state: SessionState,
    room: Option<String>,
    pending_join: Option<Reply<Vec<String>>>,
    self_id: Option<String>,
    links: Option<LinkManager>,
    peers: BTreeMap<String, PeerIdentity>,
    local: LocalOfferSet,
    remote: RemoteOfferTable,
    inbound: InboundTransfers,
    requested: HashSet<TransferKey>,
}

async fn next_transport_event(events: &mut Option<TransportEvents>) -> Option<TransportEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

impl SessionController {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut signals: mpsc::UnboundedReceiver<ServerMessage>,
        mut handshakes: mpsc::UnboundedReceiver<HandshakeDue>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(message) = signals.recv() => self.handle_signal(message).await,
                Some(event) = next_transport_event(&mut self.transport_events) => {
                    self.handle_transport_event(event).await
                }
                Some(due) = handshakes.recv() => self.handle_handshake(due).await,
            }
        }
        debug!("Session controller stopped");
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn invalid_state(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidState {
            operation,
            state: self.state.as_str(),
        }
    }

    fn is_current(&self, channel: ChannelId, peer_id: &str, kind: ChannelKind) -> bool {
        self.links
            .as_ref()
            .map(|links| links.is_current(channel, peer_id, kind))
            .unwrap_or(false)
    }

    /// Returns false when the controller should stop.
    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::Join { room, reply } => self.join_room(room, reply).await,
            SessionCommand::Leave { reply } => {
                let result = self.leave_room().await;
                let _ = reply.send(result);
            }
            SessionCommand::Offer { files, reply } => {
                let _ = reply.send(Ok(self.offer_files(files).await));
            }
            SessionCommand::Unoffer { offer, reply } => {
                let _ = reply.send(Ok(self.unoffer_file(offer).await));
            }
            SessionCommand::RequestFile {
                peer_id,
                offer,
                reply,
            } => {
                let result = self.request_file(peer_id, offer).await;
                let _ = reply.send(result);
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            SessionCommand::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(Ok(()));
                return false;
            }
        }
        true
    }

    // ---- room lifecycle -------------------------------------------------

    async fn join_room(&mut self, room: String, reply: Reply<Vec<String>>) {
        if self.state != SessionState::Idle {
            let _ = reply.send(Err(self.invalid_state("join_room")));
            return;
        }

        let session = match self.transport.open().await {
            Ok(session) => session,
            Err(e) => {
                error!("Transport identity failed to open: {}", e);
                let _ = reply.send(Err(e.into()));
                return;
            }
        };
        if let Err(e) = self.signaling.join(&room, &session.self_id).await {
            error!("Failed to send join for room {}: {}", room, e);
            self.transport.shutdown().await;
            let _ = reply.send(Err(e.into()));
            return;
        }

        info!("Joining room {} as {}", room, session.self_id);
        self.links = Some(LinkManager::new(session.self_id.clone()));
        self.self_id = Some(session.self_id);
        self.transport_events = Some(session.events);
        self.room = Some(room);
        self.pending_join = Some(reply);
        self.state = SessionState::Joining;
    }

    async fn leave_room(&mut self) -> Result<()> {
        if self.state != SessionState::InRoom {
            return Err(self.invalid_state("leave_room"));
        }
        self.state = SessionState::Leaving;

        let room = self.room.clone().unwrap_or_default();
        if let Err(e) = self.signaling.leave(&room).await {
            warn!("Failed to notify relay about leaving {}: {}", room, e);
        }
        self.teardown().await;
        self.local.clear();

        info!("Left room {}", room);
        self.emit(ClientEvent::LeftRoom { room });
        Ok(())
    }

    /// Close every link, release the transport and forget all per-room state.
    async fn teardown(&mut self) {
        if let Some(mut links) = self.links.take() {
            links.close_all().await;
        }
        self.transport.shutdown().await;
        self.transport_events = None;

        if let Some(reply) = self.pending_join.take() {
            let _ = reply.send(Err(SessionError::InvalidState {
                operation: "join_room",
                state: SessionState::Leaving.as_str(),
            }));
        }
        self.self_id = None;
        self.room = None;
        self.peers.clear();
        self.remote.clear();
        self.inbound.clear();
        self.requested.clear();
        self.state = SessionState::Idle;
    }

    async fn fail_join(&mut self, error: SessionError) {
        let reply = self.pending_join.take();
        if let Some(room) = self.room.clone() {
            let _ = self.signaling.leave(&room).await;
        }
        self.teardown().await;
        if let Some(reply) = reply {
            let _ = reply.send(Err(error));
        }
    }

    async fn shutdown(&mut self) {
        match self.state {
            SessionState::InRoom => {
                let _ = self.leave_room().await;
            }
            SessionState::Joining => self.fail_join(SessionError::Stopped).await,
            SessionState::Idle | SessionState::Leaving => {}
        }
        self.signaling.close().await;
    }

    // ---- relay messages -------------------------------------------------

    async fn handle_signal(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::JoinApprove { room } => {
                if self.state != SessionState::Joining || self.room.as_deref() != Some(room.as_str())
                {
                    debug!("Ignoring join approval for {}", room);
                    return;
                }
                self.state = SessionState::InRoom;
                if let Err(e) = self.signaling.list_peers().await {
                    self.fail_join(e.into()).await;
                }
            }
            ServerMessage::ListPeers { peer_ids } => {
                let Some(reply) = self.pending_join.take() else {
                    debug!("Ignoring unsolicited peer list");
                    return;
                };
                let roster = self.adopt_roster(peer_ids).await;
                self.emit(ClientEvent::JoinedRoom {
                    room: self.room.clone().unwrap_or_default(),
                    self_id: self.self_id.clone().unwrap_or_default(),
                    peers: roster.clone(),
                });
                let _ = reply.send(Ok(roster));
            }
            ServerMessage::UserJoined { peer_id } => {
                if self.state != SessionState::InRoom || self.self_id.as_deref() == Some(peer_id.as_str()) {
                    return;
                }
                info!("Peer {} joined", peer_id);
                self.peers
                    .entry(peer_id.clone())
                    .or_insert_with(|| PeerIdentity::new(peer_id.clone()));
                self.emit(ClientEvent::PeerJoined { peer_id });
            }
            ServerMessage::UserLeft { peer_id } => {
                if self.state != SessionState::InRoom {
                    return;
                }
                info!("Peer {} left", peer_id);
                self.drop_peer(&peer_id).await;
                self.emit(ClientEvent::PeerLeft { peer_id });
            }
        }
    }

    /// Record the roster and dial every listed peer except ourselves.
    async fn adopt_roster(&mut self, peer_ids: Vec<String>) -> Vec<String> {
        let self_id = self.self_id.clone().unwrap_or_default();
        let roster: Vec<String> = peer_ids.into_iter().filter(|p| *p != self_id).collect();

        for peer_id in &roster {
            self.peers
                .entry(peer_id.clone())
                .or_insert_with(|| PeerIdentity::new(peer_id.clone()));
        }
        for peer_id in &roster {
            let result = match self.links.as_mut() {
                Some(links) => links.open_link(self.transport.as_ref(), peer_id).await,
                None => break,
            };
            if let Err(e) = result {
                self.emit(ClientEvent::LinkError {
                    peer_id: Some(peer_id.clone()),
                    error: e.to_string(),
                });
            }
        }
        roster
    }

    /// Forget everything about a departed peer.
    async fn drop_peer(&mut self, peer_id: &str) {
        self.peers.remove(peer_id);
        if let Some(links) = self.links.as_mut() {
            links.close_link(peer_id).await;
        }
        self.remote.remove_peer(peer_id);
        let dropped = self.inbound.remove_peer(peer_id);
        if dropped > 0 {
            debug!("Dropped {} partial downloads from {}", dropped, peer_id);
        }
        self.requested.retain(|key| key.peer_id != peer_id);
    }

    // ---- offers ---------------------------------------------------------

    async fn offer_files(&mut self, files: Vec<LocalFile>) -> Vec<FileOffer> {
        let added = self.local.offer(files);
        if !added.is_empty() {
            info!("Offering {} new files", added.len());
            self.broadcast_meta(MetaMessage::FileOffers {
                payload: added.clone(),
            })
            .await;
        }
        added
    }

    async fn unoffer_file(&mut self, offer: FileOffer) -> bool {
        if self.local.unoffer(&offer).is_none() {
            return false;
        }
        info!("Withdrew offer {}", offer.name());
        self.broadcast_meta(MetaMessage::UnofferFile { payload: offer })
            .await;
        true
    }

    async fn broadcast_meta(&self, message: MetaMessage) {
        let Some(links) = self.links.as_ref() else {
            return;
        };
        let frame = message.encode();
        for channel in links.open_channels(ChannelKind::Meta) {
            if let Err(e) = channel.send(frame.clone()).await {
                warn!("Failed to send to {}: {}", channel.peer_id(), e);
            }
        }
    }

    async fn send_meta(&self, peer_id: &str, message: MetaMessage) {
        let channel = match self.links.as_ref() {
            Some(links) => links.get_channel(peer_id, ChannelKind::Meta),
            None => return,
        };
        match channel {
            Ok(channel) => {
                if let Err(e) = channel.send(message.encode()).await {
                    warn!("Failed to send to {}: {}", peer_id, e);
                }
            }
            Err(e) => debug!("{}", e),
        }
    }

    // ---- transfers ------------------------------------------------------

    async fn request_file(&mut self, peer_id: String, offer: FileOffer) -> Result<()> {
        if self.state != SessionState::InRoom {
            return Err(self.invalid_state("request_file"));
        }
        if !self.remote.contains(&peer_id, &offer) {
            return Err(SessionError::OfferNotFound {
                peer_id,
                name: offer.name().to_string(),
                size: offer.size(),
            });
        }
        let channel = match self.links.as_ref() {
            Some(links) => links.get_channel(&peer_id, ChannelKind::Data)?,
            None => return Err(self.invalid_state("request_file")),
        };

        channel
            .send(
                DataMessage::DownloadRequest {
                    offer: offer.clone(),
                }
                .encode(),
            )
            .await?;
        info!("Requested {} from {}", offer.name(), peer_id);
        self.requested.insert(TransferKey::new(peer_id, offer));
        Ok(())
    }

    fn start_upload(&self, peer_id: &str, offer: FileOffer) {
        let Some(file) = self.local.find(&offer).cloned() else {
            warn!("{} requested {} which is not offered", peer_id, offer.name());
            return;
        };
        let channel = match self.links.as_ref().map(|l| l.get_channel(peer_id, ChannelKind::Data)) {
            Some(Ok(channel)) => channel,
            Some(Err(e)) => {
                warn!("Cannot serve {}: {}", offer.name(), e);
                return;
            }
            None => return,
        };

        let events = self.events.clone();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            let offer = file.offer().clone();
            let progress_events = events.clone();
            let progress_peer = peer_id.clone();
            let progress_offer = offer.clone();

            let result = transfer::send_file(&offer, file.path(), channel.as_ref(), move |percent| {
                let _ = progress_events.send(ClientEvent::UploadProgress {
                    peer_id: progress_peer.clone(),
                    offer: progress_offer.clone(),
                    percent,
                });
            })
            .await;

            let event = match result {
                Ok(_) => ClientEvent::UploadCompleted { peer_id, offer },
                Err(e) => {
                    warn!("Upload of {} to {} failed: {}", offer.name(), peer_id, e);
                    ClientEvent::TransferFailed {
                        peer_id,
                        offer,
                        direction: TransferDirection::Upload,
                        error: e.to_string(),
                    }
                }
            };
            let _ = events.send(event);
        });
    }

    fn download_failed(&self, peer_id: &str, offer: FileOffer, error: impl fmt::Display) {
        self.emit(ClientEvent::TransferFailed {
            peer_id: peer_id.to_string(),
            offer,
            direction: TransferDirection::Download,
            error: error.to_string(),
        });
    }

    fn handle_data(&mut self, peer_id: &str, message: DataMessage) {
        match message {
            DataMessage::DownloadRequest { offer } => self.start_upload(peer_id, offer),
            DataMessage::Chunk {
                offer,
                index,
                total,
                bytes,
            } => {
                let key = TransferKey::new(peer_id, offer.clone());
                if !self.requested.contains(&key) {
                    warn!("Dropping unrequested chunk of {} from {}", offer.name(), peer_id);
                    return;
                }
                match self.inbound.accept_chunk(peer_id, &offer, index, total, bytes) {
                    Ok(progress) => self.emit(ClientEvent::DownloadProgress(progress)),
                    Err(e) => {
                        self.requested.remove(&key);
                        self.download_failed(peer_id, offer, e);
                    }
                }
            }
            DataMessage::Done { offer } => {
                let key = TransferKey::new(peer_id, offer.clone());
                if !self.requested.remove(&key) {
                    warn!("Dropping unrequested completion of {} from {}", offer.name(), peer_id);
                    return;
                }
                let completed = match self.inbound.finish(peer_id, &offer) {
                    Ok(completed) => completed,
                    Err(e) => {
                        warn!("Download of {} from {} failed: {}", offer.name(), peer_id, e);
                        self.download_failed(peer_id, offer, e);
                        return;
                    }
                };

                let dir = self.config.download_dir();
                let events = self.events.clone();
                tokio::spawn(async move {
                    let event = match transfer::save_download(&dir, &completed).await {
                        Ok(path) => ClientEvent::DownloadCompleted {
                            peer_id: completed.peer_id,
                            offer: completed.offer,
                            path,
                        },
                        Err(e) => {
                            error!("Failed to save {}: {}", completed.offer.name(), e);
                            ClientEvent::TransferFailed {
                                peer_id: completed.peer_id,
                                offer: completed.offer,
                                direction: TransferDirection::Download,
                                error: e.to_string(),
                            }
                        }
                    };
                    let _ = events.send(event);
                });
            }
        }
    }

    // ---- peer links -----------------------------------------------------

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Incoming(channel) => {
                let Some(links) = self.links.as_mut() else {
                    channel.close().await;
                    return;
                };
                let peer_id = channel.peer_id().to_string();
                let loser = links.register(channel);
                self.peers
                    .entry(peer_id.clone())
                    .or_insert_with(|| PeerIdentity::new(peer_id));
                if let Some(loser) = loser {
                    loser.close().await;
                }
            }
            TransportEvent::Opened {
                channel,
                peer_id,
                kind,
            } => {
                if !self.is_current(channel, &peer_id, kind) {
                    return;
                }
                debug!("{} channel to {} open", kind, peer_id);
                if kind == ChannelKind::Meta {
                    self.schedule_handshake(peer_id.clone(), channel);
                }
                self.emit(ClientEvent::LinkOpened { peer_id, kind });
            }
            TransportEvent::Message {
                channel,
                peer_id,
                kind,
                frame,
            } => {
                if !self.is_current(channel, &peer_id, kind) {
                    debug!("Dropping frame from stale {} channel to {}", kind, peer_id);
                    return;
                }
                match decode_frame(kind, &frame) {
                    Ok(Inbound::Meta(message)) => self.handle_meta(&peer_id, message).await,
                    Ok(Inbound::Data(message)) => self.handle_data(&peer_id, message),
                    Err(e) => warn!("Ignoring {} frame from {}: {}", kind, peer_id, e),
                }
            }
            TransportEvent::Closed {
                channel,
                peer_id,
                kind,
            } => {
                let was_current = self
                    .links
                    .as_mut()
                    .map(|links| links.channel_closed(channel, &peer_id, kind))
                    .unwrap_or(false);
                if was_current {
                    debug!("{} channel to {} closed", kind, peer_id);
                    self.emit(ClientEvent::LinkClosed { peer_id, kind });
                }
            }
            TransportEvent::Error { peer_id, error } => {
                warn!("Transport error ({:?}): {}", peer_id, error);
                self.emit(ClientEvent::LinkError {
                    peer_id,
                    error: error.to_string(),
                });
            }
        }
    }

    fn schedule_handshake(&self, peer_id: String, channel: ChannelId) {
        let tx = self.handshake_tx.clone();
        let delay = self.config.handshake_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(HandshakeDue { peer_id, channel });
        });
    }

    /// Ask the peer who it is and push our full offer list.
    async fn handle_handshake(&mut self, due: HandshakeDue) {
        if !self.is_current(due.channel, &due.peer_id, ChannelKind::Meta) {
            debug!("Skipping handshake with {}: channel replaced", due.peer_id);
            return;
        }
        self.send_meta(&due.peer_id, MetaMessage::PeerInfoRequest)
            .await;
        self.send_meta(
            &due.peer_id,
            MetaMessage::FileOffers {
                payload: self.local.offers(),
            },
        )
        .await;
    }

    async fn handle_meta(&mut self, peer_id: &str, message: MetaMessage) {
        match message {
            MetaMessage::PeerInfoRequest => {
                let identity = PeerIdentity {
                    id: self.self_id.clone().unwrap_or_default(),
                    name: Some(self.display_name.clone()),
                };
                self.send_meta(peer_id, MetaMessage::PeerInfoResponse { payload: identity })
                    .await;
            }
            MetaMessage::PeerInfoResponse { payload } => {
                let entry = self
                    .peers
                    .entry(peer_id.to_string())
                    .or_insert_with(|| PeerIdentity::new(peer_id));
                entry.merge(payload);
                let peer = entry.clone();
                debug!("Peer {} is {}", peer_id, peer.display_name());
                self.emit(ClientEvent::PeerInfoUpdated { peer });
            }
            MetaMessage::FileOffers { payload } => {
                if payload.is_empty() {
                    return;
                }
                self.remote.append(peer_id, payload);
                self.emit_remote_offers(peer_id);
            }
            MetaMessage::UnofferFile { payload } => {
                if self.remote.remove(peer_id, &payload) {
                    self.emit_remote_offers(peer_id);
                }
            }
        }
    }

    fn emit_remote_offers(&self, peer_id: &str) {
        self.emit(ClientEvent::RemoteOffersUpdated {
            peer_id: peer_id.to_string(),
            offers: self
                .remote
                .get(peer_id)
                .map(|offers| offers.to_vec())
                .unwrap_or_default(),
        });
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            room: self.room.clone(),
            self_id: self.self_id.clone(),
            display_name: self.display_name.clone(),
            peers: self.peers.values().cloned().collect(),
            linked_peers: self
                .links
                .as_ref()
                .map(|links| links.linked_peers())
                .unwrap_or_default(),
            local_offers: self.local.offers(),
            remote_offers: self.remote.snapshot().into_iter().collect(),
            downloads: self.inbound.snapshot(),
        }
    }
}
