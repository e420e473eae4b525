//! TCP transport.
//!
//! The peer id is the advertised `host:port` the transport listens on, so the
//! roster handed out by the relay is directly dialable. Each channel is one TCP
//! connection framed with a 4-byte length prefix; the first frame on a new
//! connection is a JSON hello naming the channel kind and the dialer's id.
//! Every later frame starts with a one-byte tag (0 = text, 1 = binary).

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use super::{
    next_channel_id, ChannelHandle, ChannelId, ChannelKind, ChannelState, Frame, PeerChannel,
    PeerTransport, StateCell, TransportEvent, TransportSession,
};
use crate::error::TransportError;

const TAG_TEXT: u8 = 0;
const TAG_BINARY: u8 = 1;
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Hello {
    communication_type: ChannelKind,
    peer_id: String,
}

type FrameReader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
type FrameWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;
type ChannelList = Arc<Mutex<Vec<Arc<TcpChannel>>>>;

/// Drop a finished channel from the transport's list so its socket is released.
fn forget_channel(channels: &Weak<Mutex<Vec<Arc<TcpChannel>>>>, id: ChannelId) {
    if let Some(channels) = channels.upgrade() {
        if let Ok(mut list) = channels.lock() {
            list.retain(|c| c.id != id);
        }
    }
}

fn encode_frame(frame: Frame) -> Bytes {
    let (tag, body) = match frame {
        Frame::Text(text) => (TAG_TEXT, Bytes::from(text)),
        Frame::Binary(bytes) => (TAG_BINARY, bytes),
    };
    let mut buf = BytesMut::with_capacity(1 + body.len());
    buf.put_u8(tag);
    buf.put_slice(&body);
    buf.freeze()
}

fn decode_frame(mut raw: BytesMut) -> Option<Frame> {
    if raw.is_empty() {
        return None;
    }
    let tag = raw.split_to(1)[0];
    match tag {
        TAG_TEXT => String::from_utf8(raw.to_vec()).ok().map(Frame::Text),
        TAG_BINARY => Some(Frame::Binary(raw.freeze())),
        _ => None,
    }
}

#[derive(Debug)]
pub struct TcpChannel {
    id: ChannelId,
    peer_id: String,
    kind: ChannelKind,
    dialer: String,
    state: Arc<StateCell>,
    writer: AsyncMutex<FrameWriter>,
    events: mpsc::UnboundedSender<TransportEvent>,
    reader: Mutex<Option<JoinHandle<()>>>,
    channels: Weak<Mutex<Vec<Arc<TcpChannel>>>>,
}

impl TcpChannel {
    fn closed_event(&self) -> TransportEvent {
        TransportEvent::Closed {
            channel: self.id,
            peer_id: self.peer_id.clone(),
            kind: self.kind,
        }
    }
}

#[async_trait]
impl PeerChannel for TcpChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn peer_id(&self) -> &str {
        &self.peer_id
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
                peer_id: self.peer_id.clone(),
            });
        }
        let mut writer = self.writer.lock().await;
        writer
            .send(encode_frame(frame))
            .await
            .map_err(|e| TransportError::SendFailed {
                message: e.to_string(),
            })
    }

    async fn close(&self) {
        if !self.state.finish(ChannelState::Closed) {
            return;
        }
        if let Some(reader) = self.reader.lock().ok().and_then(|mut r| r.take()) {
            reader.abort();
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = SinkExt::<Bytes>::close(&mut *writer).await {
            debug!("Error closing channel to {}: {}", self.peer_id, e);
        }
        drop(writer);
        forget_channel(&self.channels, self.id);
        let _ = self.events.send(self.closed_event());
    }
}

/// Spawn the read loop and record its handle on the channel.
fn start_reader(channel: &Arc<TcpChannel>, mut reader: FrameReader) {
    let id = channel.id;
    let peer_id = channel.peer_id.clone();
    let kind = channel.kind;
    let events = channel.events.clone();
    let state = channel.state.clone();
    let channels = channel.channels.clone();

    let handle = tokio::spawn(async move {
        let mut failure = None;
        while let Some(result) = reader.next().await {
            match result {
                Ok(raw) => match decode_frame(raw) {
                    Some(frame) => {
                        let _ = events.send(TransportEvent::Message {
                            channel: id,
                            peer_id: peer_id.clone(),
                            kind,
                            frame,
                        });
                    }
                    None => warn!("Dropping undecodable frame from {}", peer_id),
                },
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        let terminal = if failure.is_some() {
            ChannelState::Errored
        } else {
            ChannelState::Closed
        };
        if state.finish(terminal) {
            forget_channel(&channels, id);
            if let Some(message) = failure {
                let _ = events.send(TransportEvent::Error {
                    peer_id: Some(peer_id.clone()),
                    error: TransportError::SendFailed { message },
                });
            }
            let _ = events.send(TransportEvent::Closed {
                channel: id,
                peer_id,
                kind,
            });
        }
    });

    if let Ok(mut slot) = channel.reader.lock() {
        *slot = Some(handle);
    }
}

fn new_channel(
    write_half: OwnedWriteHalf,
    peer_id: String,
    dialer: String,
    kind: ChannelKind,
    events: mpsc::UnboundedSender<TransportEvent>,
    channels: &ChannelList,
) -> Arc<TcpChannel> {
    Arc::new(TcpChannel {
        id: next_channel_id(),
        peer_id,
        kind,
        dialer,
        state: Arc::new(StateCell::new(ChannelState::Open)),
        writer: AsyncMutex::new(FramedWrite::new(write_half, LengthDelimitedCodec::new())),
        events,
        reader: Mutex::new(None),
        channels: Arc::downgrade(channels),
    })
}

async fn accept_channel(
    stream: TcpStream,
    remote: SocketAddr,
    events: mpsc::UnboundedSender<TransportEvent>,
    channels: ChannelList,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());

    let hello = match tokio::time::timeout(HELLO_TIMEOUT, reader.next()).await {
        Ok(Some(Ok(raw))) => serde_json::from_slice::<Hello>(&raw).ok(),
        _ => None,
    };
    let Some(hello) = hello else {
        warn!("Connection from {} sent no valid hello, dropping", remote);
        return;
    };

    let channel = new_channel(
        write_half,
        hello.peer_id.clone(),
        hello.peer_id,
        hello.communication_type,
        events.clone(),
        &channels,
    );
    debug!(
        "Accepted {} channel from {} ({})",
        channel.kind, channel.peer_id, remote
    );

    if let Ok(mut list) = channels.lock() {
        list.push(channel.clone());
    }
    let opened = TransportEvent::Opened {
        channel: channel.id,
        peer_id: channel.peer_id.clone(),
        kind: channel.kind,
    };
    // Incoming and Opened must be queued before the first message.
    let _ = events.send(TransportEvent::Incoming(channel.clone()));
    let _ = events.send(opened);
    start_reader(&channel, reader);
}

struct Listening {
    self_id: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    accept_task: JoinHandle<()>,
    channels: ChannelList,
}

pub struct TcpTransport {
    bind_addr: SocketAddr,
    advertise_host: Option<String>,
    listening: Mutex<Option<Listening>>,
}

impl TcpTransport {
    /// `advertise_host` replaces the bound IP in the peer id, useful when
    /// binding to `0.0.0.0`.
    pub fn new(bind_addr: SocketAddr, advertise_host: Option<String>) -> Self {
        Self {
            bind_addr,
            advertise_host,
            listening: Mutex::new(None),
        }
    }

    /// Channels currently tracked, accepted and dialed.
    pub fn channel_count(&self) -> usize {
        self.current()
            .and_then(|(_, _, channels)| channels.lock().ok().map(|list| list.len()))
            .unwrap_or(0)
    }

    fn current(&self) -> Option<(String, mpsc::UnboundedSender<TransportEvent>, ChannelList)> {
        self.listening.lock().ok().and_then(|guard| {
            guard
                .as_ref()
                .map(|l| (l.self_id.clone(), l.events.clone(), l.channels.clone()))
        })
    }

    async fn release(&self) {
        let listening = self.listening.lock().ok().and_then(|mut guard| guard.take());
        if let Some(listening) = listening {
            listening.accept_task.abort();
            let channels: Vec<_> = listening
                .channels
                .lock()
                .map(|mut list| list.drain(..).collect())
                .unwrap_or_default();
            for channel in channels {
                channel.close().await;
            }
            info!("TCP transport {} released", listening.self_id);
        }
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn open(&self) -> Result<TransportSession, TransportError> {
        self.release().await;

        let listener = TcpListener::bind(self.bind_addr).await.map_err(|e| {
            TransportError::IdentityUnavailable {
                message: format!("bind {} failed: {}", self.bind_addr, e),
            }
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::IdentityUnavailable {
                message: e.to_string(),
            })?;
        let host = self
            .advertise_host
            .clone()
            .unwrap_or_else(|| local_addr.ip().to_string());
        let self_id = format!("{}:{}", host, local_addr.port());

        let (tx, rx) = mpsc::unbounded_channel();
        let channels = Arc::new(Mutex::new(Vec::new()));

        let accept_events = tx.clone();
        let accept_channels = channels.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        tokio::spawn(accept_channel(
                            stream,
                            remote,
                            accept_events.clone(),
                            accept_channels.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        let _ = accept_events.send(TransportEvent::Error {
                            peer_id: None,
                            error: TransportError::IdentityUnavailable {
                                message: e.to_string(),
                            },
                        });
                        break;
                    }
                }
            }
        });

        if let Ok(mut guard) = self.listening.lock() {
            *guard = Some(Listening {
                self_id: self_id.clone(),
                events: tx,
                accept_task,
                channels,
            });
        }
        info!("TCP transport listening on {} as {}", local_addr, self_id);

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
        let (self_id, events, channels) = self.current().ok_or(TransportError::Shutdown)?;
        let connect_failed = |message: String| TransportError::ConnectFailed {
            peer_id: peer_id.to_string(),
            message,
        };

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(peer_id))
            .await
            .map_err(|_| connect_failed("timed out".to_string()))?
            .map_err(|e| connect_failed(e.to_string()))?;

        let (read_half, write_half) = stream.into_split();
        let reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
        let channel = new_channel(
            write_half,
            peer_id.to_string(),
            self_id.clone(),
            kind,
            events.clone(),
            &channels,
        );

        let hello = serde_json::to_vec(&Hello {
            communication_type: kind,
            peer_id: self_id,
        })
        .map_err(|e| connect_failed(e.to_string()))?;
        {
            let mut writer = channel.writer.lock().await;
            writer
                .send(Bytes::from(hello))
                .await
                .map_err(|e| connect_failed(e.to_string()))?;
        }

        if let Ok(mut list) = channels.lock() {
            list.push(channel.clone());
        }
        let _ = events.send(TransportEvent::Opened {
            channel: channel.id,
            peer_id: peer_id.to_string(),
            kind,
        });
        start_reader(&channel, reader);
        debug!("Dialed {} channel to {}", kind, peer_id);
        Ok(channel)
    }

    async fn shutdown(&self) {
        self.release().await;
    }
}
