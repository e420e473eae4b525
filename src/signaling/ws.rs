//! WebSocket connection to a remote relay.
//!
//! One writer task drains an outgoing queue onto the socket, one reader task
//! parses relay frames into [`ServerMessage`]s. Unrecognized frames are logged
//! and dropped.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use super::{SignalingConnection, SignalingTransport};
use crate::error::SignalingError;
use crate::protocol::{ClientMessage, ServerMessage};

enum Outgoing {
    Message(ClientMessage),
    Close,
}

pub struct WsSignaling {
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl WsSignaling {
    /// Connect to a relay at `url` (`ws://` or `wss://`).
    pub async fn connect(url: &str) -> Result<SignalingConnection, SignalingError> {
        let parsed = Url::parse(url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(SignalingError::InvalidUrl(format!(
                "unsupported scheme {}",
                parsed.scheme()
            )));
        }

        let (stream, _) = connect_async(parsed.as_str())
            .await
            .map_err(|e| SignalingError::ConnectFailed(e.to_string()))?;
        info!("Connected to relay {}", parsed);
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(outgoing) = out_rx.recv().await {
                let result = match outgoing {
                    Outgoing::Message(message) => sink.send(Message::Text(message.encode())).await,
                    Outgoing::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    warn!("Relay write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => match ServerMessage::decode(&text) {
                        Ok(message) => {
                            if event_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Ignoring relay frame: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Relay read failed: {}", e);
                        break;
                    }
                }
            }
            debug!("Relay connection closed");
        });

        Ok(SignalingConnection {
            transport: Arc::new(WsSignaling { outgoing: out_tx }),
            events: event_rx,
        })
    }
}

#[async_trait]
impl SignalingTransport for WsSignaling {
    async fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        self.outgoing
            .send(Outgoing::Message(message))
            .map_err(|_| SignalingError::Closed)
    }

    async fn close(&self) {
        let _ = self.outgoing.send(Outgoing::Close);
    }
}
