//! WebSocket front end for a [`RelayHub`]. Each accepted socket becomes one
//! hub connection; closing the socket counts as leaving every room.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, warn};

use super::{RelayHub, SignalingConnection};
use crate::protocol::ClientMessage;

/// Accept WebSocket clients forever.
pub async fn serve(listener: TcpListener, hub: RelayHub) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                tokio::spawn(serve_connection(hub.clone(), stream, remote));
            }
            Err(e) => error!("Accept failed: {}", e),
        }
    }
}

/// Bridge one WebSocket client onto a hub connection until either side closes.
pub async fn serve_connection(hub: RelayHub, stream: TcpStream, remote: SocketAddr) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", remote, e);
            return;
        }
    };
    debug!("Client connected from {}", remote);

    let (mut ws_write, mut ws_read) = ws_stream.split();
    let SignalingConnection {
        transport,
        mut events,
    } = hub.connect();

    let writer = tokio::spawn(async move {
        while let Some(message) = events.recv().await {
            if ws_write.send(Message::Text(message.encode())).await.is_err() {
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    while let Some(frame) = ws_read.next().await {
        match frame {
            Ok(Message::Text(text)) => match ClientMessage::decode(&text) {
                Ok(message) => {
                    if transport.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Ignoring frame from {}: {}", remote, e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Read from {} failed: {}", remote, e);
                break;
            }
        }
    }

    // Closing drops the hub's queue, which ends the writer.
    transport.close().await;
    let _ = writer.await;
    debug!("Client {} disconnected", remote);
}
