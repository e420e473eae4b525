use peersend::protocol::ServerMessage;
use peersend::signaling::{server, RelayHub, SignalingClient, WsSignaling};
use peersend::SignalingError;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

async fn start_relay() -> (String, RelayHub) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let hub = RelayHub::new();
    tokio::spawn(server::serve(listener, hub.clone()));
    (url, hub)
}

async fn next_message(events: &mut UnboundedReceiver<ServerMessage>) -> ServerMessage {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for relay")
        .expect("relay connection closed")
}

#[tokio::test]
async fn test_join_list_and_leave_over_websocket() {
    let (url, hub) = start_relay().await;

    let alice = WsSignaling::connect(&url).await.unwrap();
    let mut alice_events = alice.events;
    let alice = SignalingClient::new(alice.transport);

    let bob = WsSignaling::connect(&url).await.unwrap();
    let mut bob_events = bob.events;
    let bob = SignalingClient::new(bob.transport);

    alice.join("room-1", "alice").await.unwrap();
    assert_eq!(
        next_message(&mut alice_events).await,
        ServerMessage::JoinApprove {
            room: "room-1".to_string()
        }
    );

    bob.join("room-1", "bob").await.unwrap();
    assert!(matches!(
        next_message(&mut bob_events).await,
        ServerMessage::JoinApprove { .. }
    ));
    assert_eq!(
        next_message(&mut alice_events).await,
        ServerMessage::UserJoined {
            peer_id: "bob".to_string()
        }
    );

    bob.list_peers().await.unwrap();
    assert_eq!(
        next_message(&mut bob_events).await,
        ServerMessage::ListPeers {
            peer_ids: vec!["alice".to_string(), "bob".to_string()]
        }
    );

    bob.leave("room-1").await.unwrap();
    assert_eq!(
        next_message(&mut alice_events).await,
        ServerMessage::UserLeft {
            peer_id: "bob".to_string()
        }
    );
    assert_eq!(hub.members("room-1"), vec!["alice".to_string()]);
}

#[tokio::test]
async fn test_dropped_socket_leaves_rooms() {
    let (url, hub) = start_relay().await;

    let alice = WsSignaling::connect(&url).await.unwrap();
    let mut alice_events = alice.events;
    let alice = SignalingClient::new(alice.transport);
    let bob = WsSignaling::connect(&url).await.unwrap();
    let mut bob_events = bob.events;
    let bob = SignalingClient::new(bob.transport);

    alice.join("room-2", "alice").await.unwrap();
    next_message(&mut alice_events).await;
    bob.join("room-2", "bob").await.unwrap();
    next_message(&mut bob_events).await;
    next_message(&mut alice_events).await;

    bob.close().await;
    assert_eq!(
        next_message(&mut alice_events).await,
        ServerMessage::UserLeft {
            peer_id: "bob".to_string()
        }
    );
    assert_eq!(hub.room_count(), 1);
}

#[tokio::test]
async fn test_rejects_non_websocket_url() {
    let err = WsSignaling::connect("http://127.0.0.1:1").await.err().unwrap();
    assert!(matches!(err, SignalingError::InvalidUrl(_)));
}
