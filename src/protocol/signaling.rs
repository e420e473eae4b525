//! Relay frames. Tags match the event names used by the relay (`cl_*` sent by
//! clients, `sv_*` sent by the relay).

use serde::{Deserialize, Serialize};

use super::{parse_tagged, FrameError};

const CLIENT_TYPES: &[&str] = &["cl_join", "cl_leave", "cl_list_peers"];
const SERVER_TYPES: &[&str] = &[
    "sv_join_approve",
    "sv_list_peers",
    "sv_user_joined",
    "sv_user_left",
];

/// Client → relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "cl_join", rename_all = "camelCase")]
    Join { room: String, peer_id: String },

    #[serde(rename = "cl_leave")]
    Leave { room: String },

    #[serde(rename = "cl_list_peers")]
    ListPeers,
}

/// Relay → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "sv_join_approve")]
    JoinApprove { room: String },

    #[serde(rename = "sv_list_peers", rename_all = "camelCase")]
    ListPeers { peer_ids: Vec<String> },

    #[serde(rename = "sv_user_joined", rename_all = "camelCase")]
    UserJoined { peer_id: String },

    #[serde(rename = "sv_user_left", rename_all = "camelCase")]
    UserLeft { peer_id: String },
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        parse_tagged(text.as_bytes(), CLIENT_TYPES)
    }

    pub fn encode(&self) -> String {
        // Plain string/vector fields only; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl ServerMessage {
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        parse_tagged(text.as_bytes(), SERVER_TYPES)
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_wire_format() {
        let join = ClientMessage::Join {
            room: "r1".to_string(),
            peer_id: "abc".to_string(),
        };
        let json: serde_json::Value = serde_json::from_str(&join.encode()).unwrap();
        assert_eq!(json["type"], "cl_join");
        assert_eq!(json["room"], "r1");
        assert_eq!(json["peerId"], "abc");

        let list: serde_json::Value =
            serde_json::from_str(&ClientMessage::ListPeers.encode()).unwrap();
        assert_eq!(list, serde_json::json!({"type": "cl_list_peers"}));
    }

    #[test]
    fn test_server_decode() {
        let msg = ServerMessage::decode(r#"{"type":"sv_list_peers","peerIds":["a","b"]}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::ListPeers {
                peer_ids: vec!["a".to_string(), "b".to_string()]
            }
        );

        let left = ServerMessage::decode(r#"{"type":"sv_user_left","peerId":"a"}"#).unwrap();
        assert_eq!(left, ServerMessage::UserLeft { peer_id: "a".to_string() });
    }

    #[test]
    fn test_unknown_and_malformed() {
        assert_eq!(
            ServerMessage::decode(r#"{"type":"sv_kick","peerId":"a"}"#),
            Err(FrameError::UnknownType("sv_kick".to_string()))
        );
        assert!(matches!(
            ServerMessage::decode(r#"{"type":"sv_user_left"}"#),
            Err(FrameError::Malformed(_))
        ));
        assert!(matches!(
            ClientMessage::decode("[1,2]"),
            Err(FrameError::Malformed(_))
        ));
    }
}
