//! Peer-to-peer frames.
//!
//! The meta channel carries JSON text frames tagged by `type`. The data
//! channel carries binary frames laid out as
//!
//! ```text
//! +----------------+----------------------+------------------+
//! | header len u32 | JSON header (UTF-8)  | chunk bytes      |
//! | big-endian     | `type` tagged        | (may be empty)   |
//! +----------------+----------------------+------------------+
//! ```
//!
//! A download request may also arrive as a plain JSON text frame.

use serde::{Deserialize, Serialize};
use tokio_util::bytes::{BufMut, Bytes, BytesMut};

use super::{parse_tagged, FrameError};
use crate::offers::FileOffer;
use crate::transport::Frame;

const META_TYPES: &[&str] = &[
    "PEER_INFO_req",
    "PEER_INFO_res",
    "FILE_OFFERS_res",
    "UNOFFER_FILE_res",
];
const DATA_TYPES: &[&str] = &["FILE_DOWNLOAD_req", "FILE_DOWNLOAD_res"];
const HEADER_LEN_SIZE: usize = 4;

/// Descriptive record about a peer, learned over the meta channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl PeerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    /// Merge fields reported by the peer. The id never changes.
    pub fn merge(&mut self, reported: PeerIdentity) {
        if reported.name.is_some() {
            self.name = reported.name;
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Control messages on the meta channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MetaMessage {
    #[serde(rename = "PEER_INFO_req")]
    PeerInfoRequest,

    #[serde(rename = "PEER_INFO_res")]
    PeerInfoResponse { payload: PeerIdentity },

    #[serde(rename = "FILE_OFFERS_res")]
    FileOffers { payload: Vec<FileOffer> },

    #[serde(rename = "UNOFFER_FILE_res")]
    UnofferFile { payload: FileOffer },
}

impl MetaMessage {
    pub fn encode(&self) -> Frame {
        Frame::Text(serde_json::to_string(self).unwrap_or_default())
    }

    pub fn decode(frame: &Frame) -> Result<Self, FrameError> {
        match frame {
            Frame::Text(text) => parse_tagged(text.as_bytes(), META_TYPES),
            Frame::Binary(bytes) => parse_tagged(bytes, META_TYPES),
        }
    }
}

/// Messages on the data channel.
#[derive(Debug, Clone, PartialEq)]
pub enum DataMessage {
    /// Ask the remote side to stream the file back
    DownloadRequest { offer: FileOffer },
    /// One chunk of a file, `index` is zero-based
    Chunk {
        offer: FileOffer,
        index: u32,
        total: u32,
        bytes: Bytes,
    },
    /// End of stream marker
    Done { offer: FileOffer },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum DataHeader {
    #[serde(rename = "FILE_DOWNLOAD_req")]
    Request { payload: FileOffer },

    #[serde(rename = "FILE_DOWNLOAD_res", rename_all = "camelCase")]
    Response {
        file_offer: FileOffer,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_chunk: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_chunks: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        done: Option<bool>,
    },
}

impl DataMessage {
    pub fn offer(&self) -> &FileOffer {
        match self {
            DataMessage::DownloadRequest { offer }
            | DataMessage::Chunk { offer, .. }
            | DataMessage::Done { offer } => offer,
        }
    }

    pub fn encode(&self) -> Frame {
        let (header, body) = match self {
            DataMessage::DownloadRequest { offer } => (
                DataHeader::Request {
                    payload: offer.clone(),
                },
                Bytes::new(),
            ),
            DataMessage::Chunk {
                offer,
                index,
                total,
                bytes,
            } => (
                DataHeader::Response {
                    file_offer: offer.clone(),
                    current_chunk: Some(*index),
                    total_chunks: Some(*total),
                    done: None,
                },
                bytes.clone(),
            ),
            DataMessage::Done { offer } => (
                DataHeader::Response {
                    file_offer: offer.clone(),
                    current_chunk: None,
                    total_chunks: None,
                    done: Some(true),
                },
                Bytes::new(),
            ),
        };

        let header = serde_json::to_vec(&header).unwrap_or_default();
        let mut buf = BytesMut::with_capacity(HEADER_LEN_SIZE + header.len() + body.len());
        buf.put_u32(header.len() as u32);
        buf.put_slice(&header);
        buf.put_slice(&body);
        Frame::Binary(buf.freeze())
    }

    pub fn decode(frame: &Frame) -> Result<Self, FrameError> {
        match frame {
            Frame::Text(text) => {
                let header = parse_tagged(text.as_bytes(), DATA_TYPES)?;
                Self::from_header(header, Bytes::new())
            }
            Frame::Binary(bytes) => {
                if bytes.len() < HEADER_LEN_SIZE {
                    return Err(FrameError::Truncated(bytes.len()));
                }
                let header_len =
                    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
                let header_end = HEADER_LEN_SIZE + header_len;
                if header_end > bytes.len() {
                    return Err(FrameError::HeaderOverrun {
                        header: header_len,
                        frame: bytes.len(),
                    });
                }
                let header = parse_tagged(&bytes[HEADER_LEN_SIZE..header_end], DATA_TYPES)?;
                Self::from_header(header, bytes.slice(header_end..))
            }
        }
    }

    fn from_header(header: DataHeader, body: Bytes) -> Result<Self, FrameError> {
        match header {
            DataHeader::Request { payload } => Ok(DataMessage::DownloadRequest { offer: payload }),
            DataHeader::Response {
                file_offer,
                done: Some(true),
                ..
            } => Ok(DataMessage::Done { offer: file_offer }),
            DataHeader::Response {
                file_offer,
                current_chunk: Some(index),
                total_chunks: Some(total),
                ..
            } => Ok(DataMessage::Chunk {
                offer: file_offer,
                index,
                total,
                bytes: body,
            }),
            DataHeader::Response { .. } => Err(FrameError::Malformed(
                "download response without chunk position or done marker".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer() -> FileOffer {
        FileOffer::new("photo.jpg", 70_000, "image/jpeg")
    }

    #[test]
    fn test_meta_wire_format() {
        let frame = MetaMessage::PeerInfoResponse {
            payload: PeerIdentity {
                id: "p1".to_string(),
                name: Some("alice".to_string()),
            },
        }
        .encode();
        let Frame::Text(text) = frame else {
            panic!("meta frames are text");
        };
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "PEER_INFO_res");
        assert_eq!(json["payload"]["name"], "alice");

        let req = MetaMessage::decode(&Frame::Text(r#"{"type":"PEER_INFO_req"}"#.to_string()));
        assert_eq!(req, Ok(MetaMessage::PeerInfoRequest));
    }

    #[test]
    fn test_meta_offers_decode() {
        let text = r#"{"type":"FILE_OFFERS_res","payload":[{"name":"a.txt","size":3,"mime":"text/plain"}]}"#;
        let msg = MetaMessage::decode(&Frame::Text(text.to_string())).unwrap();
        match msg {
            MetaMessage::FileOffers { payload } => {
                assert_eq!(payload.len(), 1);
                assert_eq!(payload[0].name(), "a.txt");
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_meta_rejects_unknown_and_garbage() {
        assert_eq!(
            MetaMessage::decode(&Frame::Text(r#"{"type":"CHAT_msg"}"#.to_string())),
            Err(FrameError::UnknownType("CHAT_msg".to_string()))
        );
        assert!(MetaMessage::decode(&Frame::Text("not json".to_string())).is_err());
        assert_eq!(
            MetaMessage::decode(&Frame::Binary(Bytes::from_static(&[0xff, 0xfe]))),
            Err(FrameError::NotUtf8)
        );
    }

    #[test]
    fn test_chunk_frame_layout() {
        let frame = DataMessage::Chunk {
            offer: offer(),
            index: 1,
            total: 2,
            bytes: Bytes::from_static(b"abc"),
        }
        .encode();
        let Frame::Binary(bytes) = &frame else {
            panic!("data frames are binary");
        };

        let header_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let header: serde_json::Value =
            serde_json::from_slice(&bytes[4..4 + header_len]).unwrap();
        assert_eq!(header["type"], "FILE_DOWNLOAD_res");
        assert_eq!(header["currentChunk"], 1);
        assert_eq!(header["totalChunks"], 2);
        assert_eq!(header["fileOffer"]["name"], "photo.jpg");
        assert_eq!(&bytes[4 + header_len..], b"abc");

        match DataMessage::decode(&frame).unwrap() {
            DataMessage::Chunk { index, total, bytes, .. } => {
                assert_eq!((index, total), (1, 2));
                assert_eq!(&bytes[..], b"abc");
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_done_and_text_request() {
        let done = DataMessage::Done { offer: offer() }.encode();
        assert_eq!(
            DataMessage::decode(&done).unwrap(),
            DataMessage::Done { offer: offer() }
        );

        let text = r#"{"type":"FILE_DOWNLOAD_req","payload":{"name":"photo.jpg","size":70000}}"#;
        assert_eq!(
            DataMessage::decode(&Frame::Text(text.to_string())).unwrap(),
            DataMessage::DownloadRequest { offer: offer() }
        );
    }

    #[test]
    fn test_data_frame_errors() {
        assert_eq!(
            DataMessage::decode(&Frame::Binary(Bytes::from_static(&[0, 0]))),
            Err(FrameError::Truncated(2))
        );
        assert_eq!(
            DataMessage::decode(&Frame::Binary(Bytes::from_static(&[0, 0, 0, 9, b'{']))),
            Err(FrameError::HeaderOverrun { header: 9, frame: 5 })
        );

        let text = r#"{"type":"FILE_DOWNLOAD_res","fileOffer":{"name":"x","size":1}}"#;
        assert!(matches!(
            DataMessage::decode(&Frame::Text(text.to_string())),
            Err(FrameError::Malformed(_))
        ));
    }
}
