//! Wire formats.
//!
//! - [`signaling`]: JSON frames exchanged with the room relay.
//! - [`peer`]: meta-channel control messages and data-channel file frames.
//!
//! Decoders never fail a session: anything that does not parse comes back as a
//! [`FrameError`] which the caller logs and drops.

pub mod peer;
pub mod signaling;

pub use peer::{DataMessage, MetaMessage, PeerIdentity};
pub use signaling::{ClientMessage, ServerMessage};

use thiserror::Error;

/// Why an inbound frame was dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is not valid UTF-8")]
    NotUtf8,

    #[error("frame too short: {0} bytes")]
    Truncated(usize),

    #[error("header length {header} exceeds frame size {frame}")]
    HeaderOverrun { header: usize, frame: usize },

    #[error("unrecognized message type: {0}")]
    UnknownType(String),

    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Parse JSON and reject unknown `type` tags before handing the value to serde,
/// so "unknown type" and "broken payload" are reported separately.
pub(crate) fn parse_tagged<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
    known_types: &[&str],
) -> Result<T, FrameError> {
    let text = std::str::from_utf8(bytes).map_err(|_| FrameError::NotUtf8)?;
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;

    if !value.is_object() {
        return Err(FrameError::Malformed("payload is not an object".to_string()));
    }
    match value.get("type").and_then(|v| v.as_str()) {
        Some(tag) if !known_types.contains(&tag) => {
            return Err(FrameError::UnknownType(tag.to_string()));
        }
        Some(_) => {}
        None => return Err(FrameError::Malformed("missing type".to_string())),
    }

    serde_json::from_value(value).map_err(|e| FrameError::Malformed(e.to_string()))
}
