//! Error types shared across the client core.
//!
//! Local precondition failures (`InvalidState`, `NotConnected`, `OfferNotFound`)
//! are returned to the caller before anything is sent on the wire. Transport and
//! signaling failures carry their own enums so each layer can be used on its own.

use thiserror::Error;

use crate::transport::ChannelKind;

/// Errors raised by the peer transport primitive.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The local transport identity could not be acquired
    #[error("Transport identity failed to open: {message}")]
    IdentityUnavailable { message: String },

    /// Dialing a remote peer failed
    #[error("Failed to connect to peer {peer_id}: {message}")]
    ConnectFailed { peer_id: String, message: String },

    /// The channel is not open (still connecting, closed or errored)
    #[error("Channel to {peer_id} is not open")]
    ChannelClosed { peer_id: String },

    /// Writing a frame failed
    #[error("Failed to send frame: {message}")]
    SendFailed { message: String },

    /// The transport has been shut down
    #[error("Transport is shut down")]
    Shutdown,
}

/// Errors raised by the signaling client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Signaling connection failed: {0}")]
    ConnectFailed(String),

    #[error("Signaling connection closed")]
    Closed,

    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),
}

/// Errors raised while sending or reassembling a file.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A chunk arrived out of sequence or with an inconsistent total
    #[error("Unexpected chunk {index}/{total} for {name}, expected chunk {expected}")]
    OutOfOrder {
        name: String,
        index: u32,
        total: u32,
        expected: u32,
    },

    #[error("Chunk count {total} for {name} does not match its size, expected {expected}")]
    TotalMismatch {
        name: String,
        total: u32,
        expected: u32,
    },

    /// A chunk larger than the chunk size, or one that runs past the offered size
    #[error("Chunk {index} of {name} is oversized: {len} bytes with {received_bytes}/{expected_bytes} already received")]
    Oversized {
        name: String,
        index: u32,
        len: usize,
        received_bytes: u64,
        expected_bytes: u64,
    },

    #[error("{name} is too large to transfer ({size} bytes)")]
    TooLarge { name: String, size: u64 },

    /// The completion marker arrived but the received data does not match the offer
    #[error("Incomplete transfer of {name}: {received_chunks}/{total_chunks} chunks, {received_bytes}/{expected_bytes} bytes")]
    Incomplete {
        name: String,
        received_chunks: u32,
        total_chunks: u32,
        received_bytes: u64,
        expected_bytes: u64,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the session controller to its caller.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Operation issued from a state that forbids it
    #[error("Operation '{operation}' is not valid while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// No open channel of the requested kind exists for the peer
    #[error("No open {kind} channel to peer {peer_id}")]
    NotConnected { peer_id: String, kind: ChannelKind },

    /// The requested file is not known to be offered by the peer
    #[error("Peer {peer_id} does not offer {name} ({size} bytes)")]
    OfferNotFound {
        peer_id: String,
        name: String,
        size: u64,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The session task has stopped
    #[error("Session is no longer running")]
    Stopped,
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
