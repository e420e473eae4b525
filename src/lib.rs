//! PeerSend: room-based peer-to-peer file sharing.
//!
//! Clients meet in named rooms through a small relay, then open two direct
//! channels to every other peer: one for control messages and one for file
//! data. Files are advertised as offers and streamed in 64 KiB chunks on
//! request.

pub mod config;
pub mod error;
pub mod headless;
pub mod links;
pub mod offers;
pub mod protocol;
pub mod repl;
pub mod session;
pub mod signaling;
pub mod transfer;
pub mod transport;

pub use config::ClientConfig;
pub use error::{Result, SessionError, SignalingError, TransferError, TransportError};
pub use offers::{FileOffer, LocalFile};
pub use session::{Client, ClientEvent, SessionSnapshot, SessionState};
