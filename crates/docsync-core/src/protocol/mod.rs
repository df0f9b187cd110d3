//! Protocol definitions for repository sync.
//!
//! This module defines the wire protocol for peer communication:
//! - Join/peer handshake for initial connection
//! - `RepoMessage` envelope for sync, request, doc-unavailable and ephemeral messages
//! - Bincode sync bodies carrying version vectors and Loro updates

pub mod handshake;
pub mod message;

pub use handshake::{HandshakeMessage, PROTOCOL_VERSION};
pub use message::{Frame, MAX_MESSAGE_SIZE, MessageKind, RepoMessage, SyncBody};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bincode error: {0}")]
    Bincode(String),

    #[error("Invalid version vector: {0}")]
    InvalidVersion(String),

    #[error("Frame too large: {0} bytes")]
    TooLarge(usize),
}
