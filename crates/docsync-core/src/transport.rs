//! Connection trait for the transports that carry repo messages.
//!
//! Implemented by the tokio-tungstenite WebSocket connections in
//! docsync-server, for both accepted and outgoing sockets.

use crate::protocol::RepoMessage;
use crate::RepoId;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Connection closed")]
    Closed,

    #[error("Encode failed: {0}")]
    Encode(#[from] crate::protocol::ProtocolError),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// An established connection to a peer (handshake complete).
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Connection: Send + Sync {
    /// The peer this connection was handshaked with.
    fn peer_id(&self) -> RepoId;

    /// Send one raw frame.
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Close the connection.
    async fn close(&self) -> Result<()>;

    /// Encode and send a repo message.
    async fn send_message(&self, msg: &RepoMessage) -> Result<()> {
        let data = msg.to_json()?;
        self.send(&data).await
    }
}
