//! Outgoing connections to a sync server.
//!
//! Manages connections we initiate, including:
//! - Connection establishment with the join handshake
//! - Automatic reconnection with exponential backoff
//! - State tracking (connecting, handshaking, connected, reconnecting)

use crate::connection::{ConnId, ConnectionEvent, PeerConnection};
use anyhow::{anyhow, bail, Result};
use docsync_core::protocol::HandshakeMessage;
use docsync_core::transport::{self, TransportError};
use docsync_core::{RepoId, RepoMessage};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, MaybeTlsStream};
use tracing::{debug, info, warn};

/// State of an outgoing connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingState {
    /// Attempting to connect
    Connecting,
    /// Connected, `join` sent, waiting for `peer`
    Handshaking,
    /// Fully connected
    Connected,
    /// Disconnected, waiting to reconnect
    Reconnecting,
    /// Permanently closed (no reconnect)
    Closed,
}

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

/// Calculates the next reconnection delay using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Reconnection bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    /// Number of reconnection attempts
    pub attempts: u32,
    /// When to attempt next reconnection (ms since epoch)
    pub next_attempt_at: Option<u64>,
    /// Current backoff delay
    pub current_delay: Duration,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule next reconnection attempt.
    pub fn schedule_reconnect(&mut self, now_ms: u64, config: &ReconnectConfig) {
        self.attempts += 1;
        self.current_delay = calculate_backoff(self.attempts, config);
        self.next_attempt_at = Some(now_ms + self.current_delay.as_millis() as u64);
    }

    /// Reset state after successful connection.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Check if it's time to reconnect.
    pub fn should_reconnect(&self, now_ms: u64) -> bool {
        self.next_attempt_at.is_some_and(|t| now_ms >= t)
    }

    /// Check if max attempts exceeded.
    pub fn exceeded_max_attempts(&self, config: &ReconnectConfig) -> bool {
        config.max_attempts.is_some_and(|max| self.attempts >= max)
    }
}

type ClientConnection = PeerConnection<MaybeTlsStream<TcpStream>>;

/// An outgoing connection to a sync server.
pub struct OutgoingConnection {
    /// Server URL
    pub address: String,
    /// Our repo ID (sent in `join`)
    our_id: RepoId,
    /// Server repo ID (known after handshake)
    pub remote_id: Option<RepoId>,
    pub state: OutgoingState,
    conn: Option<ClientConnection>,
    pub reconnect: ReconnectState,
}

impl OutgoingConnection {
    /// Create a new outgoing connection (not yet connected).
    pub fn new(address: impl Into<String>, our_id: RepoId) -> Self {
        Self {
            address: address.into(),
            our_id,
            remote_id: None,
            state: OutgoingState::Connecting,
            conn: None,
            reconnect: ReconnectState::new(),
        }
    }

    /// Dial the server and send `join`.
    ///
    /// Frames arrive on `event_tx` tagged with `conn_id`. The connection is
    /// usable once [`on_handshake`](Self::on_handshake) accepts the reply.
    pub async fn connect(
        &mut self,
        conn_id: ConnId,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<()> {
        self.state = OutgoingState::Connecting;

        let (ws_stream, _) = connect_async(self.address.as_str()).await?;
        self.state = OutgoingState::Handshaking;

        let conn = PeerConnection::new(conn_id, ws_stream, event_tx);
        conn.send_handshake(&HandshakeMessage::join(self.our_id))
            .await?;
        debug!("Sent join to {}", self.address);
        self.conn = Some(conn);
        Ok(())
    }

    /// Process the server's handshake reply. Returns the server's repo ID.
    pub fn on_handshake(&mut self, message: HandshakeMessage) -> Result<RepoId> {
        match message {
            HandshakeMessage::Peer {
                sender_id,
                target_id,
                ref selected_protocol_version,
            } => {
                if !message.is_compatible() {
                    bail!(
                        "Server selected unsupported protocol version {}",
                        selected_protocol_version
                    );
                }
                if target_id != self.our_id {
                    warn!("Server addressed {} but we are {}", target_id, self.our_id);
                }
                self.on_handshake_complete(sender_id);
                Ok(sender_id)
            }
            HandshakeMessage::Error { message } => Err(anyhow!("Server rejected join: {}", message)),
            HandshakeMessage::Join { .. } => bail!("Unexpected join from server"),
        }
    }

    /// Mark the handshake as done.
    pub fn on_handshake_complete(&mut self, remote_id: RepoId) {
        info!("Connected to {} (server {})", self.address, remote_id);
        self.remote_id = Some(remote_id);
        self.state = OutgoingState::Connected;
        self.reconnect.reset();
    }

    /// Whether frames from `conn_id` belong to the live socket.
    pub fn is_current(&self, conn_id: ConnId) -> bool {
        self.conn.as_ref().is_some_and(|c| c.conn_id == conn_id)
    }

    /// Send data to the server.
    pub async fn send(&self, data: &[u8]) -> transport::Result<()> {
        match (&self.conn, self.state) {
            (Some(conn), OutgoingState::Connected) => conn.send(data).await,
            _ => Err(TransportError::Closed),
        }
    }

    pub async fn send_message(&self, msg: &RepoMessage) -> transport::Result<()> {
        self.send(&msg.to_json()?).await
    }

    /// Close the connection for good.
    pub async fn close(&mut self) {
        self.state = OutgoingState::Closed;
        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
    }

    /// Prepare for reconnection (after disconnect or a failed dial).
    pub fn prepare_reconnect(&mut self, now_ms: u64, config: &ReconnectConfig) {
        self.state = OutgoingState::Reconnecting;
        self.remote_id = None;
        self.conn = None;
        self.reconnect.schedule_reconnect(now_ms, config);
        info!(
            "Scheduled reconnect to {} in {:?} (attempt {})",
            self.address, self.reconnect.current_delay, self.reconnect.attempts
        );
    }

    /// Check if we should attempt reconnection now.
    pub fn should_reconnect(&self, now_ms: u64) -> bool {
        self.state == OutgoingState::Reconnecting && self.reconnect.should_reconnect(now_ms)
    }
}
