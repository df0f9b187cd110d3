//! WebSocket server for accepting peer connections.
//!
//! Manages connection lifecycle, repo ID mapping, and message routing.
//! The handshake lifecycle is encapsulated: callers only see `ServerEvent`s
//! with resolved repo IDs via `poll_event()`.

use crate::connection::{ConnId, ConnectionEvent, Peer, PeerConnection};
use crate::config::{DEFAULT_STATIC_DIR, DEFAULT_WS_PATH};
use crate::web::{self, Upgrade, UpgradedStream};
use anyhow::Result;
use docsync_core::protocol::HandshakeMessage;
use docsync_core::transport::{self, Connection, TransportError};
use docsync_core::{Outgoing, Repo, RepoId, RepoMessage};
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// How long a connection may take to upgrade and then to send `join`.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Event emitted by the server after the handshake lifecycle is resolved.
/// Callers only see repo IDs; connection IDs are an internal detail.
#[derive(Debug)]
pub enum ServerEvent {
    /// A peer completed the join/peer handshake.
    PeerConnected { peer_id: RepoId },
    /// A frame from an identified peer.
    Message { peer_id: RepoId, data: Vec<u8> },
    /// A previously connected peer disconnected.
    PeerDisconnected { peer_id: RepoId },
}

/// Settings for [`run`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Only upgrade requests for this path are accepted
    pub ws_path: String,
    /// Files served on every other path
    pub static_dir: Option<PathBuf>,
    pub handshake_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            ws_path: DEFAULT_WS_PATH.to_string(),
            static_dir: Some(PathBuf::from(DEFAULT_STATIC_DIR)),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

/// A connection waiting for `join`.
struct Pending {
    conn: PeerConnection<UpgradedStream>,
    opened: Instant,
}

/// WebSocket server managing peer connections.
pub struct WebSocketServer {
    /// Our repo ID, sent in `peer` replies
    repo_id: RepoId,
    /// Pre-handshake connections
    pending: HashMap<ConnId, Pending>,
    /// Post-handshake peers
    peers: HashMap<RepoId, Peer<UpgradedStream>>,
    /// Map from connection to repo ID (for resolving messages/closes)
    conn_id_to_peer: HashMap<ConnId, RepoId>,
    next_conn_id: ConnId,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl WebSocketServer {
    pub fn new(repo_id: RepoId) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            repo_id,
            pending: HashMap::new(),
            peers: HashMap::new(),
            conn_id_to_peer: HashMap::new(),
            next_conn_id: 1,
            event_tx,
            event_rx,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("WebSocket server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Take over an upgraded WebSocket. It stays pending until the peer
    /// sends `join`.
    pub fn add_connection(&mut self, ws: WebSocketStream<UpgradedStream>, addr: SocketAddr) {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        info!("New connection from {} (conn_id: {})", addr, conn_id);

        let conn = PeerConnection::new(conn_id, ws, self.event_tx.clone());
        self.pending.insert(
            conn_id,
            Pending {
                conn,
                opened: Instant::now(),
            },
        );
    }

    /// Close pending connections older than `max_age`.
    pub async fn expire_pending(&mut self, max_age: Duration) {
        let expired: Vec<ConnId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.opened.elapsed() >= max_age)
            .map(|(id, _)| *id)
            .collect();

        for conn_id in expired {
            if let Some(pending) = self.pending.remove(&conn_id) {
                warn!("No join on connection {} within {:?}, closing", conn_id, max_age);
                pending.conn.close().await;
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Wait for the next server event, encapsulating the handshake lifecycle.
    ///
    /// Connections that close before handshake are silently cleaned up.
    pub async fn poll_event(&mut self) -> Option<ServerEvent> {
        loop {
            let event = self.event_rx.recv().await?;

            match event {
                ConnectionEvent::Handshake { conn_id, message } => {
                    if let Some(peer_id) = self.on_handshake(conn_id, message).await {
                        return Some(ServerEvent::PeerConnected { peer_id });
                    }
                }
                ConnectionEvent::Message { conn_id, data } => {
                    match self.conn_id_to_peer.get(&conn_id) {
                        Some(peer_id) => {
                            return Some(ServerEvent::Message {
                                peer_id: *peer_id,
                                data,
                            });
                        }
                        None => debug!("Dropping message from {} before handshake", conn_id),
                    }
                }
                ConnectionEvent::Closed { conn_id } => {
                    if let Some(peer_id) = self.conn_id_to_peer.remove(&conn_id) {
                        // A newer connection may have taken over this repo ID
                        if self.peers.get(&peer_id).map(Peer::conn_id) == Some(conn_id) {
                            self.peers.remove(&peer_id);
                            return Some(ServerEvent::PeerDisconnected { peer_id });
                        }
                    } else {
                        self.pending.remove(&conn_id);
                        debug!("Connection closed before handshake: {}", conn_id);
                    }
                }
            }
        }
    }

    /// Complete a handshake. Returns the peer's ID once it is registered.
    async fn on_handshake(&mut self, conn_id: ConnId, message: HandshakeMessage) -> Option<RepoId> {
        let Some(Pending { conn, .. }) = self.pending.remove(&conn_id) else {
            warn!("Unexpected handshake on connection {}, ignoring", conn_id);
            return None;
        };

        let peer_id = match (&message, message.sender_id()) {
            (HandshakeMessage::Join { .. }, Some(peer_id)) if message.is_compatible() => peer_id,
            (HandshakeMessage::Join { .. }, _) => {
                warn!("Rejecting join on {}: no supported protocol version", conn_id);
                let _ = conn
                    .send_handshake(&HandshakeMessage::error("unsupported protocol version"))
                    .await;
                conn.close().await;
                return None;
            }
            _ => {
                warn!("Expected join on {}, got {:?}", conn_id, message);
                conn.close().await;
                return None;
            }
        };

        if let Err(e) = conn
            .send_handshake(&HandshakeMessage::peer(self.repo_id, peer_id))
            .await
        {
            error!("Failed to answer join from {}: {}", peer_id, e);
            return None;
        }

        debug!("Handshake complete: connection {} is {}", conn_id, peer_id);
        if let Some(old) = self.peers.insert(peer_id, conn.into_peer(peer_id)) {
            warn!("Peer {} reconnected, replacing connection {}", peer_id, old.conn_id());
            self.conn_id_to_peer.remove(&old.conn_id());
        }
        self.conn_id_to_peer.insert(conn_id, peer_id);
        Some(peer_id)
    }

    /// Send a raw frame to a peer.
    pub async fn send(&self, peer_id: RepoId, data: &[u8]) -> transport::Result<()> {
        let peer = self.peers.get(&peer_id).ok_or(TransportError::Closed)?;
        peer.send(data).await
    }

    /// Deliver a repo message to its target.
    pub async fn send_message(&self, msg: &RepoMessage) -> transport::Result<()> {
        let peer = self.peers.get(&msg.target_id).ok_or(TransportError::Closed)?;
        peer.send_message(msg).await
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn connected_peers(&self) -> Vec<RepoId> {
        self.peers.keys().copied().collect()
    }

    /// Close every connection.
    pub async fn close_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.conn.close().await;
        }
        for (_, peer) in self.peers.drain() {
            let _ = peer.close().await;
        }
        self.conn_id_to_peer.clear();
    }
}

/// Serve `repo` on `listener` until `shutdown` resolves.
///
/// Incoming frames feed the repo; the repo's outgoing queue is routed to the
/// connection of each message's target.
pub async fn run(
    listener: TcpListener,
    repo: Repo,
    mut outgoing: Outgoing,
    options: ServerOptions,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let mut server = WebSocketServer::new(repo.id());
    tokio::pin!(shutdown);

    info!(
        "Sync server {} ready on ws://{}{}",
        repo.id(),
        listener.local_addr()?,
        options.ws_path
    );

    let (upgrade_tx, mut upgrade_rx) = mpsc::unbounded_channel::<Upgrade>();
    let app = web::router(
        &options.ws_path,
        options.static_dir.clone(),
        options.handshake_timeout,
        upgrade_tx,
    );
    let http = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    });

    let mut sweep = tokio::time::interval(
        (options.handshake_timeout / 2).max(Duration::from_millis(10)),
    );

    loop {
        tokio::select! {
            Some(Upgrade { ws, addr }) = upgrade_rx.recv() => {
                server.add_connection(ws, addr);
            }

            Some(event) = server.poll_event() => {
                on_server_event(&repo, event);
            }

            Some(msg) = outgoing.next() => {
                if let Err(e) = server.send_message(&msg).await {
                    debug!("Dropping {} for {}: {}", msg.kind.as_str(), msg.target_id, e);
                }
            }

            _ = sweep.tick() => {
                server.expire_pending(options.handshake_timeout).await;
            }

            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    // Waiting on the aborted task releases the listening socket
    http.abort();
    match http.await {
        Ok(Err(e)) => error!("HTTP server failed: {}", e),
        Ok(Ok(())) | Err(_) => {}
    }

    server.close_all().await;
    Ok(())
}

fn on_server_event(repo: &Repo, event: ServerEvent) {
    match event {
        ServerEvent::PeerConnected { peer_id } => repo.peer_connected(peer_id),
        ServerEvent::Message { peer_id, data } => {
            let msg = match RepoMessage::from_json(&data) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("Undecodable message from {}: {}", peer_id, e);
                    return;
                }
            };
            if msg.sender_id != peer_id {
                warn!(
                    "Dropping message from {} claiming sender {}",
                    peer_id, msg.sender_id
                );
                return;
            }
            if let Err(e) = repo.receive_message(msg) {
                warn!("Failed to handle message from {}: {}", peer_id, e);
            }
        }
        ServerEvent::PeerDisconnected { peer_id } => repo.peer_disconnected(peer_id),
    }
}
