//! Individual WebSocket connection management.
//!
//! Each connection wraps a WebSocket stream, handling the split between read
//! and write halves for async operation. The same type serves accepted
//! sockets (server) and dialed sockets (client).

use async_trait::async_trait;
use docsync_core::protocol::{HandshakeMessage, MAX_MESSAGE_SIZE};
use docsync_core::transport::{self, Connection, TransportError};
use docsync_core::RepoId;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, warn};

/// Connection identifier, unique within one server or client.
pub type ConnId = u64;

/// Event emitted by a connection's read loop.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A join/peer/error handshake frame
    Handshake {
        conn_id: ConnId,
        message: HandshakeMessage,
    },
    /// Any other frame, undecoded
    Message { conn_id: ConnId, data: Vec<u8> },
    /// Connection was closed
    Closed { conn_id: ConnId },
}

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;

/// A single WebSocket connection.
pub struct PeerConnection<S> {
    pub conn_id: ConnId,
    /// Write half of the WebSocket (wrapped for sharing across tasks)
    write: Arc<Mutex<WsSink<S>>>,
    /// Handle to the read task
    read_task: Option<JoinHandle<()>>,
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap a WebSocket stream and spawn its read loop.
    pub fn new(
        conn_id: ConnId,
        ws_stream: WebSocketStream<S>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();
        let read_task = tokio::spawn(async move {
            Self::read_loop(conn_id, read, event_tx).await;
        });

        Self {
            conn_id,
            write: Arc::new(Mutex::new(write)),
            read_task: Some(read_task),
        }
    }

    async fn read_loop(
        conn_id: ConnId,
        mut read: SplitStream<WebSocketStream<S>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Binary(data) => data.to_vec(),
                        Message::Text(text) => text.into_bytes(),
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            debug!(conn_id, "Received close frame");
                            break;
                        }
                        Message::Frame(_) => continue,
                    };

                    if data.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            conn_id,
                            size = data.len(),
                            max = MAX_MESSAGE_SIZE,
                            "Message exceeds max size, dropping"
                        );
                        continue;
                    }

                    let event = match HandshakeMessage::from_json(&data) {
                        Some(message) => ConnectionEvent::Handshake { conn_id, message },
                        None => ConnectionEvent::Message { conn_id, data },
                    };
                    if event_tx.send(event).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!(conn_id, "Connection closed");
                        }
                        _ => {
                            error!(conn_id, error = %e, "WebSocket error");
                        }
                    }
                    break;
                }
                None => {
                    debug!(conn_id, "Stream ended");
                    break;
                }
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed { conn_id });
    }

    /// Send one binary frame.
    pub async fn send(&self, data: &[u8]) -> transport::Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Binary(data.to_vec().into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    pub async fn send_handshake(&self, message: &HandshakeMessage) -> transport::Result<()> {
        self.send(&message.to_json()?).await
    }

    /// Send a close frame. The read loop ends when the peer acknowledges.
    pub async fn close(&self) {
        let mut write = self.write.lock().await;
        let _ = write.send(Message::Close(None)).await;
    }

    /// Bind this connection to the peer it handshaked with.
    pub fn into_peer(self, peer_id: RepoId) -> Peer<S> {
        Peer {
            peer_id,
            conn: self,
        }
    }
}

impl<S> Drop for PeerConnection<S> {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

/// A connection whose handshake completed.
pub struct Peer<S> {
    peer_id: RepoId,
    conn: PeerConnection<S>,
}

impl<S> Peer<S> {
    pub fn conn_id(&self) -> ConnId {
        self.conn.conn_id
    }
}

#[async_trait]
impl<S> Connection for Peer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn peer_id(&self) -> RepoId {
        self.peer_id
    }

    async fn send(&self, data: &[u8]) -> transport::Result<()> {
        self.conn.send(data).await
    }

    async fn close(&self) -> transport::Result<()> {
        self.conn.close().await;
        Ok(())
    }
}
