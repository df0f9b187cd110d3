//! Browser WebSocket client adapter.
//!
//! [`ServerLink`] holds the handshake state and routes frames into the repo;
//! it is plain Rust so it can be tested natively. The wasm32-only
//! `BrowserWebSocket` wires it to `web_sys::WebSocket` callbacks.

use docsync_core::protocol::{Frame, HandshakeMessage, ProtocolError};
use docsync_core::{Repo, RepoId, RepoMessage};
use tracing::{debug, error, info, warn};

/// Fixed endpoint of the sync server.
pub const SERVER_URL: &str = "ws://localhost:1323/ws";

/// Connection state toward the sync server.
pub struct ServerLink {
    repo: Repo,
    server_id: Option<RepoId>,
}

impl ServerLink {
    pub fn new(repo: Repo) -> Self {
        Self {
            repo,
            server_id: None,
        }
    }

    pub fn server_id(&self) -> Option<RepoId> {
        self.server_id
    }

    /// The `join` to send once the socket opens.
    pub fn join_frame(&self) -> Result<Vec<u8>, ProtocolError> {
        HandshakeMessage::join(self.repo.id()).to_json()
    }

    /// Handle one frame from the server.
    pub fn on_frame(&mut self, data: &[u8]) {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Undecodable frame from server: {}", e);
                return;
            }
        };

        match frame {
            Frame::Handshake(peer @ HandshakeMessage::Peer { .. }) => self.on_peer(peer),
            Frame::Handshake(HandshakeMessage::Error { message }) => {
                error!("Server rejected join: {}", message);
            }
            Frame::Handshake(other) => warn!("Unexpected handshake: {:?}", other),
            Frame::Repo(msg) => match self.server_id {
                Some(server) if msg.sender_id == server => {
                    if let Err(e) = self.repo.receive_message(msg) {
                        warn!("Failed to handle message: {}", e);
                    }
                }
                Some(_) => warn!("Dropping message claiming sender {}", msg.sender_id),
                None => debug!("Dropping message received before handshake"),
            },
        }
    }

    fn on_peer(&mut self, peer: HandshakeMessage) {
        if !peer.is_compatible() {
            error!("Server selected an unsupported protocol version: {:?}", peer);
            return;
        }
        let HandshakeMessage::Peer {
            sender_id,
            target_id,
            ..
        } = peer
        else {
            return;
        };
        if target_id != self.repo.id() {
            warn!("Server addressed {} but we are {}", target_id, self.repo.id());
        }
        info!("Connected to sync server {}", sender_id);
        self.server_id = Some(sender_id);
        self.repo.peer_connected(sender_id);
    }

    /// The socket closed.
    pub fn on_close(&mut self) {
        if let Some(server) = self.server_id.take() {
            info!("Disconnected from sync server {}", server);
            self.repo.peer_disconnected(server);
        }
    }

    /// Whether `msg` can go out on the current socket.
    pub fn routes(&self, msg: &RepoMessage) -> bool {
        self.server_id == Some(msg.target_id)
    }
}

#[cfg(target_arch = "wasm32")]
pub use browser::BrowserWebSocket;

#[cfg(target_arch = "wasm32")]
mod browser {
    use super::*;
    use docsync_core::Outgoing;
    use futures::StreamExt;
    use std::cell::RefCell;
    use std::rc::Rc;
    use wasm_bindgen::prelude::*;
    use wasm_bindgen::JsCast;
    use web_sys::{BinaryType, CloseEvent, Event, MessageEvent, WebSocket};

    struct Inner {
        socket: WebSocket,
        link: RefCell<ServerLink>,
    }

    /// One WebSocket to the sync server. The page keeps this alive.
    ///
    /// Closed sockets are not reopened; reloading the page reconnects.
    pub struct BrowserWebSocket {
        inner: Rc<Inner>,
        _on_open: Closure<dyn FnMut(Event)>,
        _on_message: Closure<dyn FnMut(MessageEvent)>,
        _on_close: Closure<dyn FnMut(CloseEvent)>,
    }

    impl BrowserWebSocket {
        /// Open the socket and start draining the repo's outgoing queue.
        pub fn connect(url: &str, repo: Repo, outgoing: Outgoing) -> Result<Self, JsValue> {
            let socket = WebSocket::new(url)?;
            socket.set_binary_type(BinaryType::Arraybuffer);

            let inner = Rc::new(Inner {
                socket,
                link: RefCell::new(ServerLink::new(repo)),
            });

            let on_open = {
                let inner = Rc::clone(&inner);
                Closure::<dyn FnMut(Event)>::new(move |_: Event| {
                    let join = match inner.link.borrow().join_frame() {
                        Ok(join) => join,
                        Err(e) => {
                            error!("Failed to encode join: {}", e);
                            return;
                        }
                    };
                    if let Err(e) = inner.socket.send_with_u8_array(&join) {
                        error!("Failed to send join: {:?}", e);
                    }
                })
            };

            let on_message = {
                let inner = Rc::clone(&inner);
                Closure::<dyn FnMut(MessageEvent)>::new(move |event: MessageEvent| {
                    let data = event.data();
                    let bytes = if let Ok(buffer) = data.dyn_into::<js_sys::ArrayBuffer>() {
                        js_sys::Uint8Array::new(&buffer).to_vec()
                    } else if let Some(text) = event.data().as_string() {
                        text.into_bytes()
                    } else {
                        warn!("Ignoring non-binary frame");
                        return;
                    };
                    inner.link.borrow_mut().on_frame(&bytes);
                })
            };

            let on_close = {
                let inner = Rc::clone(&inner);
                Closure::<dyn FnMut(CloseEvent)>::new(move |event: CloseEvent| {
                    debug!(code = event.code(), "Socket closed");
                    inner.link.borrow_mut().on_close();
                })
            };

            inner
                .socket
                .set_onopen(Some(on_open.as_ref().unchecked_ref()));
            inner
                .socket
                .set_onmessage(Some(on_message.as_ref().unchecked_ref()));
            inner
                .socket
                .set_onclose(Some(on_close.as_ref().unchecked_ref()));

            wasm_bindgen_futures::spawn_local(Self::drain(Rc::clone(&inner), outgoing));

            Ok(Self {
                inner,
                _on_open: on_open,
                _on_message: on_message,
                _on_close: on_close,
            })
        }

        async fn drain(inner: Rc<Inner>, mut outgoing: Outgoing) {
            while let Some(msg) = outgoing.next().await {
                let open = inner.socket.ready_state() == WebSocket::OPEN;
                if !open || !inner.link.borrow().routes(&msg) {
                    debug!("No connection for {}, dropping {}", msg.target_id, msg.kind.as_str());
                    continue;
                }
                let data = match msg.to_json() {
                    Ok(data) => data,
                    Err(e) => {
                        error!("Failed to encode {}: {}", msg.kind.as_str(), e);
                        continue;
                    }
                };
                if let Err(e) = inner.socket.send_with_u8_array(&data) {
                    warn!("Failed to send {}: {:?}", msg.kind.as_str(), e);
                }
            }
        }

        pub fn server_id(&self) -> Option<RepoId> {
            self.inner.link.borrow().server_id()
        }
    }

    impl Drop for BrowserWebSocket {
        fn drop(&mut self) {
            self.inner.socket.set_onopen(None);
            self.inner.socket.set_onmessage(None);
            self.inner.socket.set_onclose(None);
            let _ = self.inner.socket.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::{MessageKind, RepoConfig, SyncBody};
    use futures::StreamExt;

    fn server_id() -> RepoId {
        RepoId::from(0xabcd_u64)
    }

    #[test]
    fn test_join_frame() {
        let (repo, _outgoing) = Repo::new(RepoConfig::new());
        let link = ServerLink::new(repo.clone());

        let join = HandshakeMessage::from_json(&link.join_frame().unwrap()).unwrap();
        assert_eq!(join, HandshakeMessage::join(repo.id()));
    }

    #[test]
    fn test_peer_reply_connects_repo() {
        let (repo, _outgoing) = Repo::new(RepoConfig::new());
        let mut link = ServerLink::new(repo.clone());

        let peer = HandshakeMessage::peer(server_id(), repo.id());
        link.on_frame(&peer.to_json().unwrap());

        assert_eq!(link.server_id(), Some(server_id()));
        assert_eq!(repo.peers(), vec![server_id()]);

        link.on_close();
        assert!(repo.peers().is_empty());
        assert_eq!(link.server_id(), None);
    }

    #[test]
    fn test_incompatible_peer_reply_ignored() {
        let (repo, _outgoing) = Repo::new(RepoConfig::new());
        let mut link = ServerLink::new(repo.clone());

        let peer = HandshakeMessage::Peer {
            sender_id: server_id(),
            selected_protocol_version: "99".into(),
            target_id: repo.id(),
        };
        link.on_frame(&peer.to_json().unwrap());

        assert_eq!(link.server_id(), None);
        assert!(repo.peers().is_empty());
    }

    #[test]
    fn test_ready_document_announced_on_connect() {
        let (repo, mut outgoing) = Repo::new(RepoConfig::new());
        let handle = repo.create().unwrap();
        let mut link = ServerLink::new(repo.clone());

        link.on_frame(&HandshakeMessage::peer(server_id(), repo.id()).to_json().unwrap());

        let msg = futures::executor::block_on(outgoing.next()).unwrap();
        assert_eq!(msg.kind, MessageKind::Sync);
        assert_eq!(&msg.document_id, handle.id());
        assert!(link.routes(&msg));
    }

    #[test]
    fn test_messages_need_handshake_and_matching_sender() {
        let (repo, _outgoing) = Repo::new(RepoConfig::new());
        let mut link = ServerLink::new(repo.clone());
        let doc_id = docsync_core::DocumentId::generate();
        let body = SyncBody::new(&Default::default(), Vec::new()).encode().unwrap();
        let sync = |sender| {
            RepoMessage::new(MessageKind::Sync, sender, repo.id(), doc_id.clone(), body.clone())
                .to_json()
                .unwrap()
        };

        link.on_frame(&sync(server_id()));
        assert!(repo.get(&doc_id).is_none());

        link.on_frame(&HandshakeMessage::peer(server_id(), repo.id()).to_json().unwrap());
        link.on_frame(&sync(RepoId::from(0x1234_u64)));
        assert!(repo.get(&doc_id).is_none());

        link.on_frame(&sync(server_id()));
        assert!(repo.get(&doc_id).is_some());
    }

    #[test]
    fn test_garbage_frame_ignored() {
        let (repo, _outgoing) = Repo::new(RepoConfig::new());
        let mut link = ServerLink::new(repo);
        link.on_frame(b"not json");
        assert_eq!(link.server_id(), None);
    }
}
