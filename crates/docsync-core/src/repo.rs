//! Repo: the collection of document handles and the sync state machine.
//!
//! The repo is sans-IO. Transports call [`Repo::peer_connected`],
//! [`Repo::receive_message`] and [`Repo::peer_disconnected`], and drain the
//! [`Outgoing`] queue returned by [`Repo::new`], delivering each message to
//! the connection of its `target_id`.
//!
//! Per peer the repo remembers the last version vector it knows the peer
//! has for each document, so only missing operations are sent.

use crate::document::{Document, DocumentError};
use crate::document_id::DocumentId;
use crate::events::{EventBus, RepoEvent, Subscription};
use crate::handle::{DocHandle, HandleStatus};
use crate::protocol::{MessageKind, ProtocolError, RepoMessage, SyncBody};
use crate::repo_id::RepoId;
use crate::share_policy::{Permissive, SharePolicy};
use crate::storage::{DocStorage, StorageAdapter, StorageError};
use futures::channel::mpsc;
use loro::VersionVector;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Messages the repo wants delivered, in order.
pub type Outgoing = mpsc::UnboundedReceiver<RepoMessage>;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("Document {0} is not ready")]
    NotReady(DocumentId),

    #[error("Document {0} is already open")]
    AlreadyExists(DocumentId),

    #[error("Document {0} is not open")]
    NotFound(DocumentId),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub type Result<T> = std::result::Result<T, RepoError>;

/// Construction options for a [`Repo`].
pub struct RepoConfig {
    /// Fixed identity; generated when `None`.
    pub id: Option<RepoId>,
    pub storage: Option<Arc<dyn StorageAdapter>>,
    pub share_policy: Arc<dyn SharePolicy>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            id: None,
            storage: None,
            share_policy: Arc::new(Permissive),
        }
    }
}

impl RepoConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: RepoId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_share_policy(mut self, policy: Arc<dyn SharePolicy>) -> Self {
        self.share_policy = policy;
        self
    }
}

#[derive(Default)]
struct PeerState {
    /// Latest version vector we believe the peer holds, per document.
    known: HashMap<DocumentId, VersionVector>,
}

/// State shared between the repo and its handles.
pub(crate) struct Shared {
    id: RepoId,
    storage: Option<DocStorage>,
    share_policy: Arc<dyn SharePolicy>,
    peers: Mutex<HashMap<RepoId, PeerState>>,
    outgoing: mpsc::UnboundedSender<RepoMessage>,
    events: Arc<EventBus<RepoEvent>>,
}

impl Shared {
    fn send(&self, msg: RepoMessage) {
        tracing::trace!(kind = msg.kind.as_str(), doc = %msg.document_id, to = %msg.target_id, "Queue message");
        if self.outgoing.unbounded_send(msg).is_err() {
            tracing::debug!("Outgoing queue closed, dropping message");
        }
    }

    fn connected_peers(&self) -> Vec<RepoId> {
        let mut peers: Vec<_> = self
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        peers.sort();
        peers
    }

    fn known_version(&self, peer: RepoId, doc: &DocumentId) -> VersionVector {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&peer)
            .and_then(|state| state.known.get(doc).cloned())
            .unwrap_or_default()
    }

    fn record_known(&self, peer: RepoId, doc: &DocumentId, version: &VersionVector) {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = peers.get_mut(&peer) {
            state
                .known
                .entry(doc.clone())
                .and_modify(|known| known.merge(version))
                .or_insert_with(|| version.clone());
        }
    }

    /// Peers other than `except` that have shown interest in `doc`.
    fn interested_peers(&self, doc: &DocumentId, except: RepoId) -> Vec<RepoId> {
        let mut peers: Vec<_> = self
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(peer, state)| **peer != except && state.known.contains_key(doc))
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort();
        peers
    }

    pub(crate) fn persist(&self, id: &DocumentId, doc: &Document, since: &VersionVector) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save_doc(id, doc, since) {
                tracing::error!(doc = %id, error = %e, "Failed to persist document");
            }
        }
    }

    /// Send `peer` whatever it lacks of the handle's document.
    fn send_sync(&self, handle: &DocHandle, peer: RepoId) -> Result<()> {
        let known = self.known_version(peer, handle.id());
        let ours = handle.doc().version();
        let updates = if known.includes_vv(&ours) {
            Vec::new()
        } else {
            handle.doc().export_updates(&known)?
        };
        let body = SyncBody::new(&ours, updates).encode()?;
        self.record_known(peer, handle.id(), &ours);
        self.send(RepoMessage::new(
            MessageKind::Sync,
            self.id,
            peer,
            handle.id().clone(),
            body,
        ));
        Ok(())
    }

    fn send_request(&self, handle: &DocHandle, peer: RepoId) -> Result<()> {
        let body = SyncBody::new(&handle.doc().version(), Vec::new()).encode()?;
        self.send(RepoMessage::new(
            MessageKind::Request,
            self.id,
            peer,
            handle.id().clone(),
            body,
        ));
        Ok(())
    }

    /// Queue a local change for every connected peer the policy allows.
    pub(crate) fn broadcast_local(&self, handle: &DocHandle) {
        for peer in self.connected_peers() {
            if !self.share_policy.should_sync(handle.id(), peer).is_share() {
                continue;
            }
            if let Err(e) = self.send_sync(handle, peer) {
                tracing::warn!(doc = %handle.id(), peer = %peer, error = %e, "Failed to queue sync");
            }
        }
    }

    /// Forward changes received from `from` to the other interested peers.
    fn relay(&self, handle: &DocHandle, from: RepoId) {
        for peer in self.interested_peers(handle.id(), from) {
            if !self.share_policy.should_sync(handle.id(), peer).is_share() {
                continue;
            }
            if let Err(e) = self.send_sync(handle, peer) {
                tracing::warn!(doc = %handle.id(), peer = %peer, error = %e, "Failed to relay sync");
            }
        }
    }
}

/// A collection of replicated documents.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct Repo {
    shared: Arc<Shared>,
    handles: Arc<Mutex<HashMap<DocumentId, DocHandle>>>,
}

impl Repo {
    /// Create a repo and the queue of messages it produces.
    pub fn new(config: RepoConfig) -> (Self, Outgoing) {
        let (tx, rx) = mpsc::unbounded();
        let id = config.id.unwrap_or_else(RepoId::generate);
        tracing::debug!(repo = %id, persistent = config.storage.is_some(), "Creating repo");
        let repo = Self {
            shared: Arc::new(Shared {
                id,
                storage: config.storage.map(DocStorage::new),
                share_policy: config.share_policy,
                peers: Mutex::new(HashMap::new()),
                outgoing: tx,
                events: Arc::new(EventBus::new()),
            }),
            handles: Arc::new(Mutex::new(HashMap::new())),
        };
        (repo, rx)
    }

    pub fn id(&self) -> RepoId {
        self.shared.id
    }

    /// Subscribe to repo events. Unsubscribes when dropped.
    pub fn on_event(&self, callback: impl Fn(RepoEvent) + Send + Sync + 'static) -> Subscription {
        self.shared.events.subscribe(callback)
    }

    /// All open handles.
    pub fn handles(&self) -> Vec<DocHandle> {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Peers currently connected, sorted.
    pub fn peers(&self) -> Vec<RepoId> {
        self.shared.connected_peers()
    }

    /// Ids of every persisted document (empty without storage).
    pub fn stored_documents(&self) -> Result<Vec<DocumentId>> {
        match &self.shared.storage {
            Some(storage) => Ok(storage.list_documents()?),
            None => Ok(Vec::new()),
        }
    }

    /// Create a new document with a generated id.
    pub fn create(&self) -> Result<DocHandle> {
        self.create_with_id(DocumentId::generate())
    }

    /// Create a new, empty, ready document under `id`.
    pub fn create_with_id(&self, id: DocumentId) -> Result<DocHandle> {
        let handle = {
            let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            if handles.contains_key(&id) {
                return Err(RepoError::AlreadyExists(id));
            }
            let handle = DocHandle::new(
                id.clone(),
                Document::new(),
                HandleStatus::Ready,
                Arc::clone(&self.shared),
            );
            handles.insert(id, handle.clone());
            handle
        };
        tracing::info!(doc = %handle.id(), "Created document");
        self.announce(&handle);
        Ok(handle)
    }

    /// Open a document: an already open handle, else storage, else peers.
    ///
    /// A document found nowhere yields a `Requesting` handle that becomes
    /// ready when a peer sends it.
    pub fn find(&self, id: &DocumentId) -> Result<DocHandle> {
        if let Some(handle) = self.get(id) {
            return Ok(handle);
        }
        if let Some(handle) = self.open_stored(id)? {
            return Ok(handle);
        }

        let handle = self.insert_handle(id, Document::new(), HandleStatus::Requesting);
        tracing::info!(doc = %id, "Requesting document from peers");
        self.request_from_peers(&handle);
        Ok(handle)
    }

    /// An open handle, without touching storage or peers.
    pub fn get(&self, id: &DocumentId) -> Option<DocHandle> {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Close and forget a document, removing it from storage.
    pub fn delete(&self, id: &DocumentId) -> Result<()> {
        let handle = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        if let Some(storage) = &self.shared.storage {
            storage.remove_doc(id)?;
        }
        match handle {
            Some(handle) => {
                handle.set_status(HandleStatus::Deleted);
                tracing::info!(doc = %id, "Deleted document");
                Ok(())
            }
            None => Err(RepoError::NotFound(id.clone())),
        }
    }

    /// Register a newly connected peer and start syncing with it.
    pub fn peer_connected(&self, peer: RepoId) {
        {
            let mut peers = self.shared.peers.lock().unwrap_or_else(|e| e.into_inner());
            if peers.insert(peer, PeerState::default()).is_some() {
                tracing::debug!(peer = %peer, "Peer reconnected, resetting sync state");
            }
        }
        tracing::info!(peer = %peer, "Peer connected");
        self.shared.events.emit(RepoEvent::PeerConnected { peer });

        let policy = &self.shared.share_policy;
        for handle in self.handles() {
            let result = match handle.status() {
                HandleStatus::Ready => {
                    if policy.should_announce(handle.id(), peer).is_share()
                        && policy.should_sync(handle.id(), peer).is_share()
                    {
                        self.shared.send_sync(&handle, peer)
                    } else {
                        Ok(())
                    }
                }
                HandleStatus::Requesting | HandleStatus::Unavailable => {
                    if policy.should_request(handle.id(), peer).is_share() {
                        handle.set_status(HandleStatus::Requesting);
                        self.shared.send_request(&handle, peer)
                    } else {
                        Ok(())
                    }
                }
                HandleStatus::Loading | HandleStatus::Deleted => Ok(()),
            };
            if let Err(e) = result {
                tracing::warn!(doc = %handle.id(), peer = %peer, error = %e, "Failed to start sync");
            }
        }
    }

    /// Forget a peer's sync state.
    pub fn peer_disconnected(&self, peer: RepoId) {
        let removed = self
            .shared
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&peer)
            .is_some();
        if !removed {
            return;
        }
        tracing::info!(peer = %peer, "Peer disconnected");
        self.shared.events.emit(RepoEvent::PeerDisconnected { peer });

        // The remaining peers may all have declined already
        let connected = self.shared.connected_peers();
        for handle in self.handles() {
            if handle.status() == HandleStatus::Requesting && handle.unavailable_everywhere(&connected) {
                handle.set_status(HandleStatus::Unavailable);
            }
        }
    }

    /// Handle one message from a peer.
    pub fn receive_message(&self, msg: RepoMessage) -> Result<()> {
        if msg.target_id != self.shared.id {
            tracing::debug!(to = %msg.target_id, "Ignoring message addressed to another repo");
            return Ok(());
        }
        tracing::trace!(kind = msg.kind.as_str(), doc = %msg.document_id, from = %msg.sender_id, "Received message");

        match msg.kind {
            MessageKind::Request => self.on_request(msg),
            MessageKind::Sync => self.on_sync(msg),
            MessageKind::DocUnavailable => {
                self.on_unavailable(msg);
                Ok(())
            }
            MessageKind::Ephemeral => {
                self.shared.events.emit(RepoEvent::Ephemeral {
                    sender: msg.sender_id,
                    document_id: msg.document_id,
                    data: msg.message,
                });
                Ok(())
            }
        }
    }

    /// Send transient data about `doc` to every peer allowed to sync it.
    pub fn broadcast_ephemeral(&self, doc: &DocumentId, data: &[u8]) {
        for peer in self.shared.connected_peers() {
            if self.shared.share_policy.should_sync(doc, peer).is_share() {
                self.shared.send(RepoMessage::new(
                    MessageKind::Ephemeral,
                    self.shared.id,
                    peer,
                    doc.clone(),
                    data.to_vec(),
                ));
            }
        }
    }

    fn on_request(&self, msg: RepoMessage) -> Result<()> {
        let peer = msg.sender_id;
        let doc_id = msg.document_id;
        let their_version = msg_version(&msg.message)?;
        // Remember the interest so later changes are relayed
        self.shared.record_known(peer, &doc_id, &their_version);

        let handle = match self.get(&doc_id) {
            Some(handle) => Some(handle),
            None => self.open_stored(&doc_id)?,
        };
        let shareable = self.shared.share_policy.should_sync(&doc_id, peer).is_share();

        match handle {
            Some(handle) if handle.is_ready() && shareable => self.shared.send_sync(&handle, peer),
            _ => {
                tracing::debug!(doc = %doc_id, peer = %peer, "Document unavailable for request");
                self.shared.send(RepoMessage::new(
                    MessageKind::DocUnavailable,
                    self.shared.id,
                    peer,
                    doc_id,
                    Vec::new(),
                ));
                Ok(())
            }
        }
    }

    fn on_sync(&self, msg: RepoMessage) -> Result<()> {
        let peer = msg.sender_id;
        let doc_id = msg.document_id;
        if !self.shared.share_policy.should_sync(&doc_id, peer).is_share() {
            tracing::debug!(doc = %doc_id, peer = %peer, "Share policy denies sync, ignoring");
            return Ok(());
        }

        let body = SyncBody::decode(&msg.message)?;
        let their_version = body.version_vector()?;

        let handle = match self.get(&doc_id) {
            Some(handle) => handle,
            None => match self.open_stored(&doc_id)? {
                Some(handle) => handle,
                None => self.insert_handle(&doc_id, Document::new(), HandleStatus::Requesting),
            },
        };
        self.shared.record_known(peer, &doc_id, &their_version);

        if let Some(before) = handle.import_remote(&body.updates, peer)? {
            self.shared.persist(&doc_id, handle.doc(), &before);
            handle.notify_changed();
            self.shared.relay(&handle, peer);
        }

        let ours = handle.doc().version();
        if !their_version.includes_vv(&ours) {
            self.shared.send_sync(&handle, peer)?;
        } else if !ours.includes_vv(&their_version) {
            // Tell the sender what we have so it sends the rest
            let body = SyncBody::new(&ours, Vec::new()).encode()?;
            self.shared.send(RepoMessage::new(
                MessageKind::Sync,
                self.shared.id,
                peer,
                doc_id,
                body,
            ));
        }
        Ok(())
    }

    fn on_unavailable(&self, msg: RepoMessage) {
        let Some(handle) = self.get(&msg.document_id) else {
            return;
        };
        if handle.status() != HandleStatus::Requesting {
            return;
        }
        let connected = self.shared.connected_peers();
        if handle.mark_unavailable_from(msg.sender_id, &connected) {
            tracing::info!(doc = %msg.document_id, "Document unavailable from all peers");
            handle.set_status(HandleStatus::Unavailable);
        }
    }

    fn announce(&self, handle: &DocHandle) {
        let policy = &self.shared.share_policy;
        for peer in self.shared.connected_peers() {
            if policy.should_announce(handle.id(), peer).is_share()
                && policy.should_sync(handle.id(), peer).is_share()
            {
                if let Err(e) = self.shared.send_sync(handle, peer) {
                    tracing::warn!(doc = %handle.id(), peer = %peer, error = %e, "Failed to announce");
                }
            }
        }
    }

    fn request_from_peers(&self, handle: &DocHandle) {
        for peer in self.shared.connected_peers() {
            if !self.shared.share_policy.should_request(handle.id(), peer).is_share() {
                continue;
            }
            if let Err(e) = self.shared.send_request(handle, peer) {
                tracing::warn!(doc = %handle.id(), peer = %peer, error = %e, "Failed to request");
            }
        }
    }

    /// Open a handle from storage if anything is stored for `id`.
    fn open_stored(&self, id: &DocumentId) -> Result<Option<DocHandle>> {
        let Some(storage) = &self.shared.storage else {
            return Ok(None);
        };
        let Some(doc) = storage.load_doc(id)? else {
            return Ok(None);
        };
        tracing::info!(doc = %id, "Loaded document from storage");
        Ok(Some(self.insert_handle(id, doc, HandleStatus::Ready)))
    }

    /// Insert a handle unless another caller got there first.
    fn insert_handle(&self, id: &DocumentId, doc: Document, status: HandleStatus) -> DocHandle {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles
            .entry(id.clone())
            .or_insert_with(|| DocHandle::new(id.clone(), doc, status, Arc::clone(&self.shared)))
            .clone()
    }
}

fn msg_version(message: &[u8]) -> Result<VersionVector> {
    Ok(SyncBody::decode(message)?.version_vector()?)
}
