//! DocHandle: a local reference to one replicated document.
//!
//! Handles are cheap to clone; every clone refers to the same document,
//! status and subscriber list. Mutations go through [`DocHandle::change`],
//! which persists, notifies and queues sync messages in one step.

use crate::document::{self, DocMut, Document};
use crate::document_id::DocumentId;
use crate::events::{DocEvent, EventBus, Subscription};
use crate::repo::{RepoError, Shared};
use crate::repo_id::RepoId;
use futures::channel::oneshot;
use loro::VersionVector;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Lifecycle of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleStatus {
    /// Being read from storage.
    Loading,
    /// Not available locally; waiting for a peer to send it.
    Requesting,
    /// Content available; changes accepted.
    Ready,
    /// Every connected peer reported it does not have the document.
    Unavailable,
    /// Removed from the repository.
    Deleted,
}

impl HandleStatus {
    /// Whether waiting longer cannot change the outcome without new peers.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Ready | Self::Unavailable | Self::Deleted)
    }
}

impl fmt::Display for HandleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Loading => "loading",
            Self::Requesting => "requesting",
            Self::Ready => "ready",
            Self::Unavailable => "unavailable",
            Self::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

pub(crate) struct HandleInner {
    id: DocumentId,
    doc: Document,
    status: Mutex<HandleStatus>,
    events: Arc<EventBus<DocEvent>>,
    change_waiters: Mutex<Vec<oneshot::Sender<serde_json::Value>>>,
    status_waiters: Mutex<Vec<oneshot::Sender<HandleStatus>>>,
    unavailable_from: Mutex<HashSet<RepoId>>,
}

#[derive(Clone)]
pub struct DocHandle {
    inner: Arc<HandleInner>,
    shared: Arc<Shared>,
}

impl fmt::Debug for DocHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocHandle")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

impl DocHandle {
    pub(crate) fn new(
        id: DocumentId,
        doc: Document,
        status: HandleStatus,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                doc,
                status: Mutex::new(status),
                events: Arc::new(EventBus::new()),
                change_waiters: Mutex::new(Vec::new()),
                status_waiters: Mutex::new(Vec::new()),
                unavailable_from: Mutex::new(HashSet::new()),
            }),
            shared,
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.inner.id
    }

    pub fn status(&self) -> HandleStatus {
        *self.inner.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_ready(&self) -> bool {
        self.status() == HandleStatus::Ready
    }

    /// The root map as JSON.
    pub fn value(&self) -> serde_json::Value {
        self.inner.doc.to_json()
    }

    /// Read access to the underlying document.
    pub fn with_doc<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        f(&self.inner.doc)
    }

    /// Apply a local mutation.
    ///
    /// Rejected with [`RepoError::NotReady`] unless the handle is ready. When
    /// the callback edits something, the change is persisted, exactly one
    /// [`DocEvent::Changed`] is emitted, `changed()` waiters wake, and sync
    /// messages are queued for peers the share policy allows.
    pub fn change<R>(
        &self,
        f: impl FnOnce(&DocMut<'_>) -> document::Result<R>,
    ) -> Result<R, RepoError> {
        if !self.is_ready() {
            return Err(RepoError::NotReady(self.inner.id.clone()));
        }

        let before = self.inner.doc.version();
        let (out, changed) = self.inner.doc.change(f)?;
        if changed {
            tracing::debug!(doc = %self.inner.id, "Local change");
            self.shared.persist(&self.inner.id, &self.inner.doc, &before);
            self.notify_changed();
            self.shared.broadcast_local(self);
        }
        Ok(out)
    }

    /// Subscribe to change notifications. Unsubscribes when dropped.
    pub fn on_change(&self, callback: impl Fn(DocEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.events.subscribe(callback)
    }

    /// Resolves with the document value after the next change.
    ///
    /// Resolves to `None` if the handle is deleted first.
    pub fn changed(&self) -> impl std::future::Future<Output = Option<serde_json::Value>> + use<> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .change_waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        async move { rx.await.ok() }
    }

    /// Wait until the handle is ready, unavailable or deleted.
    pub async fn when_ready(&self) -> HandleStatus {
        loop {
            let rx = {
                let status = self.status();
                if status.is_settled() {
                    return status;
                }
                let (tx, rx) = oneshot::channel();
                self.inner
                    .status_waiters
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(tx);
                rx
            };
            // A dropped sender means a transition happened between checks; recheck
            let _ = rx.await;
        }
    }

    pub(crate) fn doc(&self) -> &Document {
        &self.inner.doc
    }

    pub(crate) fn set_status(&self, status: HandleStatus) {
        let previous = {
            let mut current = self.inner.status.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *current, status)
        };
        if previous == status {
            return;
        }
        tracing::debug!(doc = %self.inner.id, from = %previous, to = %status, "Handle status");

        if status == HandleStatus::Requesting {
            self.inner
                .unavailable_from
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
        }

        let waiters: Vec<_> = std::mem::take(
            &mut *self
                .inner
                .status_waiters
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for waiter in waiters {
            let _ = waiter.send(status);
        }

        if status == HandleStatus::Deleted {
            // Wake change waiters with None
            self.inner
                .change_waiters
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
            self.inner.events.emit(DocEvent::Deleted {
                document_id: self.inner.id.clone(),
            });
        }
    }

    /// Import updates received from `from`. Returns the version before the
    /// import if anything changed.
    pub(crate) fn import_remote(
        &self,
        updates: &[u8],
        from: RepoId,
    ) -> Result<Option<VersionVector>, RepoError> {
        let before = self.inner.doc.version();
        if !self.inner.doc.import(updates)? {
            return Ok(None);
        }
        tracing::debug!(doc = %self.inner.id, peer = %from, "Imported remote changes");
        if self.status() != HandleStatus::Deleted {
            self.set_status(HandleStatus::Ready);
        }
        Ok(Some(before))
    }

    /// Record that `peer` does not have the document. Returns true once every
    /// peer in `connected` has said so.
    pub(crate) fn mark_unavailable_from(&self, peer: RepoId, connected: &[RepoId]) -> bool {
        let mut from = self
            .inner
            .unavailable_from
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        from.insert(peer);
        Self::all_reported(&from, connected)
    }

    /// Whether every peer in `connected` already reported unavailable.
    pub(crate) fn unavailable_everywhere(&self, connected: &[RepoId]) -> bool {
        let from = self
            .inner
            .unavailable_from
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Self::all_reported(&from, connected)
    }

    fn all_reported(from: &HashSet<RepoId>, connected: &[RepoId]) -> bool {
        !connected.is_empty() && connected.iter().all(|p| from.contains(p))
    }

    pub(crate) fn notify_changed(&self) {
        let value = self.inner.doc.to_json();
        let waiters: Vec<_> = std::mem::take(
            &mut *self
                .inner
                .change_waiters
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for waiter in waiters {
            let _ = waiter.send(value.clone());
        }
        self.inner.events.emit(DocEvent::Changed {
            document_id: self.inner.id.clone(),
            value,
        });
    }
}
