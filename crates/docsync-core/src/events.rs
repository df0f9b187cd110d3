//! Event infrastructure for docsync-core.
//!
//! Provides `DocEvent` (per-document notifications), `RepoEvent`
//! (repository-wide notifications) and a generic `EventBus` for subscriptions.
//! The bus is `Send + Sync` on every target; the browser build simply never
//! crosses threads.

use crate::document_id::DocumentId;
use crate::repo_id::RepoId;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Notifications emitted by a document handle.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DocEvent {
    /// The document's content changed, locally or through sync.
    Changed {
        #[serde(rename = "documentId")]
        document_id: DocumentId,
        /// Root map after the change.
        value: serde_json::Value,
    },
    /// The document was removed from the repository.
    Deleted {
        #[serde(rename = "documentId")]
        document_id: DocumentId,
    },
}

/// Notifications emitted by the repository.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RepoEvent {
    PeerConnected {
        peer: RepoId,
    },
    PeerDisconnected {
        peer: RepoId,
    },
    /// Transient data broadcast by a peer; never persisted.
    Ephemeral {
        sender: RepoId,
        #[serde(rename = "documentId")]
        document_id: DocumentId,
        data: Vec<u8>,
    },
}

type Callback<E> = Arc<dyn Fn(E) + Send + Sync>;

trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, id: usize);
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    bus: Weak<dyn Unsubscribe>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus<E> {
    callbacks: RwLock<Vec<(usize, Callback<E>)>>,
    next_id: AtomicUsize,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(E) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        let weak: Weak<dyn Unsubscribe> = Arc::downgrade(self) as Weak<dyn Unsubscribe>;
        Subscription { bus: weak, id }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: E) {
        // Snapshot so callbacks may subscribe or unsubscribe while running
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl<E: Send + 'static> Unsubscribe for EventBus<E> {
    fn unsubscribe(&self, id: usize) {
        // emit releases the lock before running callbacks, so this cannot
        // wait on a callback that drops its own subscription
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }
}
