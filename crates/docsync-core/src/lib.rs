//! docsync-core: Shared Rust library for replicated documents using Loro CRDTs.
//!
//! This crate provides the core functionality for:
//! - A document repository with handles, readiness tracking and change notifications
//! - A key/value storage subsystem with incremental saves and compaction
//! - The join/peer handshake and repo message protocol
//! - Share policies deciding which documents are offered to which peers
//! - The counter demo application, independent of the platform it renders on
//!
//! The repository is sans-IO: transports feed it incoming [`RepoMessage`]s and
//! drain the [`Outgoing`] queue it returns from [`Repo::new`].

pub mod app;
pub mod document;
pub mod document_id;
pub mod events;
pub mod handle;
pub mod protocol;
pub mod repo;
pub mod repo_id;
pub mod share_policy;
pub mod storage;
pub mod transport;

pub use app::{AppError, DocumentIdSource, EchoApp, Location, UpdateOutcome, View};
pub use document::{DocMut, Document, DocumentError};
pub use document_id::{DocumentId, DocumentIdError};
pub use events::{DocEvent, EventBus, RepoEvent, Subscription};
pub use handle::{DocHandle, HandleStatus};
pub use protocol::{Frame, HandshakeMessage, MessageKind, ProtocolError, RepoMessage, SyncBody};
pub use repo::{Outgoing, Repo, RepoConfig, RepoError};
pub use repo_id::{RepoId, RepoIdError};
pub use share_policy::{FnSharePolicy, Permissive, ShareDecision, SharePolicy};
pub use storage::{DocStorage, InMemoryStorage, StorageAdapter, StorageError, StorageKey};
pub use transport::{Connection, TransportError};
