//! docsync-server: native WebSocket transport for docsync repositories.
//!
//! Provides the sync server (`docsync serve`, which also serves the built
//! page), a reconnecting client with a
//! terminal rendition of the counter page (`docsync client`), and a
//! filesystem storage adapter.

pub mod client;
pub mod config;
pub mod connection;
pub mod fs_storage;
pub mod outgoing;
pub mod server;
pub mod web;

pub use client::{run_terminal, SyncClient, TerminalLocation, TerminalOptions, TerminalView};
pub use config::Config;
pub use connection::{ConnId, ConnectionEvent, Peer, PeerConnection};
pub use fs_storage::FsStorage;
pub use outgoing::{OutgoingConnection, OutgoingState, ReconnectConfig};
pub use server::{ServerEvent, ServerOptions, WebSocketServer};
