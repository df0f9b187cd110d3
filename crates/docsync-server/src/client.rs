//! Native sync client and the terminal rendition of the counter page.
//!
//! [`SyncClient`] keeps one outgoing connection to the server alive, feeding
//! frames to the repo and draining its outgoing queue. [`run_terminal`] puts
//! the counter page on top of it, reading button clicks from stdin.

use crate::connection::{ConnId, ConnectionEvent};
use crate::outgoing::{OutgoingConnection, OutgoingState, ReconnectConfig};
use anyhow::{bail, Result};
use docsync_core::app::render_document;
use docsync_core::{EchoApp, Location, Outgoing, Repo, RepoMessage, UpdateOutcome, View};
use futures::StreamExt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Drives a repo over one reconnecting WebSocket connection.
pub struct SyncClient {
    repo: Repo,
    outgoing: Outgoing,
    conn: OutgoingConnection,
    reconnect_config: ReconnectConfig,
    next_conn_id: ConnId,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl SyncClient {
    pub fn new(
        repo: Repo,
        outgoing: Outgoing,
        server_url: impl Into<String>,
        reconnect_config: ReconnectConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let conn = OutgoingConnection::new(server_url, repo.id());

        Self {
            repo,
            outgoing,
            conn,
            reconnect_config,
            next_conn_id: 1,
            event_tx,
            event_rx,
        }
    }

    /// Run until `shutdown` resolves or reconnect attempts are exhausted.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        self.dial().await;

        loop {
            let reconnecting = self.conn.state == OutgoingState::Reconnecting;
            if reconnecting && self.conn.reconnect.exceeded_max_attempts(&self.reconnect_config) {
                bail!(
                    "Giving up on {} after {} attempts",
                    self.conn.address,
                    self.conn.reconnect.attempts
                );
            }
            let wait = self.reconnect_wait();

            tokio::select! {
                Some(event) = self.event_rx.recv() => {
                    self.on_connection_event(event).await;
                }

                Some(msg) = self.outgoing.next() => {
                    self.deliver(&msg).await;
                }

                _ = tokio::time::sleep(wait), if reconnecting => {
                    self.dial().await;
                }

                _ = &mut shutdown => {
                    info!("Shutting down sync client");
                    break;
                }
            }
        }

        self.conn.close().await;
        Ok(())
    }

    fn reconnect_wait(&self) -> Duration {
        let due = self.conn.reconnect.next_attempt_at.unwrap_or(0);
        Duration::from_millis(due.saturating_sub(now_ms()))
    }

    async fn dial(&mut self) {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;

        debug!("Connecting to {}", self.conn.address);
        if let Err(e) = self.conn.connect(conn_id, self.event_tx.clone()).await {
            warn!("Failed to connect to {}: {}", self.conn.address, e);
            self.conn.prepare_reconnect(now_ms(), &self.reconnect_config);
        }
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Handshake { conn_id, message } if self.conn.is_current(conn_id) => {
                match self.conn.on_handshake(message) {
                    Ok(server_id) => self.repo.peer_connected(server_id),
                    Err(e) => {
                        error!("Handshake with {} failed: {}", self.conn.address, e);
                        self.conn.prepare_reconnect(now_ms(), &self.reconnect_config);
                    }
                }
            }
            ConnectionEvent::Message { conn_id, data } if self.conn.is_current(conn_id) => {
                let Some(server_id) = self.conn.remote_id else {
                    debug!("Dropping frame received before handshake");
                    return;
                };
                match RepoMessage::from_json(&data) {
                    Ok(msg) if msg.sender_id == server_id => {
                        if let Err(e) = self.repo.receive_message(msg) {
                            warn!("Failed to handle message from {}: {}", server_id, e);
                        }
                    }
                    Ok(msg) => warn!("Dropping message claiming sender {}", msg.sender_id),
                    Err(e) => warn!("Undecodable message from {}: {}", server_id, e),
                }
            }
            ConnectionEvent::Closed { conn_id } if self.conn.is_current(conn_id) => {
                info!("Disconnected from {}", self.conn.address);
                if let Some(server_id) = self.conn.remote_id {
                    self.repo.peer_disconnected(server_id);
                }
                if self.conn.state != OutgoingState::Closed {
                    self.conn.prepare_reconnect(now_ms(), &self.reconnect_config);
                }
            }
            _ => debug!("Ignoring event from a stale connection"),
        }
    }

    async fn deliver(&self, msg: &RepoMessage) {
        if Some(msg.target_id) != self.conn.remote_id {
            debug!("No connection for {}, dropping {}", msg.target_id, msg.kind.as_str());
            return;
        }
        if let Err(e) = self.conn.send_message(msg).await {
            warn!("Failed to send {} to {}: {}", msg.kind.as_str(), msg.target_id, e);
        }
    }
}

/// Page URL given on the command line. The fragment carries the document id.
pub struct TerminalLocation {
    url: Mutex<String>,
}

impl TerminalLocation {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Mutex::new(url.into()),
        }
    }

    pub fn url(&self) -> String {
        self.url.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Location for TerminalLocation {
    fn fragment(&self) -> Option<String> {
        let url = self.url.lock().unwrap_or_else(|e| e.into_inner());
        url.split_once('#').map(|(_, fragment)| fragment.to_string())
    }

    fn assign_fragment(&self, fragment: &str) {
        let mut url = self.url.lock().unwrap_or_else(|e| e.into_inner());
        let base = url.split_once('#').map_or(url.as_str(), |(base, _)| base);
        let next = format!("{base}#{fragment}");
        *url = next;
        println!("Document URL: {}", url);
    }
}

/// Prints the page to stdout.
pub struct TerminalView;

impl View for TerminalView {
    fn show_status(&self, text: &str) {
        println!("[status] {text}");
    }

    fn show_document(&self, text: &str) {
        println!("{text}");
    }

    fn alert(&self, text: &str) {
        println!("[alert] {text}");
    }
}

/// Settings for [`run_terminal`].
pub struct TerminalOptions {
    pub server_url: String,
    pub page_url: String,
    pub reconnect: ReconnectConfig,
}

/// Run the counter page in the terminal until `quit` or end of input.
///
/// An empty line or `update` clicks the button, `show` prints the document.
pub async fn run_terminal(repo: Repo, outgoing: Outgoing, options: TerminalOptions) -> Result<()> {
    let location = TerminalLocation::new(options.page_url);
    let app = EchoApp::start(&repo, &location, Arc::new(TerminalView))?;

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let client = SyncClient::new(repo, outgoing, options.server_url, options.reconnect);
    let client_task = tokio::spawn(client.run(async {
        let _ = stop_rx.await;
    }));

    println!("Commands: <enter> or 'update' to click Update, 'show', 'quit'");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        match line.trim() {
            "" | "update" => match app.on_update_clicked() {
                Ok(UpdateOutcome::Applied { counter }) => debug!(counter, "Update applied"),
                Ok(UpdateOutcome::NotReady) => {}
                Err(e) => error!("Update failed: {}", e),
            },
            "show" => {
                println!("{} ({})", app.handle().id(), app.handle().status());
                println!("{}", render_document(&app.handle().value()));
            }
            "quit" | "exit" => break,
            other => println!("Unknown command: {other}"),
        }
    }

    let _ = stop_tx.send(());
    client_task.await??;
    Ok(())
}
