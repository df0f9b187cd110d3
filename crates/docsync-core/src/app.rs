//! The counter demo page, independent of where it renders.
//!
//! The page keeps its document id in the URL fragment, shows the document as
//! pretty JSON whenever it changes, and has one button that stamps the
//! current time and bumps a counter. Browser and terminal front ends supply
//! a [`Location`] and a [`View`]; everything else lives here.

use crate::document_id::{DocumentId, DocumentIdError};
use crate::events::{DocEvent, Subscription};
use crate::handle::DocHandle;
use crate::repo::{Repo, RepoError};
use chrono::{DateTime, Local, SecondsFormat, Utc};
use std::sync::Arc;
use thiserror::Error;

pub const NOT_READY_ALERT: &str = "Document not ready yet. Please wait.";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid document id in URL fragment: {0}")]
    InvalidDocumentId(#[from] DocumentIdError),

    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Where the document id lives between sessions.
pub trait Location {
    /// Fragment without the leading `#`; empty or `None` when absent.
    fn fragment(&self) -> Option<String>;

    fn assign_fragment(&self, fragment: &str);
}

/// Output surface of the page.
pub trait View: Send + Sync {
    fn show_status(&self, text: &str);

    fn show_document(&self, text: &str);

    /// Modal notice to the user.
    fn alert(&self, text: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentIdSource {
    /// Read verbatim from the fragment.
    Fragment,
    /// Freshly generated and written to the fragment.
    Generated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The handle was not ready; the user was alerted and nothing changed.
    NotReady,
    Applied { counter: i64 },
}

/// Read the document id from the fragment, or generate one and store it there.
pub fn resolve_document_id(
    location: &dyn Location,
) -> Result<(DocumentId, DocumentIdSource), DocumentIdError> {
    let fragment = location.fragment().unwrap_or_default();
    let fragment = fragment.strip_prefix('#').unwrap_or(&fragment);
    if !fragment.is_empty() {
        return Ok((fragment.parse()?, DocumentIdSource::Fragment));
    }

    let id = DocumentId::generate();
    location.assign_fragment(id.as_str());
    Ok((id, DocumentIdSource::Generated))
}

/// Pretty JSON, as the page displays it.
pub fn render_document(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

pub struct EchoApp {
    handle: DocHandle,
    view: Arc<dyn View>,
    source: DocumentIdSource,
    _subscription: Subscription,
}

impl EchoApp {
    /// Resolve the document, show it, and follow its changes.
    pub fn start(repo: &Repo, location: &dyn Location, view: Arc<dyn View>) -> Result<Self, AppError> {
        let (id, source) = resolve_document_id(location).inspect_err(|e| {
            view.show_status(&format!("Cannot open document: {e}"));
        })?;
        let handle = match source {
            DocumentIdSource::Generated => repo.create_with_id(id)?,
            DocumentIdSource::Fragment => repo.find(&id)?,
        };
        tracing::info!(doc = %handle.id(), ?source, status = %handle.status(), "Page started");

        view.show_status(&format!("Repo initialized. Document ID: {}", handle.id()));

        let subscription = {
            let view = Arc::clone(&view);
            handle.on_change(move |event| {
                if let DocEvent::Changed { value, .. } = event {
                    view.show_document(&render_document(&value));
                    view.show_status(&format!(
                        "Connected. Last change: {}",
                        Local::now().format("%H:%M:%S")
                    ));
                }
            })
        };

        if handle.is_ready() && !handle.with_doc(|doc| doc.is_empty()) {
            view.show_document(&render_document(&handle.value()));
        }

        Ok(Self {
            handle,
            view,
            source,
            _subscription: subscription,
        })
    }

    pub fn handle(&self) -> &DocHandle {
        &self.handle
    }

    pub fn source(&self) -> DocumentIdSource {
        self.source
    }

    /// The update button.
    pub fn on_update_clicked(&self) -> Result<UpdateOutcome, AppError> {
        self.on_update_clicked_at(Utc::now())
    }

    /// The update button, with the clock supplied.
    pub fn on_update_clicked_at(&self, now: DateTime<Utc>) -> Result<UpdateOutcome, AppError> {
        if !self.handle.is_ready() {
            tracing::debug!(doc = %self.handle.id(), status = %self.handle.status(), "Update before ready");
            self.view.alert(NOT_READY_ALERT);
            return Ok(UpdateOutcome::NotReady);
        }

        let timestamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
        let counter = self.handle.change(|doc| {
            let counter = doc.get_i64("counter").unwrap_or(0) + 1;
            doc.set("timestamp", timestamp.as_str())?;
            doc.set("counter", counter)?;
            Ok(counter)
        })?;
        Ok(UpdateOutcome::Applied { counter })
    }
}
