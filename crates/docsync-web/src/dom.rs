//! DOM bindings for the counter page.

use docsync_core::{Location, View};

/// Element showing connection and change status.
pub const STATUS_ID: &str = "status";
/// `<pre>` holding the document as JSON.
pub const DOCUMENT_ID: &str = "document";
/// The update button.
pub const UPDATE_BUTTON_ID: &str = "updateButton";

fn document() -> Option<web_sys::Document> {
    web_sys::window()?.document()
}

fn set_text(id: &str, text: &str) {
    match document().and_then(|d| d.get_element_by_id(id)) {
        Some(element) => element.set_text_content(Some(text)),
        None => tracing::warn!("Missing element #{}", id),
    }
}

/// Writes the page into its elements. Elements are looked up per call, so the
/// view holds no JS objects and stays `Send + Sync`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DomView;

impl View for DomView {
    fn show_status(&self, text: &str) {
        set_text(STATUS_ID, text);
    }

    fn show_document(&self, text: &str) {
        set_text(DOCUMENT_ID, text);
    }

    fn alert(&self, text: &str) {
        if let Some(window) = web_sys::window() {
            let _ = window.alert_with_message(text);
        }
    }
}

/// `window.location`; the hash carries the document id.
#[derive(Debug, Default, Clone, Copy)]
pub struct BrowserLocation;

impl Location for BrowserLocation {
    fn fragment(&self) -> Option<String> {
        web_sys::window()?.location().hash().ok()
    }

    fn assign_fragment(&self, fragment: &str) {
        if let Some(window) = web_sys::window() {
            if let Err(e) = window.location().set_hash(fragment) {
                tracing::error!("Failed to set location hash: {:?}", e);
            }
        }
    }
}
