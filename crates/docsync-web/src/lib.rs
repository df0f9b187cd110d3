//! Browser build of the docsync counter page.
//!
//! On load the page builds a repo over `localStorage` and a WebSocket to
//! `ws://localhost:1323/ws`, resolves the document from the URL hash and wires
//! the update button. The page logic itself lives in `docsync_core::app`.
//!
//! **Note**: The DOM and WebSocket bindings only compile for `wasm32` targets.
//! On native targets (e.g., during `cargo test --workspace`) only the
//! platform-independent helpers are built.

#[cfg(target_arch = "wasm32")]
mod dom;
pub mod network;
pub mod storage;

#[cfg(target_arch = "wasm32")]
pub use dom::{BrowserLocation, DomView};
#[cfg(target_arch = "wasm32")]
pub use network::BrowserWebSocket;
pub use network::{ServerLink, SERVER_URL};
#[cfg(target_arch = "wasm32")]
pub use storage::LocalStorage;

// ============================================================================
// All WASM-specific code is gated behind target_arch = "wasm32"
// This allows `cargo check --workspace` to succeed on native targets.
// ============================================================================

#[cfg(target_arch = "wasm32")]
mod wasm_impl {
    use super::*;
    use docsync_core::{EchoApp, Permissive, Repo, RepoConfig};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;
    use wasm_bindgen::prelude::*;
    use wasm_bindgen::JsCast;

    /// Everything that must outlive `start`.
    struct Page {
        _app: Rc<EchoApp>,
        _network: BrowserWebSocket,
        _on_click: Closure<dyn FnMut(web_sys::Event)>,
    }

    // WASM is single-threaded; the page lives here for the tab's lifetime
    thread_local! {
        static PAGE: RefCell<Option<Page>> = const { RefCell::new(None) };
    }

    /// Entry point, run once when the module loads.
    #[wasm_bindgen(start)]
    pub fn start() -> Result<(), JsValue> {
        console_error_panic_hook::set_once();
        tracing_wasm::set_as_global_default_with_config(
            tracing_wasm::WASMLayerConfigBuilder::new()
                .set_max_level(tracing::Level::DEBUG)
                .build(),
        );

        let config = RepoConfig::new()
            .with_storage(Arc::new(LocalStorage::new()))
            .with_share_policy(Arc::new(Permissive));
        let (repo, outgoing) = Repo::new(config);
        tracing::info!(repo = %repo.id(), "Repo created");

        let network = BrowserWebSocket::connect(SERVER_URL, repo.clone(), outgoing)?;
        let app = EchoApp::start(&repo, &BrowserLocation, Arc::new(DomView))
            .map_err(|e| JsValue::from_str(&e.to_string()))?;
        let app = Rc::new(app);

        let on_click = {
            let app = Rc::clone(&app);
            Closure::<dyn FnMut(web_sys::Event)>::new(move |_: web_sys::Event| {
                if let Err(e) = app.on_update_clicked() {
                    tracing::error!("Update failed: {}", e);
                }
            })
        };
        let button = web_sys::window()
            .and_then(|w| w.document())
            .and_then(|d| d.get_element_by_id(dom::UPDATE_BUTTON_ID))
            .ok_or_else(|| JsValue::from_str("missing #updateButton"))?;
        button.add_event_listener_with_callback("click", on_click.as_ref().unchecked_ref())?;

        PAGE.with(|page| {
            *page.borrow_mut() = Some(Page {
                _app: app,
                _network: network,
                _on_click: on_click,
            });
        });
        Ok(())
    }
}
