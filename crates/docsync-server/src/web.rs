//! HTTP front of the sync server.
//!
//! Every TCP connection is served by its own axum task. Upgrade requests on
//! the WebSocket path are switched to WebSocket and handed to the main loop
//! through a channel; any other path is served from the static directory
//! (or answered with 404 when there is none).

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Byte stream under an upgraded server-side WebSocket.
pub type UpgradedStream = TokioIo<Upgraded>;

/// A WebSocket that finished the HTTP upgrade.
pub struct Upgrade {
    pub ws: WebSocketStream<UpgradedStream>,
    pub addr: SocketAddr,
}

#[derive(Clone)]
struct UpgradeState {
    upgrades: mpsc::UnboundedSender<Upgrade>,
    timeout: Duration,
}

/// Build the HTTP router.
///
/// Upgrades that do not complete within `timeout` are dropped.
pub fn router(
    ws_path: &str,
    static_dir: Option<PathBuf>,
    timeout: Duration,
    upgrades: mpsc::UnboundedSender<Upgrade>,
) -> Router {
    let router = Router::new().route(ws_path, get(upgrade));
    let router = match static_dir {
        Some(dir) => {
            info!("Serving static files from {:?}", dir);
            router.fallback_service(ServeDir::new(dir))
        }
        None => router,
    };

    router
        .layer(TraceLayer::new_for_http())
        .with_state(UpgradeState { upgrades, timeout })
}

/// Whether the headers ask for a WebSocket upgrade.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let has_token = |name: header::HeaderName, token: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    };

    has_token(header::CONNECTION, "upgrade") && has_token(header::UPGRADE, "websocket")
}

async fn upgrade(
    State(state): State<UpgradeState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut req: Request,
) -> Response {
    if !is_websocket_upgrade(req.headers()) {
        return (StatusCode::UPGRADE_REQUIRED, "Expected WebSocket upgrade").into_response();
    }
    if req
        .headers()
        .get(header::SEC_WEBSOCKET_VERSION)
        .is_none_or(|v| v.as_bytes() != b"13")
    {
        return (StatusCode::BAD_REQUEST, "Unsupported WebSocket version").into_response();
    }
    let Some(key) = req.headers().get(header::SEC_WEBSOCKET_KEY) else {
        return (StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key").into_response();
    };
    let Ok(accept) = HeaderValue::from_str(&derive_accept_key(key.as_bytes())) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    // The upgrade resolves once the 101 below has been written
    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match tokio::time::timeout(state.timeout, on_upgrade).await {
            Ok(Ok(upgraded)) => {
                let ws =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                        .await;
                if state.upgrades.send(Upgrade { ws, addr }).is_err() {
                    debug!("Server stopped, dropping upgrade from {}", addr);
                }
            }
            Ok(Err(e)) => debug!("Upgrade from {} failed: {}", addr, e),
            Err(_) => debug!("Upgrade from {} timed out", addr),
        }
    });

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(header::HeaderName, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(name.clone(), HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_upgrade_detection() {
        assert!(is_websocket_upgrade(&headers(&[
            (header::CONNECTION, "Upgrade"),
            (header::UPGRADE, "websocket"),
        ])));
        // Browsers send a token list
        assert!(is_websocket_upgrade(&headers(&[
            (header::CONNECTION, "keep-alive, Upgrade"),
            (header::UPGRADE, "WebSocket"),
        ])));
        assert!(!is_websocket_upgrade(&headers(&[(header::CONNECTION, "keep-alive")])));
        assert!(!is_websocket_upgrade(&headers(&[
            (header::CONNECTION, "upgrade"),
            (header::UPGRADE, "h2c"),
        ])));
    }
}
