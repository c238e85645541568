//! WebSocket control endpoint.
//!
//! Clients that cannot reach the raw TCP control port connect with an
//! HTTP upgrade to `/tunnel` (or `/_tunnel`); the upgraded connection is
//! wrapped into a byte stream and handed to the exact same handshake path
//! as a TCP connection.

use crate::server::AppState;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use burrow_core::transport::WsByteStream;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// `GET /tunnel` upgrade handler.
pub async fn tunnel_upgrade(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut req: Request,
) -> Response {
    let headers = req.headers();
    let connection_upgrade = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .map(|v| derive_accept_key(v.as_bytes()));

    if !connection_upgrade || !websocket || key.is_none() {
        return (StatusCode::UPGRADE_REQUIRED, "WebSocket upgrade required").into_response();
    }
    let version_ok = headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .map(|v| v.as_bytes() == b"13")
        .unwrap_or(false);
    if !version_ok {
        return (StatusCode::BAD_REQUEST, "unsupported WebSocket version").into_response();
    }

    let Some(on_upgrade) = req.extensions_mut().remove::<hyper::upgrade::OnUpgrade>() else {
        return (StatusCode::UPGRADE_REQUIRED, "WebSocket upgrade required").into_response();
    };

    debug!(remote_addr = %addr, "tunnel WebSocket upgrade");
    let control = state.control.clone();
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(
                    TokioIo::new(upgraded),
                    Role::Server,
                    None,
                )
                .await;
                control
                    .handle_connection(WsByteStream::new(ws), addr.to_string())
                    .await;
            }
            Err(e) => {
                warn!(remote_addr = %addr, error = %e, "tunnel upgrade failed");
            }
        }
    });

    let accept = key.unwrap_or_default();
    match Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept)
        .body(Body::empty())
    {
        Ok(response) => response,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
