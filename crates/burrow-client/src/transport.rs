//! Outbound connection helpers.
//!
//! The server address decides the transport: `ws://`/`wss://` URLs (and
//! `http(s)://` URLs, rewritten) use the WebSocket control endpoint;
//! anything else is treated as `host:port` raw TCP. Everything past the
//! dial is transport-oblivious.

use burrow_core::transport::WsByteStream;
use burrow_core::{Result, TunnelError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

const TCP_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// A duplex byte stream of any transport.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Dial the tunnel server.
pub async fn connect(server_addr: &str) -> Result<Box<dyn ByteStream>> {
    if server_addr.starts_with("ws://") || server_addr.starts_with("wss://") {
        return dial_websocket(server_addr).await;
    }
    if server_addr.contains("://") {
        let ws_url = server_addr
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        return dial_websocket(&ws_url).await;
    }
    dial_tcp(server_addr).await
}

async fn dial_tcp(addr: &str) -> Result<Box<dyn ByteStream>> {
    debug!(addr = %addr, "connecting via TCP");
    let conn = tokio::time::timeout(TCP_DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| TunnelError::Timeout)??;
    let _ = conn.set_nodelay(true);
    Ok(Box::new(conn))
}

async fn dial_websocket(url: &str) -> Result<Box<dyn ByteStream>> {
    let url = with_tunnel_path(url);
    debug!(url = %url, "connecting via WebSocket");

    let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| TunnelError::Internal(format!("WebSocket dial failed: {e}")))?;
    Ok(Box::new(WsByteStream::new(ws)))
}

/// Ensure the URL path ends with the control endpoint `/tunnel`.
fn with_tunnel_path(url: &str) -> String {
    if url.ends_with("/tunnel") {
        return url.to_string();
    }

    match url.find("://").map(|i| i + 3) {
        Some(host_start) => match url[host_start..].find('/') {
            Some(path_start) => {
                let (base, path) = url.split_at(host_start + path_start);
                let path = path.trim_end_matches('/');
                if path.ends_with("/tunnel") {
                    format!("{base}{path}")
                } else {
                    format!("{base}{path}/tunnel")
                }
            }
            None => format!("{url}/tunnel"),
        },
        None => format!("{url}/tunnel"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_path_forcing() {
        assert_eq!(
            with_tunnel_path("ws://host:9000"),
            "ws://host:9000/tunnel"
        );
        assert_eq!(
            with_tunnel_path("wss://host/tunnel"),
            "wss://host/tunnel"
        );
        assert_eq!(with_tunnel_path("ws://host/"), "ws://host/tunnel");
        assert_eq!(
            with_tunnel_path("wss://host/base/"),
            "wss://host/base/tunnel"
        );
    }
}
