//! The public HTTP proxy: resolves inbound requests to a tunnel, opens a
//! stream to the owning client and bridges the HTTP exchange over it.
//!
//! Routing order: Host header subdomain, then first path segment (with
//! path rewrite), then the `X-Tunnel-Subdomain` header.

use crate::control::RequestMeta;
use crate::registry::TunnelEntry;
use crate::server::AppState;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri, Version};
use axum::response::{IntoResponse, Response};
use http_body_util::Limited;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Terminal proxy failures, mapped to plain-text error responses.
struct ProxyFailure(StatusCode, &'static str);

impl IntoResponse for ProxyFailure {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

/// Axum fallback handler: everything that is not a control or health
/// endpoint is proxied.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let request_id = burrow_core::id::generate_request_id();
    match proxy(state, addr, &request_id, req).await {
        Ok(response) => response,
        Err(failure) => failure.into_response(),
    }
}

async fn proxy(
    state: Arc<AppState>,
    addr: SocketAddr,
    request_id: &str,
    req: Request,
) -> Result<Response, ProxyFailure> {
    let is_websocket = is_websocket_upgrade(req.headers());
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    // The request target forwarded upstream; rewritten by path routing.
    let mut target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let (entry, rewritten) = resolve_tunnel(&state, &host, req.uri(), req.headers()).await;
    let Some(entry) = entry else {
        debug!(request_id = %request_id, host = %host, "no tunnel found for host or path");
        return Err(ProxyFailure(StatusCode::NOT_FOUND, "Tunnel not found"));
    };
    if let Some(rewritten) = rewritten {
        target = rewritten;
    }

    debug!(
        request_id = %request_id,
        subdomain = %entry.subdomain,
        session_id = %entry.session.id,
        method = %req.method(),
        path = %req.uri().path(),
        remote_addr = %addr,
        websocket = is_websocket,
        "proxying request"
    );

    if !entry.session.is_active() {
        warn!(request_id = %request_id, session_id = %entry.session.id, "session is not active");
        return Err(ProxyFailure(
            StatusCode::SERVICE_UNAVAILABLE,
            "Tunnel unavailable",
        ));
    }

    let meta = RequestMeta {
        remote_addr: addr.to_string(),
        host: host.clone(),
        method: req.method().to_string(),
        path: req.uri().path().to_string(),
    };
    let stream = state
        .control
        .proxy_request(&entry, request_id, meta)
        .await
        .map_err(|e| {
            error!(request_id = %request_id, session_id = %entry.session.id, error = %e, "failed to open stream");
            ProxyFailure(StatusCode::BAD_GATEWAY, "Failed to connect to tunnel")
        })?;

    // Drive an HTTP/1.1 client connection over the tunnel stream; the
    // request bytes written to it start `METHOD target HTTP/1.1\r\n`.
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| {
            error!(request_id = %request_id, error = %e, "tunnel stream handshake failed");
            ProxyFailure(StatusCode::BAD_GATEWAY, "Failed to connect to tunnel")
        })?;
    {
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(request_id = %request_id, error = %e, "tunnel connection ended");
            }
        });
    }

    let (mut parts, body) = req.into_parts();
    let client_upgrade = parts.extensions.remove::<hyper::upgrade::OnUpgrade>();

    let max_body = state.config.limits.max_request_body_size;
    let limit = if max_body == 0 {
        usize::MAX
    } else {
        max_body as usize
    };

    let mut forward = hyper::Request::builder()
        .method(parts.method.clone())
        .uri(target)
        .version(Version::HTTP_11)
        .body(Limited::new(body, limit))
        .map_err(|e| {
            error!(request_id = %request_id, error = %e, "failed to build upstream request");
            ProxyFailure(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        })?;

    *forward.headers_mut() = parts.headers.clone();
    let headers = forward.headers_mut();
    if !headers.contains_key(header::HOST) {
        if let Ok(value) = HeaderValue::from_str(&host) {
            headers.insert(header::HOST, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&forwarded_for(&parts.headers, addr)) {
        headers.insert("x-forwarded-for", value);
    }
    if let Ok(value) = HeaderValue::from_str(&forwarded_proto(&parts.headers)) {
        headers.insert("x-forwarded-proto", value);
    }

    let request_timeout = state.config.timeouts.request_timeout();
    let send = sender.send_request(forward);
    let mut response = if is_websocket || request_timeout.is_zero() {
        send.await
    } else {
        match tokio::time::timeout(request_timeout, send).await {
            Ok(result) => result,
            Err(_) => {
                warn!(request_id = %request_id, "upstream response timed out");
                return Err(ProxyFailure(StatusCode::BAD_GATEWAY, "Upstream timed out"));
            }
        }
    }
    .map_err(|e| {
        error!(request_id = %request_id, error = %e, "failed to forward request");
        ProxyFailure(StatusCode::BAD_GATEWAY, "Failed to forward request")
    })?;

    // WebSocket: relay the 101, then blind byte copies in both
    // directions until either side ends.
    if is_websocket && response.status() == StatusCode::SWITCHING_PROTOCOLS {
        let Some(client_upgrade) = client_upgrade else {
            return Err(ProxyFailure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "WebSocket not supported",
            ));
        };
        let upstream_upgrade = hyper::upgrade::on(&mut response);
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok((client_io, upstream_io)) => {
                    let mut client_io = TokioIo::new(client_io);
                    let mut upstream_io = TokioIo::new(upstream_io);
                    if let Err(e) =
                        tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await
                    {
                        debug!(request_id = %request_id, error = %e, "websocket relay ended");
                    }
                }
                Err(e) => {
                    debug!(request_id = %request_id, error = %e, "websocket upgrade failed");
                }
            }
        });

        let (rparts, _) = response.into_parts();
        return Ok(Response::from_parts(rparts, Body::empty()));
    }

    // Normal path: stream status, headers and body back to the caller.
    // Body-copy failures after this point surface in hyper's transfer and
    // are logged, not reported.
    let (rparts, rbody) = response.into_parts();
    Ok(Response::from_parts(rparts, Body::new(rbody)))
}

/// Resolve the target tunnel. Returns the entry plus the rewritten
/// request target when path-based routing matched.
async fn resolve_tunnel(
    state: &AppState,
    host: &str,
    uri: &Uri,
    headers: &HeaderMap,
) -> (Option<TunnelEntry>, Option<String>) {
    if let Some(entry) = state.registry.lookup_by_host(host).await {
        return (Some(entry), None);
    }

    if let Some((subdomain, rewritten)) = path_route(uri) {
        if let Some(entry) = state.registry.lookup(&subdomain).await {
            return (Some(entry), Some(rewritten));
        }
    }

    if let Some(subdomain) = headers.get("x-tunnel-subdomain").and_then(|v| v.to_str().ok()) {
        if let Some(entry) = state.registry.lookup(subdomain).await {
            return (Some(entry), None);
        }
    }

    (None, None)
}

/// Treat the first path segment as a subdomain candidate; the rewritten
/// target is the remainder (or "/") with the query preserved.
fn path_route(uri: &Uri) -> Option<(String, String)> {
    let trimmed = uri.path().strip_prefix('/')?;
    if trimmed.is_empty() {
        return None;
    }

    let (first, rest) = match trimmed.split_once('/') {
        Some((first, rest)) => (first, Some(rest)),
        None => (trimmed, None),
    };
    if first.is_empty() {
        return None;
    }

    let path = match rest {
        Some(rest) => format!("/{rest}"),
        None => "/".to_string(),
    };
    let target = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    Some((first.to_lowercase(), target))
}

/// Case-insensitive `Connection: upgrade` + `Upgrade: websocket`.
fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    connection.to_ascii_lowercase().contains("upgrade")
        && upgrade.eq_ignore_ascii_case("websocket")
}

/// First non-empty of: head of the existing X-Forwarded-For, X-Real-IP,
/// the connection's remote IP.
fn forwarded_for(headers: &HeaderMap, addr: SocketAddr) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        let head = xff.split(',').next().unwrap_or("").trim();
        if !head.is_empty() {
            return head.to_string();
        }
    }
    if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let value = xri.trim();
        if !value.is_empty() {
            return value.to_string();
        }
    }
    addr.ip().to_string()
}

/// Existing X-Forwarded-Proto wins; otherwise plain http (TLS terminates
/// at the edge, which sets the header).
fn forwarded_proto(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "http".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_websocket_upgrades() {
        let mut headers = HeaderMap::new();
        assert!(!is_websocket_upgrade(&headers));

        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket_upgrade(&headers));

        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_websocket_upgrade(&headers));
    }

    #[test]
    fn path_route_rewrites_to_remainder() {
        let uri: Uri = "/myapp/users?x=1".parse().unwrap();
        let (sub, target) = path_route(&uri).unwrap();
        assert_eq!(sub, "myapp");
        assert_eq!(target, "/users?x=1");

        let uri: Uri = "/myapp".parse().unwrap();
        let (sub, target) = path_route(&uri).unwrap();
        assert_eq!(sub, "myapp");
        assert_eq!(target, "/");

        let uri: Uri = "/MyApp/".parse().unwrap();
        let (sub, target) = path_route(&uri).unwrap();
        assert_eq!(sub, "myapp");
        assert_eq!(target, "/");

        let uri: Uri = "/".parse().unwrap();
        assert!(path_route(&uri).is_none());
    }

    #[test]
    fn forwarded_for_precedence() {
        let addr: SocketAddr = "203.0.113.9:51442".parse().unwrap();

        let mut headers = HeaderMap::new();
        assert_eq!(forwarded_for(&headers, addr), "203.0.113.9");

        headers.insert("x-real-ip", HeaderValue::from_static("10.1.1.1"));
        assert_eq!(forwarded_for(&headers, addr), "10.1.1.1");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("198.51.100.7, 10.0.0.2"),
        );
        assert_eq!(forwarded_for(&headers, addr), "198.51.100.7");
    }

    #[test]
    fn forwarded_proto_defaults_to_http() {
        let mut headers = HeaderMap::new();
        assert_eq!(forwarded_proto(&headers), "http");
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        assert_eq!(forwarded_proto(&headers), "https");
    }
}
