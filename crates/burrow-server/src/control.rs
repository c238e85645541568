//! The control plane: accepts client connections, runs the handshake,
//! owns live sessions and opens proxy streams on their behalf.

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::registry::{Registry, TunnelEntry};
use crate::session::{Session, SessionState};
use burrow_core::header::{StreamHeader, StreamKind};
use burrow_core::messages::{
    AddTunnelRequest, HandshakeRequest, HandshakeResponse, MessageType, PingMessage,
    RemoveTunnelRequest, TunnelUpdateResponse,
};
use burrow_core::mux::{Mode, MuxConfig, MuxSession, MuxStream};
use burrow_core::{Codec, ErrorCode, Result, TunnelError, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// How often each session's supervision loop re-checks liveness and idle
/// time.
const SUPERVISION_INTERVAL: Duration = Duration::from_secs(30);

/// Request details recorded in the stream header of a proxied request.
#[derive(Debug, Default, Clone)]
pub struct RequestMeta {
    pub remote_addr: String,
    pub host: String,
    pub method: String,
    pub path: String,
}

/// Accepts client connections and manages their sessions.
pub struct ControlPlane {
    config: Arc<ServerConfig>,
    registry: Arc<Registry>,
    auth: Arc<dyn Authenticator>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ControlPlane {
    pub fn new(
        config: Arc<ServerConfig>,
        registry: Arc<Registry>,
        auth: Arc<dyn Authenticator>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            registry,
            auth,
            sessions: RwLock::new(HashMap::new()),
            shutdown_tx,
        })
    }

    /// Bind the control listener and start accepting connections.
    /// Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.config.control_addr).await?;
        let addr = listener.local_addr()?;
        info!(addr = %addr, "control plane listening");

        let cp = self.clone();
        tokio::spawn(cp.accept_loop(listener));
        Ok(addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((conn, addr)) => {
                        let _ = conn.set_nodelay(true);
                        let cp = self.clone();
                        tokio::spawn(cp.handle_connection(conn, addr.to_string()));
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                    }
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("control accept loop stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Drive one client connection from handshake to teardown. The
    /// transport may be raw TCP or a WebSocket-wrapped byte stream.
    pub async fn handle_connection<S>(self: Arc<Self>, io: S, remote_addr: String)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        debug!(remote_addr = %remote_addr, "new control connection");
        let mux = MuxSession::new(io, Mode::Server, MuxConfig::default());

        // One deadline covers everything up to (not including) the
        // handshake response.
        let handshake = tokio::time::timeout(
            self.config.timeouts.handshake_timeout(),
            self.read_handshake(&mux, &remote_addr),
        )
        .await;

        let (codec, request) = match handshake {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                warn!(remote_addr = %remote_addr, error = %e, "handshake rejected");
                mux.close().await;
                return;
            }
            Err(_) => {
                warn!(remote_addr = %remote_addr, "handshake timed out");
                mux.close().await;
                return;
            }
        };

        let session = Session::new(
            mux.clone(),
            request.token.clone(),
            request.client_id.clone(),
            remote_addr.clone(),
        );

        let statuses = self.registry.register(&session, &request.tunnels).await;
        for (tc, status) in request.tunnels.iter().zip(&statuses) {
            if status.is_active() {
                session.register_tunnel(tc.clone()).await;
            }
        }

        if !statuses.iter().any(|s| s.is_active()) {
            warn!(remote_addr = %remote_addr, "no tunnels could be registered");
            let response = HandshakeResponse {
                success: false,
                tunnels: statuses,
                server_version: PROTOCOL_VERSION,
                error: "no tunnels could be registered".into(),
                ..Default::default()
            };
            let _ = codec.send_handshake_response(&response).await;
            self.registry.unregister(&session.id).await;
            session.close().await;
            return;
        }

        // A success response is only observable after every accepted
        // tunnel is in the registry.
        let response = HandshakeResponse {
            success: true,
            session_id: session.id.clone(),
            tunnels: statuses,
            server_version: PROTOCOL_VERSION,
            ..Default::default()
        };
        if let Err(e) = codec.send_handshake_response(&response).await {
            error!(remote_addr = %remote_addr, error = %e, "failed to send handshake response");
            self.registry.unregister(&session.id).await;
            session.close().await;
            return;
        }

        // The handshake stream has served its purpose.
        drop(codec);

        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        session.transition(SessionState::Connecting, SessionState::Active);

        let tunnel_count = session.tunnel_count().await;
        info!(
            session_id = %session.id,
            client_id = %session.client_id,
            remote_addr = %remote_addr,
            tunnels = tunnel_count,
            "session established"
        );

        self.supervise(&session).await;

        self.sessions.write().await.remove(&session.id);
        self.registry.unregister(&session.id).await;
        info!(session_id = %session.id, "session ended");
    }

    /// Steps 3-7 of session setup: first stream, envelope, validation,
    /// version, authentication and limits. Failures are reported to the
    /// client best-effort before returning.
    async fn read_handshake(
        &self,
        mux: &MuxSession,
        remote_addr: &str,
    ) -> Result<(Codec<MuxStream>, HandshakeRequest)> {
        let stream = mux.accept_stream().await?;
        let codec = Codec::new(stream);

        let envelope = codec.read_message().await?;
        if envelope.msg_type != MessageType::Handshake {
            self.reject(&codec, "expected handshake message", ErrorCode::ProtocolError)
                .await;
            return Err(TunnelError::Protocol(format!(
                "unexpected message type {:?}",
                envelope.msg_type
            )));
        }

        let mut request: HandshakeRequest = match envelope.decode_payload() {
            Ok(r) => r,
            Err(e) => {
                self.reject(&codec, "invalid handshake payload", ErrorCode::ProtocolError)
                    .await;
                return Err(e);
            }
        };

        if let Err(e) = request.validate() {
            self.reject(&codec, &e.to_string(), ErrorCode::ProtocolError)
                .await;
            return Err(e);
        }

        if !burrow_core::is_version_supported(request.version) {
            self.reject(
                &codec,
                &format!("unsupported protocol version {}", request.version),
                ErrorCode::ProtocolError,
            )
            .await;
            return Err(TunnelError::VersionMismatch(request.version));
        }

        match self.auth.validate(&request.token).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(remote_addr = %remote_addr, client_id = %request.client_id, "authentication failed");
                self.reject(&codec, "invalid token", ErrorCode::Unauthorized)
                    .await;
                return Err(TunnelError::Unauthorized);
            }
            Err(e) => {
                error!(remote_addr = %remote_addr, error = %e, "authentication error");
                self.reject(&codec, "authentication failed", ErrorCode::Unauthorized)
                    .await;
                return Err(e);
            }
        }

        let max_tunnels = self.config.limits.max_tunnels_per_connection;
        if request.tunnels.len() > max_tunnels {
            self.reject(
                &codec,
                &format!("maximum {max_tunnels} tunnels allowed"),
                ErrorCode::TunnelLimitReached,
            )
            .await;
            return Err(TunnelError::TunnelLimitReached(max_tunnels));
        }

        Ok((codec, request))
    }

    async fn reject(&self, codec: &Codec<MuxStream>, message: &str, code: ErrorCode) {
        let response = HandshakeResponse {
            success: false,
            server_version: PROTOCOL_VERSION,
            error: message.to_string(),
            error_code: code.as_str().to_string(),
            ..Default::default()
        };
        // Best-effort: the connection is going away regardless.
        let _ = codec.send_handshake_response(&response).await;
    }

    /// Watch a session until its connection drops, it exceeds the idle
    /// timeout, or its control loop ends; then close it.
    async fn supervise(self: &Arc<Self>, session: &Arc<Session>) {
        let mut control_loop = tokio::spawn(Self::control_stream_loop(self.clone(), session.clone()));
        let mut ticker = tokio::time::interval(SUPERVISION_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut control_loop => {
                    // Accept loop ended: the connection is gone.
                    session.close().await;
                    return;
                }
                _ = ticker.tick() => {
                    if session.is_closed() {
                        info!(session_id = %session.id, "session connection closed");
                        break;
                    }
                    let idle_timeout = self.config.timeouts.idle_timeout();
                    if !idle_timeout.is_zero() && session.idle_duration() > idle_timeout {
                        info!(session_id = %session.id, "session idle timeout");
                        break;
                    }
                }
            }
        }

        session.close().await;
        let _ = control_loop.await;
    }

    /// Accept client-initiated streams carrying control envelopes
    /// (tunnel changes, pings, shutdown notice).
    async fn control_stream_loop(cp: Arc<Self>, session: Arc<Session>) {
        loop {
            let stream = match session.accept_stream().await {
                Ok(s) => s,
                Err(_) => return,
            };
            let cp = cp.clone();
            let session = session.clone();
            tokio::spawn(async move {
                cp.handle_control_stream(session, stream).await;
            });
        }
    }

    async fn handle_control_stream(&self, session: Arc<Session>, stream: MuxStream) {
        let codec = Codec::new(stream);
        let envelope = match codec.read_message().await {
            Ok(e) => e,
            Err(_) => return,
        };
        let request_id = envelope.request_id.clone();

        match envelope.msg_type {
            MessageType::AddTunnel => {
                let response = self.handle_add_tunnel(&session, &envelope).await;
                let _ = codec.send_tunnel_update(&request_id, &response).await;
            }
            MessageType::RemoveTunnel => {
                let response = self.handle_remove_tunnel(&session, &envelope).await;
                let _ = codec.send_tunnel_update(&request_id, &response).await;
            }
            MessageType::Ping => {
                if let Ok(ping) = envelope.decode_payload::<PingMessage>() {
                    let _ = codec.send_pong(&ping).await;
                }
            }
            MessageType::Shutdown => {
                info!(session_id = %session.id, "client announced shutdown");
                session.close().await;
            }
            other => {
                debug!(session_id = %session.id, msg_type = ?other, "unexpected control message");
                let _ = codec
                    .send_error(
                        &request_id,
                        ErrorCode::ProtocolError.as_str(),
                        "unexpected message type",
                    )
                    .await;
            }
        }
    }

    async fn handle_add_tunnel(
        &self,
        session: &Arc<Session>,
        envelope: &burrow_core::Envelope,
    ) -> TunnelUpdateResponse {
        let request: AddTunnelRequest = match envelope.decode_payload() {
            Ok(r) => r,
            Err(e) => {
                return TunnelUpdateResponse {
                    success: false,
                    error: e.to_string(),
                    error_code: ErrorCode::ProtocolError.as_str().into(),
                    ..Default::default()
                }
            }
        };

        let mut tc = request.tunnel;
        if let Err(e) = tc.validate() {
            return TunnelUpdateResponse {
                success: false,
                error: e.to_string(),
                error_code: ErrorCode::ProtocolError.as_str().into(),
                ..Default::default()
            };
        }

        let max_tunnels = self.config.limits.max_tunnels_per_connection;
        if session.tunnel_count().await >= max_tunnels {
            return TunnelUpdateResponse {
                success: false,
                error: format!("maximum {max_tunnels} tunnels allowed"),
                error_code: ErrorCode::TunnelLimitReached.as_str().into(),
                ..Default::default()
            };
        }

        let statuses = self
            .registry
            .register(session, std::slice::from_ref(&tc))
            .await;
        let status = statuses.into_iter().next();
        match status {
            Some(status) if status.is_active() => {
                session.register_tunnel(tc).await;
                info!(session_id = %session.id, subdomain = %status.subdomain, "tunnel added");
                TunnelUpdateResponse {
                    success: true,
                    tunnel: Some(status),
                    ..Default::default()
                }
            }
            Some(status) => TunnelUpdateResponse {
                success: false,
                error: status.error.clone(),
                tunnel: Some(status),
                ..Default::default()
            },
            None => TunnelUpdateResponse {
                success: false,
                error: "registration produced no status".into(),
                error_code: ErrorCode::InternalError.as_str().into(),
                ..Default::default()
            },
        }
    }

    async fn handle_remove_tunnel(
        &self,
        session: &Arc<Session>,
        envelope: &burrow_core::Envelope,
    ) -> TunnelUpdateResponse {
        let request: RemoveTunnelRequest = match envelope.decode_payload() {
            Ok(r) => r,
            Err(e) => {
                return TunnelUpdateResponse {
                    success: false,
                    error: e.to_string(),
                    error_code: ErrorCode::ProtocolError.as_str().into(),
                    ..Default::default()
                }
            }
        };

        match self
            .registry
            .unregister_tunnel(&session.id, &request.subdomain)
            .await
        {
            Ok(()) => {
                session.unregister_tunnel(&request.subdomain).await;
                info!(session_id = %session.id, subdomain = %request.subdomain, "tunnel removed");
                TunnelUpdateResponse {
                    success: true,
                    ..Default::default()
                }
            }
            Err(e) => TunnelUpdateResponse {
                success: false,
                error: e.to_string(),
                error_code: e.code().as_str().into(),
                ..Default::default()
            },
        }
    }

    /// Notify every active session the server is going away. Best-effort;
    /// returns once every notification attempt finished.
    pub async fn broadcast_shutdown(&self, reason: &str, grace_period_ms: u64) {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        info!(sessions = sessions.len(), reason = %reason, "broadcasting shutdown");

        let mut notifications = Vec::with_capacity(sessions.len());
        for session in sessions {
            let reason = reason.to_string();
            notifications.push(tokio::spawn(async move {
                let Ok(stream) = session.open_stream().await else {
                    return;
                };
                let codec = Codec::new(stream);
                let _ = codec.send_shutdown(&reason, grace_period_ms).await;
            }));
        }
        for task in notifications {
            let _ = task.await;
        }
    }

    /// Open a stream to the session owning `entry` for one inbound
    /// request. Returns the stream the HTTP bytes flow over.
    pub async fn proxy_request(
        &self,
        entry: &TunnelEntry,
        request_id: &str,
        meta: RequestMeta,
    ) -> Result<MuxStream> {
        if !entry.session.is_active() {
            return Err(TunnelError::SessionNotActive);
        }

        let header = StreamHeader {
            kind: StreamKind::Http,
            local_port: entry.local_port,
            local_host: entry.local_host.clone(),
            request_id: request_id.to_string(),
            subdomain: entry.subdomain.clone(),
            remote_addr: meta.remote_addr,
            host: meta.host,
            method: meta.method,
            path: meta.path,
        };

        let stream = entry.session.open_stream_with_header(&header).await?;
        entry
            .session
            .metrics()
            .requests_handled
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(stream)
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Graceful stop: close the listener, notify clients, close sessions.
    pub async fn shutdown(&self, reason: &str, grace: Duration) {
        info!(grace_ms = grace.as_millis() as u64, "stopping control plane");

        // Stop accepting first, then notify before anything starts
        // tearing sessions down.
        let _ = self.shutdown_tx.send(true);
        self.broadcast_shutdown(reason, grace.as_millis() as u64).await;

        let sessions: Vec<Arc<Session>> = {
            let mut map = self.sessions.write().await;
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close().await;
            self.registry.unregister(&session.id).await;
        }
    }
}
