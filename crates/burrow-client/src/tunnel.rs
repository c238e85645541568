//! The client dispatcher: connects out, handshakes, accepts
//! server-opened streams and hands each to the local router.

use crate::config::ClientConfig;
use crate::pool::PoolConfig;
use crate::reconnect::Reconnector;
use crate::router::LocalRouter;
use crate::transport;
use burrow_core::header::{StreamHeader, MAX_STREAM_HEADER_SIZE};
use burrow_core::mux::{Mode, MuxConfig, MuxSession, MuxStream};
use burrow_core::{
    Codec, Envelope, HandshakeRequest, MessageType, Result, ShutdownMessage, TunnelError,
    TunnelStatus, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Connection state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Closed = 4,
}

impl ClientState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ClientState::Connecting,
            2 => ClientState::Connected,
            3 => ClientState::Reconnecting,
            4 => ClientState::Closed,
            _ => ClientState::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Reconnecting => "reconnecting",
            ClientState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details of one proxied request, delivered to request observers at
/// start (no duration/status) and again at completion.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub id: String,
    pub subdomain: String,
    pub local_port: u16,
    pub method: String,
    pub path: String,
    pub timestamp: DateTime<Utc>,
    pub duration: Option<Duration>,
    /// 0 until completion; 200 for a clean exchange, 502 on failure.
    pub status: u16,
}

type StateHandler = Arc<dyn Fn(ClientState) + Send + Sync>;
type RequestHandler = Arc<dyn Fn(&RequestInfo) + Send + Sync>;
type ShutdownHandler = Arc<dyn Fn(&ShutdownMessage) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    state: Vec<StateHandler>,
    request: Vec<RequestHandler>,
    shutdown: Vec<ShutdownHandler>,
}

/// The tunnel client.
pub struct TunnelClient {
    config: Arc<ClientConfig>,
    state: AtomicU8,
    session_id: Mutex<String>,
    tunnel_status: Mutex<Vec<TunnelStatus>>,
    mux: tokio::sync::Mutex<Option<MuxSession>>,
    router: Arc<LocalRouter>,
    reconnect: Option<Reconnector>,
    handlers: Mutex<Handlers>,
    shutdown_tx: watch::Sender<bool>,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let router = Arc::new(LocalRouter::new(&config.tunnels, PoolConfig::default()));
        let reconnect = config
            .reconnect
            .enabled
            .then(|| Reconnector::new(config.reconnect.clone()));
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            config: Arc::new(config),
            state: AtomicU8::new(ClientState::Disconnected as u8),
            session_id: Mutex::new(String::new()),
            tunnel_status: Mutex::new(Vec::new()),
            mux: tokio::sync::Mutex::new(None),
            router,
            reconnect,
            handlers: Mutex::new(Handlers::default()),
            shutdown_tx,
        })
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn session_id(&self) -> String {
        self.session_id.lock().expect("session id poisoned").clone()
    }

    /// Status of every tunnel from the latest handshake response.
    pub fn tunnel_status(&self) -> Vec<TunnelStatus> {
        self.tunnel_status
            .lock()
            .expect("tunnel status poisoned")
            .clone()
    }

    /// Register an observer for state transitions.
    pub fn on_state_change(&self, handler: impl Fn(ClientState) + Send + Sync + 'static) {
        self.handlers
            .lock()
            .expect("handlers poisoned")
            .state
            .push(Arc::new(handler));
    }

    /// Register an observer for request start/completion events.
    pub fn on_request(&self, handler: impl Fn(&RequestInfo) + Send + Sync + 'static) {
        self.handlers
            .lock()
            .expect("handlers poisoned")
            .request
            .push(Arc::new(handler));
    }

    /// Register an observer for server shutdown notices.
    pub fn on_shutdown(&self, handler: impl Fn(&ShutdownMessage) + Send + Sync + 'static) {
        self.handlers
            .lock()
            .expect("handlers poisoned")
            .shutdown
            .push(Arc::new(handler));
    }

    /// Dial the server, establish the mux and perform the handshake.
    pub async fn connect(&self) -> Result<()> {
        self.set_state(ClientState::Connecting);
        info!(addr = %self.config.server_addr, "connecting to server");

        let io = match transport::connect(&self.config.server_addr).await {
            Ok(io) => io,
            Err(e) => {
                self.set_state(ClientState::Disconnected);
                return Err(e);
            }
        };

        let mux = MuxSession::new(io, Mode::Client, MuxConfig::default());
        if let Err(e) = self.perform_handshake(&mux).await {
            mux.close().await;
            self.set_state(ClientState::Disconnected);
            return Err(e);
        }

        *self.mux.lock().await = Some(mux);
        self.set_state(ClientState::Connected);
        info!(session_id = %self.session_id(), "connected to server");
        Ok(())
    }

    async fn perform_handshake(&self, mux: &MuxSession) -> Result<()> {
        let stream = mux.open_stream().await?;
        let codec = Codec::new(stream);

        let request = HandshakeRequest {
            version: PROTOCOL_VERSION,
            token: self.config.token.clone(),
            client_id: self.config.client_id.clone(),
            tunnels: self.config.tunnels.clone(),
            capabilities: Vec::new(),
        };
        codec.send_handshake(&request).await?;

        let envelope = codec.read_message().await?;
        if envelope.msg_type != MessageType::HandshakeResponse {
            return Err(TunnelError::Protocol(format!(
                "unexpected message type {:?}",
                envelope.msg_type
            )));
        }

        let response: burrow_core::HandshakeResponse = envelope.decode_payload()?;
        if !response.success {
            return Err(TunnelError::Protocol(format!(
                "handshake rejected: {} (code: {})",
                response.error, response.error_code
            )));
        }

        // The top-level flag only says "at least one"; surface each
        // tunnel's own outcome.
        for status in &response.tunnels {
            if status.is_active() {
                info!(
                    subdomain = %status.subdomain,
                    local_port = status.local_port,
                    url = %status.url,
                    "tunnel active"
                );
            } else {
                warn!(
                    subdomain = %status.subdomain,
                    error = %status.error,
                    "tunnel failed"
                );
            }
        }

        *self.session_id.lock().expect("session id poisoned") = response.session_id;
        *self.tunnel_status.lock().expect("tunnel status poisoned") = response.tunnels;
        Ok(())
        // Dropping the codec closes the handshake stream.
    }

    /// Run the accept/dispatch loop until [`TunnelClient::close`] (or the
    /// reconnector gives up). Connects first if needed.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        if self.state() != ClientState::Connected {
            match self.connect().await {
                Ok(()) => {}
                Err(e) if self.reconnect.is_some() => {
                    warn!(error = %e, "initial connection failed, will retry");
                    self.set_state(ClientState::Disconnected);
                }
                Err(e) => return Err(e),
            }
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if self.state() == ClientState::Closed || *shutdown_rx.borrow() {
                return Ok(());
            }

            let mux = self.mux.lock().await.clone();
            match mux {
                Some(mux) if !mux.is_closed() => {
                    tokio::select! {
                        result = mux.accept_stream() => match result {
                            Ok(stream) => {
                                let client = self.clone();
                                tokio::spawn(async move {
                                    client.handle_stream(stream).await;
                                });
                            }
                            Err(_) => {
                                warn!("connection lost");
                                *self.mux.lock().await = None;
                                self.set_state(ClientState::Disconnected);
                            }
                        },
                        _ = shutdown_rx.changed() => {}
                    }
                }
                _ => {
                    *self.mux.lock().await = None;
                    if !self.handle_reconnect(&mut shutdown_rx).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One reconnect attempt (including the backoff sleep). Returns
    /// `false` when the loop should stop.
    async fn handle_reconnect(&self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        let Some(reconnector) = &self.reconnect else {
            info!("reconnect disabled, stopping");
            self.close_internal().await;
            return false;
        };

        self.set_state(ClientState::Reconnecting);
        let Some(delay) = reconnector.next_delay() else {
            error!("max reconnection attempts exceeded, giving up");
            self.close_internal().await;
            return false;
        };

        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = reconnector.attempts(),
            "reconnecting"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => return false,
        }

        match self.connect().await {
            Ok(()) => {
                reconnector.reset();
            }
            Err(e) => {
                warn!(error = %e, "reconnection failed");
                self.set_state(ClientState::Disconnected);
            }
        }
        true
    }

    /// Per-stream worker. A server-opened stream starts with either a
    /// stream header (request dispatch) or a control envelope (e.g. a
    /// shutdown notice); the first frame's `type` field disambiguates.
    async fn handle_stream(self: Arc<Self>, mut stream: MuxStream) {
        let started = Instant::now();

        let frame = match read_first_frame(&mut stream).await {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, "failed to read stream preamble");
                return;
            }
        };

        let value: serde_json::Value = match serde_json::from_slice(&frame) {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "malformed stream preamble");
                return;
            }
        };
        let kind = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
        if !matches!(kind, "http" | "tcp" | "websocket") {
            self.handle_control_envelope(value).await;
            return;
        }

        if frame.len() > MAX_STREAM_HEADER_SIZE {
            error!(size = frame.len(), "stream header exceeds maximum size");
            return;
        }
        let header: StreamHeader = match serde_json::from_value(value) {
            Ok(h) => h,
            Err(e) => {
                error!(error = %e, "failed to decode stream header");
                return;
            }
        };
        if let Err(e) = header.validate() {
            error!(error = %e, "invalid stream header");
            return;
        }

        debug!(
            request_id = %header.request_id,
            subdomain = %header.subdomain,
            local_port = header.local_port,
            "handling request"
        );

        let mut request = RequestInfo {
            id: header.request_id.clone(),
            subdomain: header.subdomain.clone(),
            local_port: header.local_port,
            method: header.method.clone(),
            path: header.path.clone(),
            timestamp: Utc::now(),
            duration: None,
            status: 0,
        };
        self.notify_request(&request);

        match self.router.forward(&mut stream, &header).await {
            Ok(()) => {
                request.status = 200;
            }
            Err(e) => {
                error!(request_id = %header.request_id, error = %e, "failed to forward request");
                request.status = 502;
            }
        }

        request.duration = Some(started.elapsed());
        self.notify_request(&request);
    }

    /// Server-initiated control message on a fresh stream.
    async fn handle_control_envelope(&self, value: serde_json::Value) {
        let envelope: Envelope = match serde_json::from_value(value) {
            Ok(e) => e,
            Err(e) => {
                error!(error = %e, "malformed control envelope");
                return;
            }
        };

        match envelope.msg_type {
            MessageType::Shutdown => {
                let notice: ShutdownMessage = envelope.decode_payload().unwrap_or(ShutdownMessage {
                    reason: String::new(),
                    grace_period_ms: 0,
                });
                warn!(
                    reason = %notice.reason,
                    grace_period_ms = notice.grace_period_ms,
                    "server is shutting down"
                );
                let handlers: Vec<ShutdownHandler> = self
                    .handlers
                    .lock()
                    .expect("handlers poisoned")
                    .shutdown
                    .clone();
                for handler in handlers {
                    handler(&notice);
                }
            }
            other => {
                debug!(msg_type = ?other, "ignoring server control message");
            }
        }
    }

    /// Close the client for good; no further reconnects.
    pub async fn close(&self) {
        info!("closing tunnel client");
        self.close_internal().await;
    }

    async fn close_internal(&self) {
        self.set_state(ClientState::Closed);
        let _ = self.shutdown_tx.send(true);
        if let Some(mux) = self.mux.lock().await.take() {
            mux.close().await;
        }
        self.router.close().await;
    }

    fn set_state(&self, state: ClientState) {
        // Closed is terminal.
        if self.state() == ClientState::Closed && state != ClientState::Closed {
            return;
        }
        self.state.store(state as u8, Ordering::SeqCst);

        // Snapshot under the lock, invoke outside it.
        let handlers: Vec<StateHandler> = self
            .handlers
            .lock()
            .expect("handlers poisoned")
            .state
            .clone();
        for handler in handlers {
            handler(state);
        }
    }

    fn notify_request(&self, info: &RequestInfo) {
        let handlers: Vec<RequestHandler> = self
            .handlers
            .lock()
            .expect("handlers poisoned")
            .request
            .clone();
        for handler in handlers {
            handler(info);
        }
    }
}

/// Read one `[u32 BE length][payload]` frame from a freshly-accepted
/// stream, bounded by the control-message cap.
async fn read_first_frame(stream: &mut MuxStream) -> Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let length = u32::from_be_bytes(len_buf) as usize;
    if length == 0 {
        return Err(TunnelError::InvalidMessage(
            "stream preamble length cannot be zero".into(),
        ));
    }
    if length > MAX_MESSAGE_SIZE {
        return Err(TunnelError::MessageTooLarge {
            size: length,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut data = vec![0u8; length];
    stream.read_exact(&mut data).await?;
    Ok(data)
}
