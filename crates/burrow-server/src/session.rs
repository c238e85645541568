//! The server-side handle to one connected client.
//!
//! A session owns exactly one underlying connection through its
//! multiplexer. Its state only ever moves forward:
//! `connecting → active → closing → closed`.

use burrow_core::header::{write_stream_header, StreamHeader};
use burrow_core::mux::{MuxSession, MuxStream};
use burrow_core::{Result, TunnelConfig, TunnelError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Connecting,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonically increasing per-session counters.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub streams_opened: AtomicU64,
    pub streams_closed: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub requests_handled: AtomicU64,
    pub errors: AtomicU64,
}

/// A connected client with multiplexed streams.
pub struct Session {
    pub id: String,
    pub client_id: String,
    pub token: String,
    pub remote_addr: String,
    pub created_at: DateTime<Utc>,

    mux: MuxSession,
    state: AtomicU8,
    tunnels: RwLock<HashMap<String, TunnelConfig>>,
    /// Unix nanoseconds of the last stream open/accept.
    last_activity: AtomicI64,
    metrics: SessionMetrics,
}

impl Session {
    /// Wrap an established multiplexer in a new session (state
    /// `connecting`).
    pub fn new(
        mux: MuxSession,
        token: impl Into<String>,
        client_id: impl Into<String>,
        remote_addr: impl Into<String>,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            id: burrow_core::id::generate_session_id(),
            client_id: client_id.into(),
            token: token.into(),
            remote_addr: remote_addr.into(),
            created_at: Utc::now(),
            mux,
            state: AtomicU8::new(SessionState::Connecting as u8),
            tunnels: RwLock::new(HashMap::new()),
            last_activity: AtomicI64::new(0),
            metrics: SessionMetrics::default(),
        });
        session.touch();
        session
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Atomically move from `from` to `to`. Returns whether the swap won.
    pub fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    /// Open a new stream to the client. Requires the session be active.
    pub async fn open_stream(&self) -> Result<MuxStream> {
        if !self.is_active() {
            return Err(TunnelError::SessionNotActive);
        }

        match self.mux.open_stream().await {
            Ok(stream) => {
                self.metrics.streams_opened.fetch_add(1, Ordering::Relaxed);
                self.touch();
                Ok(stream)
            }
            Err(e) => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Open a stream and write its header frame; the stream is torn down
    /// if the header cannot be written.
    pub async fn open_stream_with_header(&self, header: &StreamHeader) -> Result<MuxStream> {
        let mut stream = self.open_stream().await?;
        if let Err(e) = write_stream_header(&mut stream, header).await {
            self.metrics.errors.fetch_add(1, Ordering::Relaxed);
            let _ = stream.shutdown().await;
            return Err(e);
        }
        Ok(stream)
    }

    /// Wait for a client-initiated stream (control messages).
    pub async fn accept_stream(&self) -> Result<MuxStream> {
        let stream = self.mux.accept_stream().await?;
        self.touch();
        Ok(stream)
    }

    pub async fn register_tunnel(&self, tc: TunnelConfig) {
        self.tunnels.write().await.insert(tc.subdomain.clone(), tc);
    }

    pub async fn unregister_tunnel(&self, subdomain: &str) {
        self.tunnels.write().await.remove(subdomain);
    }

    pub async fn get_tunnel(&self, subdomain: &str) -> Option<TunnelConfig> {
        self.tunnels.read().await.get(subdomain).cloned()
    }

    pub async fn get_tunnels(&self) -> Vec<TunnelConfig> {
        self.tunnels.read().await.values().cloned().collect()
    }

    pub async fn tunnel_count(&self) -> usize {
        self.tunnels.read().await.len()
    }

    /// Close the session and with it every live stream. Idempotent; the
    /// first caller drives the transition.
    pub async fn close(&self) {
        let driving = self.transition(SessionState::Active, SessionState::Closing)
            || self.transition(SessionState::Connecting, SessionState::Closing);
        if !driving {
            return;
        }

        info!(session_id = %self.id, "closing session");
        self.mux.close().await;
        self.state.store(SessionState::Closed as u8, Ordering::SeqCst);
    }

    /// Whether the underlying connection has ended.
    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    fn touch(&self) {
        self.last_activity.store(now_nanos(), Ordering::Relaxed);
    }

    /// Time since the last stream open/accept.
    pub fn idle_duration(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_nanos(now_nanos().saturating_sub(last).max(0) as u64)
    }
}

fn now_nanos() -> i64 {
    // Saturates far past any realistic runtime.
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::mux::{Mode, MuxConfig};
    use burrow_core::StreamKind;
    use tokio::io::AsyncReadExt;

    fn session_pair() -> (Arc<Session>, MuxSession) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let server_mux = MuxSession::new(a, Mode::Server, MuxConfig::default());
        let client_mux = MuxSession::new(b, Mode::Client, MuxConfig::default());
        let session = Session::new(server_mux, "tok", "client-1", "127.0.0.1:40000");
        (session, client_mux)
    }

    #[tokio::test]
    async fn state_machine_is_monotonic() {
        let (session, _client) = session_pair();
        assert_eq!(session.state(), SessionState::Connecting);

        assert!(session.transition(SessionState::Connecting, SessionState::Active));
        assert!(!session.transition(SessionState::Connecting, SessionState::Active));
        assert!(session.is_active());

        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        // Second close is a no-op.
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn open_stream_requires_active() {
        let (session, _client) = session_pair();
        assert!(matches!(
            session.open_stream().await,
            Err(TunnelError::SessionNotActive)
        ));

        session.transition(SessionState::Connecting, SessionState::Active);
        let stream = session.open_stream().await.unwrap();
        drop(stream);
        assert_eq!(session.metrics().streams_opened.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn header_precedes_stream_bytes() {
        let (session, client_mux) = session_pair();
        session.transition(SessionState::Connecting, SessionState::Active);

        let header = StreamHeader {
            kind: StreamKind::Http,
            local_port: 3000,
            local_host: String::new(),
            request_id: "req_42".into(),
            subdomain: "api".into(),
            remote_addr: String::new(),
            host: String::new(),
            method: String::new(),
            path: String::new(),
        };

        let accept = tokio::spawn(async move {
            let mut stream = client_mux.accept_stream().await.unwrap();
            let got = burrow_core::read_stream_header(&mut stream).await.unwrap();
            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).await.unwrap();
            (got, rest)
        });

        let mut stream = session.open_stream_with_header(&header).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        stream.shutdown().await.unwrap();

        let (got, rest) = accept.await.unwrap();
        assert_eq!(got.request_id, "req_42");
        assert_eq!(got.subdomain, "api");
        assert_eq!(rest, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn tunnel_map_round_trip() {
        let (session, _client) = session_pair();
        session
            .register_tunnel(TunnelConfig {
                subdomain: "api".into(),
                local_port: 3000,
                local_host: "127.0.0.1".into(),
                protocol: "http".into(),
            })
            .await;

        assert!(session.get_tunnel("api").await.is_some());
        assert_eq!(session.get_tunnels().await.len(), 1);
        session.unregister_tunnel("api").await;
        assert!(session.get_tunnel("api").await.is_none());
    }
}
