//! Stream multiplexer: many independent bidirectional byte streams over a
//! single underlying connection, with per-stream flow control and
//! connection keepalive.
//!
//! Either peer may open streams; there is no client/server direction at
//! the stream layer. The server opens a stream per inbound public
//! request; the client opens streams for the handshake and later control
//! messages.

mod conn;
mod frame;
mod stream;

pub use frame::{Frame, FrameKind, MAX_FRAME_PAYLOAD};
pub use stream::MuxStream;

use crate::error::{Result, TunnelError};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};

/// Which side of the connection this session is; decides stream id
/// parity (client-opened streams are odd, server-opened even).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

/// Multiplexer tuning knobs.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Interval between keepalive pings; a ping still unanswered at the
    /// next tick closes the session.
    pub keepalive_interval: Duration,
    /// Per-stream receive window in bytes.
    pub window_size: usize,
    /// Upper bound on how long `open_stream` may block on the outbound
    /// queue.
    pub open_timeout: Duration,
    /// How long a locally-closed stream may wait for the peer's half-close
    /// before being reset.
    pub close_timeout: Duration,
    /// Incoming streams queued before the reader applies backpressure.
    pub accept_backlog: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            window_size: 256 * 1024,
            open_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(300),
            accept_backlog: 256,
        }
    }
}

/// Handle to a multiplexed session. Cheap to clone; the session lives
/// until [`MuxSession::close`] or an unrecoverable connection error.
#[derive(Clone)]
pub struct MuxSession {
    shared: Arc<conn::Shared>,
    accept_rx: Arc<Mutex<mpsc::Receiver<MuxStream>>>,
}

impl MuxSession {
    /// Start a session over any duplex byte stream.
    pub fn new<S>(io: S, mode: Mode, config: MuxConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (shared, accept_rx) = conn::start(io, mode, config);
        Self {
            shared,
            accept_rx: Arc::new(Mutex::new(accept_rx)),
        }
    }

    /// Open a new stream to the peer.
    pub async fn open_stream(&self) -> Result<MuxStream> {
        self.shared.open_stream().await
    }

    /// Wait for the next peer-initiated stream.
    ///
    /// Returns [`TunnelError::ConnectionClosed`] once the session ends.
    pub async fn accept_stream(&self) -> Result<MuxStream> {
        let mut rx = self.accept_rx.lock().await;
        rx.recv().await.ok_or(TunnelError::ConnectionClosed)
    }

    /// Close the session, cascading to every live stream. Idempotent.
    pub async fn close(&self) {
        self.shared.close().await;
    }

    /// Whether the session has ended (locally closed, peer went away, or
    /// keepalive failure).
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl std::fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn session_pair() -> (MuxSession, MuxSession) {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        (
            MuxSession::new(a, Mode::Client, MuxConfig::default()),
            MuxSession::new(b, Mode::Server, MuxConfig::default()),
        )
    }

    #[tokio::test]
    async fn open_accept_and_echo() {
        let (client, server) = session_pair();

        let server_task = tokio::spawn(async move {
            let mut stream = server.accept_stream().await.unwrap();
            let mut buf = vec![0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            stream.write_all(b"world").await.unwrap();
            stream.flush().await.unwrap();
        });

        let mut stream = client.open_stream().await.unwrap();
        assert_eq!(stream.id() % 2, 1);
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();

        let mut buf = vec![0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn server_can_open_streams_too() {
        let (client, server) = session_pair();

        let client_task = tokio::spawn(async move {
            let mut stream = client.accept_stream().await.unwrap();
            assert_eq!(stream.id() % 2, 0);
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let mut stream = server.open_stream().await.unwrap();
        stream.write_all(b"request bytes").await.unwrap();
        stream.shutdown().await.unwrap();

        assert_eq!(client_task.await.unwrap(), b"request bytes");
    }

    #[tokio::test]
    async fn many_concurrent_streams() {
        let (client, server) = session_pair();

        let echo_server = tokio::spawn(async move {
            loop {
                let Ok(mut stream) = server.accept_stream().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    stream.read_to_end(&mut buf).await.unwrap();
                    stream.write_all(&buf).await.unwrap();
                    stream.shutdown().await.unwrap();
                });
            }
        });

        let mut workers = Vec::new();
        for i in 0..100u32 {
            let client = client.clone();
            workers.push(tokio::spawn(async move {
                let mut stream = client.open_stream().await.unwrap();
                let payload = format!("stream-{i}-payload").into_bytes();
                stream.write_all(&payload).await.unwrap();
                stream.shutdown().await.unwrap();
                let mut echoed = Vec::new();
                stream.read_to_end(&mut echoed).await.unwrap();
                assert_eq!(echoed, payload);
            }));
        }
        for w in workers {
            w.await.unwrap();
        }

        client.close().await;
        echo_server.await.unwrap();
    }

    #[tokio::test]
    async fn transfers_larger_than_the_window() {
        let (client, server) = session_pair();

        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let server_task = tokio::spawn(async move {
            let mut stream = server.accept_stream().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let mut stream = client.open_stream().await.unwrap();
        stream.write_all(&payload).await.unwrap();
        stream.shutdown().await.unwrap();

        assert_eq!(server_task.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn close_cascades_and_is_idempotent() {
        let (client, server) = session_pair();

        let mut stream = client.open_stream().await.unwrap();
        let mut accepted = server.accept_stream().await.unwrap();

        client.close().await;
        client.close().await;
        assert!(client.is_closed());

        // Local stream ends rather than hanging.
        let mut buf = [0u8; 1];
        assert!(matches!(stream.read(&mut buf).await, Ok(0) | Err(_)));

        // The peer observes the closure too.
        assert!(matches!(accepted.read(&mut buf).await, Ok(0) | Err(_)));
        assert!(matches!(
            server.accept_stream().await,
            Err(TunnelError::ConnectionClosed)
        ));

        assert!(matches!(
            client.open_stream().await,
            Err(TunnelError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn keepalive_detects_a_dead_peer() {
        // The far end never speaks the mux protocol, so pings go
        // unanswered and the session must close itself.
        let (a, _quiet) = tokio::io::duplex(64 * 1024);
        let session = MuxSession::new(
            a,
            Mode::Client,
            MuxConfig {
                keepalive_interval: Duration::from_millis(50),
                ..Default::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn keepalive_keeps_a_live_pair_open() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let cfg = MuxConfig {
            keepalive_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let client = MuxSession::new(a, Mode::Client, cfg.clone());
        let server = MuxSession::new(b, Mode::Server, cfg);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!client.is_closed());
        assert!(!server.is_closed());
    }
}
