//! Length-prefixed JSON framing for control streams.
//!
//! Wire format: `[4-byte big-endian length][JSON payload]`.
//!
//! Reads and writes are independently serialized, so one reader and one
//! writer may run concurrently while concurrent writers (or readers) take
//! turns.

use crate::error::{Result, TunnelError};
use crate::messages::{
    Envelope, ErrorMessage, HandshakeRequest, HandshakeResponse, MessageType, PingMessage,
    PongMessage, ShutdownMessage, TunnelUpdateResponse,
};
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

/// Maximum allowed size for a control message frame.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Encodes and decodes control envelopes over a duplex byte stream.
pub struct Codec<S> {
    reader: Mutex<BufReader<ReadHalf<S>>>,
    writer: Mutex<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite> Codec<S> {
    /// Wrap a duplex stream in a codec.
    pub fn new(stream: S) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(BufReader::new(r)),
            writer: Mutex::new(w),
        }
    }

    /// Serialize and write one envelope.
    pub async fn write_message(&self, envelope: &Envelope) -> Result<()> {
        let data = serde_json::to_vec(envelope)?;
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(TunnelError::MessageTooLarge {
                size: data.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let mut writer = self.writer.lock().await;
        writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read and decode one envelope.
    ///
    /// EOF at a frame boundary is reported as [`TunnelError::ConnectionClosed`];
    /// EOF inside a frame is a protocol violation.
    pub async fn read_message(&self) -> Result<Envelope> {
        let mut reader = self.reader.lock().await;

        // The first byte distinguishes a clean close (EOF between frames)
        // from a truncated frame.
        let mut len_buf = [0u8; 4];
        if reader.read(&mut len_buf[..1]).await? == 0 {
            return Err(TunnelError::ConnectionClosed);
        }
        match reader.read_exact(&mut len_buf[1..]).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TunnelError::InvalidMessage(
                    "connection closed mid-frame".into(),
                ));
            }
            Err(e) => return Err(e.into()),
        }

        let length = u32::from_be_bytes(len_buf) as usize;
        if length == 0 {
            return Err(TunnelError::InvalidMessage(
                "message length cannot be zero".into(),
            ));
        }
        if length > MAX_MESSAGE_SIZE {
            return Err(TunnelError::MessageTooLarge {
                size: length,
                max: MAX_MESSAGE_SIZE,
            });
        }

        let mut data = vec![0u8; length];
        match reader.read_exact(&mut data).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TunnelError::InvalidMessage(
                    "connection closed mid-frame".into(),
                ));
            }
            Err(e) => return Err(e.into()),
        }

        serde_json::from_slice(&data)
            .map_err(|e| TunnelError::InvalidMessage(format!("failed to unmarshal envelope: {e}")))
    }

    /// Send a handshake request.
    pub async fn send_handshake(&self, req: &HandshakeRequest) -> Result<()> {
        self.write_message(&Envelope::new(MessageType::Handshake, "", req)?)
            .await
    }

    /// Send a handshake response.
    pub async fn send_handshake_response(&self, resp: &HandshakeResponse) -> Result<()> {
        self.write_message(&Envelope::new(MessageType::HandshakeResponse, "", resp)?)
            .await
    }

    /// Send a keepalive ping.
    pub async fn send_ping(&self) -> Result<()> {
        let msg = PingMessage {
            timestamp: Utc::now(),
        };
        self.write_message(&Envelope::new(MessageType::Ping, "", &msg)?)
            .await
    }

    /// Send a pong answering the given ping.
    pub async fn send_pong(&self, ping: &PingMessage) -> Result<()> {
        let msg = PongMessage {
            timestamp: Utc::now(),
            ping_timestamp: ping.timestamp,
        };
        self.write_message(&Envelope::new(MessageType::Pong, "", &msg)?)
            .await
    }

    /// Send a tunnel update response.
    pub async fn send_tunnel_update(
        &self,
        request_id: &str,
        resp: &TunnelUpdateResponse,
    ) -> Result<()> {
        self.write_message(&Envelope::new(MessageType::TunnelUpdate, request_id, resp)?)
            .await
    }

    /// Send an error message.
    pub async fn send_error(&self, request_id: &str, code: &str, message: &str) -> Result<()> {
        let msg = ErrorMessage {
            code: code.to_string(),
            message: message.to_string(),
            details: String::new(),
        };
        self.write_message(&Envelope::new(MessageType::Error, request_id, &msg)?)
            .await
    }

    /// Send a shutdown notification.
    pub async fn send_shutdown(&self, reason: &str, grace_period_ms: u64) -> Result<()> {
        let msg = ShutdownMessage {
            reason: reason.to_string(),
            grace_period_ms,
        };
        self.write_message(&Envelope::new(MessageType::Shutdown, "", &msg)?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::TunnelConfig;

    fn pair() -> (Codec<tokio::io::DuplexStream>, Codec<tokio::io::DuplexStream>) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (Codec::new(a), Codec::new(b))
    }

    #[tokio::test]
    async fn round_trip_all_message_types() {
        let (client, server) = pair();

        let handshake = HandshakeRequest {
            version: 1,
            token: "secret".into(),
            client_id: "test".into(),
            tunnels: vec![TunnelConfig {
                subdomain: "api".into(),
                local_port: 3000,
                local_host: "127.0.0.1".into(),
                protocol: "http".into(),
            }],
            capabilities: vec!["reconnect".into()],
        };
        client.send_handshake(&handshake).await.unwrap();
        let env = server.read_message().await.unwrap();
        assert_eq!(env.msg_type, MessageType::Handshake);
        let decoded: HandshakeRequest = env.decode_payload().unwrap();
        assert_eq!(decoded.token, "secret");
        assert_eq!(decoded.tunnels.len(), 1);

        let resp = HandshakeResponse {
            success: true,
            session_id: "sess_abc".into(),
            server_version: 1,
            ..Default::default()
        };
        server.send_handshake_response(&resp).await.unwrap();
        let env = client.read_message().await.unwrap();
        assert_eq!(env.msg_type, MessageType::HandshakeResponse);

        for (send, expect) in [
            (client.send_ping().await, MessageType::Ping),
            (
                client.send_shutdown("bye", 1000).await,
                MessageType::Shutdown,
            ),
            (
                client.send_error("req_1", "PROTOCOL_ERROR", "oops").await,
                MessageType::Error,
            ),
        ] {
            send.unwrap();
            let env = server.read_message().await.unwrap();
            assert_eq!(env.msg_type, expect);
        }

        // Remaining types travel as plain envelopes.
        for msg_type in [
            MessageType::AddTunnel,
            MessageType::RemoveTunnel,
            MessageType::TunnelUpdate,
            MessageType::Pong,
        ] {
            let env = Envelope::new(msg_type, "", &serde_json::json!({})).unwrap();
            client.write_message(&env).await.unwrap();
            let got = server.read_message().await.unwrap();
            assert_eq!(got.msg_type, msg_type);
        }
    }

    #[tokio::test]
    async fn rejects_oversize_on_write() {
        let (client, _server) = pair();
        let big = "x".repeat(MAX_MESSAGE_SIZE);
        let env = Envelope::new(MessageType::Error, "", &serde_json::json!({ "blob": big }))
            .unwrap();
        match client.write_message(&env).await {
            Err(TunnelError::MessageTooLarge { .. }) => {}
            other => panic!("expected MessageTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_oversize_and_zero_length_on_read() {
        // Hand-craft frames to hit the exact length boundaries.
        let (mut raw, peer) = tokio::io::duplex(256 * 1024);
        let codec = Codec::new(peer);

        // length == MAX + 1 is rejected before the payload is read
        raw.write_all(&((MAX_MESSAGE_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        match codec.read_message().await {
            Err(TunnelError::MessageTooLarge { size, .. }) => {
                assert_eq!(size, MAX_MESSAGE_SIZE + 1)
            }
            other => panic!("expected MessageTooLarge, got {other:?}"),
        }

        // zero-length frame
        raw.write_all(&0u32.to_be_bytes()).await.unwrap();
        match codec.read_message().await {
            Err(TunnelError::InvalidMessage(_)) => {}
            other => panic!("expected InvalidMessage, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn accepts_frame_at_exact_limit() {
        // A frame whose declared length is exactly MAX_MESSAGE_SIZE must be
        // read in full (the payload here is padded JSON).
        let (mut raw, peer) = tokio::io::duplex(512 * 1024);
        let codec = Codec::new(peer);

        let pad_len = MAX_MESSAGE_SIZE
            - serde_json::to_vec(&serde_json::json!({
                "type": "ping",
                "timestamp": "2024-01-01T00:00:00Z",
                "payload": { "pad": "" }
            }))
            .unwrap()
            .len();
        let env = serde_json::json!({
            "type": "ping",
            "timestamp": "2024-01-01T00:00:00Z",
            "payload": { "pad": "p".repeat(pad_len) }
        });
        let data = serde_json::to_vec(&env).unwrap();
        assert_eq!(data.len(), MAX_MESSAGE_SIZE);

        raw.write_all(&(data.len() as u32).to_be_bytes())
            .await
            .unwrap();
        raw.write_all(&data).await.unwrap();

        let got = codec.read_message().await.unwrap();
        assert_eq!(got.msg_type, MessageType::Ping);
    }

    #[tokio::test]
    async fn eof_at_boundary_vs_mid_frame() {
        // Clean close before any frame: ConnectionClosed.
        let (raw, peer) = tokio::io::duplex(1024);
        let codec = Codec::new(peer);
        drop(raw);
        assert!(matches!(
            codec.read_message().await,
            Err(TunnelError::ConnectionClosed)
        ));

        // Close after the length prefix: InvalidMessage.
        let (mut raw, peer) = tokio::io::duplex(1024);
        let codec = Codec::new(peer);
        raw.write_all(&100u32.to_be_bytes()).await.unwrap();
        drop(raw);
        assert!(matches!(
            codec.read_message().await,
            Err(TunnelError::InvalidMessage(_))
        ));
    }
}
