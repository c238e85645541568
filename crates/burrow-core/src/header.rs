//! Stream headers: the framed object sent once at the start of every
//! server-opened stream, identifying the target tunnel and request.
//!
//! Same `[u32 BE length][JSON]` framing as the control codec, with a much
//! smaller size cap. The handshake stream is the one stream that does NOT
//! carry a header; its first frame is a control envelope.

use crate::error::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed size for a serialized stream header.
pub const MAX_STREAM_HEADER_SIZE: usize = 4096;

/// Identifies the kind of traffic a stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Http,
    Tcp,
    Websocket,
}

/// Sent at the beginning of each multiplexed stream to tell the client
/// which local endpoint to forward to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamHeader {
    /// Kind of stream, for proper handling on the client.
    #[serde(rename = "type")]
    pub kind: StreamKind,

    /// Target local port on the client.
    pub local_port: u16,

    /// Target local host on the client (default: 127.0.0.1).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_host: String,

    /// Unique identifier for request correlation and logging.
    pub request_id: String,

    /// The tunnel this stream belongs to.
    pub subdomain: String,

    /// Original client IP address.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote_addr: String,

    /// Original Host header (HTTP streams).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,

    /// HTTP method, for request inspection.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,

    /// HTTP request path, for request inspection.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

impl StreamHeader {
    /// Check the header carries usable values.
    pub fn validate(&self) -> Result<()> {
        if self.local_port == 0 {
            return Err(TunnelError::InvalidMessage(
                "local_port must be between 1 and 65535".into(),
            ));
        }
        if self.request_id.is_empty() {
            return Err(TunnelError::InvalidMessage("request_id is required".into()));
        }
        Ok(())
    }

    /// The full local address (host:port) to connect to.
    pub fn local_addr(&self) -> String {
        let host = if self.local_host.is_empty() {
            "127.0.0.1"
        } else {
            &self.local_host
        };
        format!("{}:{}", host, self.local_port)
    }
}

/// Write a stream header frame.
pub async fn write_stream_header<W: AsyncWrite + Unpin>(
    w: &mut W,
    header: &StreamHeader,
) -> Result<()> {
    let data = serde_json::to_vec(header)?;
    if data.len() > MAX_STREAM_HEADER_SIZE {
        return Err(TunnelError::MessageTooLarge {
            size: data.len(),
            max: MAX_STREAM_HEADER_SIZE,
        });
    }

    w.write_all(&(data.len() as u32).to_be_bytes()).await?;
    w.write_all(&data).await?;
    w.flush().await?;
    Ok(())
}

/// Read a stream header frame.
pub async fn read_stream_header<R: AsyncRead + Unpin>(r: &mut R) -> Result<StreamHeader> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;

    let length = u32::from_be_bytes(len_buf) as usize;
    if length == 0 {
        return Err(TunnelError::InvalidMessage(
            "stream header length cannot be zero".into(),
        ));
    }
    if length > MAX_STREAM_HEADER_SIZE {
        return Err(TunnelError::MessageTooLarge {
            size: length,
            max: MAX_STREAM_HEADER_SIZE,
        });
    }

    let mut data = vec![0u8; length];
    r.read_exact(&mut data).await?;

    serde_json::from_slice(&data)
        .map_err(|e| TunnelError::InvalidMessage(format!("failed to unmarshal stream header: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> StreamHeader {
        StreamHeader {
            kind: StreamKind::Http,
            local_port: 3000,
            local_host: String::new(),
            request_id: "req_1234".into(),
            subdomain: "api".into(),
            remote_addr: "203.0.113.9:51442".into(),
            host: "api.example.test".into(),
            method: "GET".into(),
            path: "/".into(),
        }
    }

    #[tokio::test]
    async fn round_trip() {
        let (mut a, mut b) = tokio::io::duplex(8192);
        write_stream_header(&mut a, &header()).await.unwrap();
        let got = read_stream_header(&mut b).await.unwrap();
        assert_eq!(got.kind, StreamKind::Http);
        assert_eq!(got.local_port, 3000);
        assert_eq!(got.request_id, "req_1234");
        assert_eq!(got.local_addr(), "127.0.0.1:3000");
        got.validate().unwrap();
    }

    #[tokio::test]
    async fn zero_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&0u32.to_be_bytes()).await.unwrap();
        assert!(matches!(
            read_stream_header(&mut b).await,
            Err(TunnelError::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn oversize_rejected_both_ways() {
        let (mut a, mut b) = tokio::io::duplex(16 * 1024);

        let mut big = header();
        big.path = "p".repeat(MAX_STREAM_HEADER_SIZE);
        assert!(matches!(
            write_stream_header(&mut a, &big).await,
            Err(TunnelError::MessageTooLarge { .. })
        ));

        a.write_all(&((MAX_STREAM_HEADER_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(matches!(
            read_stream_header(&mut b).await,
            Err(TunnelError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn validation_edges() {
        let mut h = header();
        h.validate().unwrap();

        h.local_port = 0;
        assert!(h.validate().is_err());
        h.local_port = 1;
        h.validate().unwrap();
        h.local_port = 65535;
        h.validate().unwrap();

        h.request_id = String::new();
        assert!(h.validate().is_err());
    }

    #[test]
    fn kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&StreamKind::Websocket).unwrap(),
            "\"websocket\""
        );
        // An unknown stream type must fail to parse rather than default.
        assert!(serde_json::from_str::<StreamKind>("\"smtp\"").is_err());
    }
}
