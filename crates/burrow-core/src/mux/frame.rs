//! Multiplexer wire frames.
//!
//! Layout: `[1-byte kind][4-byte BE stream id][4-byte BE length][payload]`.
//! Stream id 0 is the connection itself (ping/pong/goaway).

use crate::error::{Result, TunnelError};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload carried by a single frame. Data larger than this is
/// split across frames by the per-stream relay.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Opens a new stream with the carried id.
    Open = 0x01,
    /// Stream data.
    Data = 0x02,
    /// Grants the peer more send credit on a stream (4-byte BE increment).
    WindowUpdate = 0x03,
    /// Half-closes the sender's direction of a stream.
    Fin = 0x04,
    /// Abruptly tears a stream down.
    Reset = 0x05,
    /// Connection keepalive probe (8-byte nonce).
    Ping = 0x06,
    /// Keepalive answer echoing the nonce.
    Pong = 0x07,
    /// The sender is closing the connection.
    GoAway = 0x08,
}

impl FrameKind {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0x01 => FrameKind::Open,
            0x02 => FrameKind::Data,
            0x03 => FrameKind::WindowUpdate,
            0x04 => FrameKind::Fin,
            0x05 => FrameKind::Reset,
            0x06 => FrameKind::Ping,
            0x07 => FrameKind::Pong,
            0x08 => FrameKind::GoAway,
            other => {
                return Err(TunnelError::Protocol(format!(
                    "unknown frame kind 0x{other:02x}"
                )))
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn open(stream_id: u32) -> Self {
        Self {
            kind: FrameKind::Open,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        debug_assert!(payload.len() <= MAX_FRAME_PAYLOAD);
        Self {
            kind: FrameKind::Data,
            stream_id,
            payload,
        }
    }

    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        Self {
            kind: FrameKind::WindowUpdate,
            stream_id,
            payload: Bytes::copy_from_slice(&increment.to_be_bytes()),
        }
    }

    pub fn fin(stream_id: u32) -> Self {
        Self {
            kind: FrameKind::Fin,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn reset(stream_id: u32) -> Self {
        Self {
            kind: FrameKind::Reset,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn ping(nonce: u64) -> Self {
        Self {
            kind: FrameKind::Ping,
            stream_id: 0,
            payload: Bytes::copy_from_slice(&nonce.to_be_bytes()),
        }
    }

    pub fn pong(nonce: u64) -> Self {
        Self {
            kind: FrameKind::Pong,
            stream_id: 0,
            payload: Bytes::copy_from_slice(&nonce.to_be_bytes()),
        }
    }

    pub fn go_away() -> Self {
        Self {
            kind: FrameKind::GoAway,
            stream_id: 0,
            payload: Bytes::new(),
        }
    }

    /// Decode the window-update increment payload.
    pub fn window_increment(&self) -> Result<u32> {
        let bytes: [u8; 4] = self
            .payload
            .as_ref()
            .try_into()
            .map_err(|_| TunnelError::Protocol("malformed window update".into()))?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Decode the ping/pong nonce payload.
    pub fn nonce(&self) -> Result<u64> {
        let bytes: [u8; 8] = self
            .payload
            .as_ref()
            .try_into()
            .map_err(|_| TunnelError::Protocol("malformed ping payload".into()))?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Read one frame from the connection.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame> {
        let mut header = [0u8; 9];
        r.read_exact(&mut header).await?;

        let kind = FrameKind::from_u8(header[0])?;
        let stream_id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        let length = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
        if length > MAX_FRAME_PAYLOAD {
            return Err(TunnelError::Protocol(format!(
                "frame payload {length} exceeds maximum of {MAX_FRAME_PAYLOAD} bytes"
            )));
        }

        let mut payload = vec![0u8; length];
        r.read_exact(&mut payload).await?;

        Ok(Frame {
            kind,
            stream_id,
            payload: payload.into(),
        })
    }

    /// Write one frame to the connection.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        let mut header = [0u8; 9];
        header[0] = self.kind as u8;
        header[1..5].copy_from_slice(&self.stream_id.to_be_bytes());
        header[5..9].copy_from_slice(&(self.payload.len() as u32).to_be_bytes());
        w.write_all(&header).await?;
        if !self.payload.is_empty() {
            w.write_all(&self.payload).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);

        for frame in [
            Frame::open(1),
            Frame::data(1, Bytes::from_static(b"hello")),
            Frame::window_update(1, 4096),
            Frame::fin(1),
            Frame::reset(3),
            Frame::ping(0xDEADBEEF),
            Frame::pong(0xDEADBEEF),
            Frame::go_away(),
        ] {
            frame.write_to(&mut a).await.unwrap();
            let got = Frame::read_from(&mut b).await.unwrap();
            assert_eq!(got.kind, frame.kind);
            assert_eq!(got.stream_id, frame.stream_id);
            assert_eq!(got.payload, frame.payload);
        }
    }

    #[tokio::test]
    async fn decode_helpers() {
        let wu = Frame::window_update(7, 123456);
        assert_eq!(wu.window_increment().unwrap(), 123456);
        let ping = Frame::ping(42);
        assert_eq!(ping.nonce().unwrap(), 42);
        assert!(Frame::open(1).window_increment().is_err());
    }

    #[tokio::test]
    async fn rejects_unknown_kind_and_oversize() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&[0xFF, 0, 0, 0, 1, 0, 0, 0, 0]).await.unwrap();
        assert!(matches!(
            Frame::read_from(&mut b).await,
            Err(TunnelError::Protocol(_))
        ));

        let mut header = [0u8; 9];
        header[0] = FrameKind::Data as u8;
        header[5..9].copy_from_slice(&((MAX_FRAME_PAYLOAD as u32) + 1).to_be_bytes());
        a.write_all(&header).await.unwrap();
        assert!(matches!(
            Frame::read_from(&mut b).await,
            Err(TunnelError::Protocol(_))
        ));
    }
}
