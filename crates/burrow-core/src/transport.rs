//! Transport adapters.
//!
//! The multiplexer and everything above it only care about a duplex byte
//! stream. [`WsByteStream`] makes a WebSocket connection look like one,
//! so the control plane and client dispatcher are oblivious to whether a
//! session arrived over raw TCP or an HTTP upgrade.

use futures_util::{Sink, Stream};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

fn ws_to_io(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, "websocket closed")
        }
        other => io::Error::other(other),
    }
}

/// Byte-stream view of a WebSocket connection.
///
/// Outgoing bytes are sent as binary messages; incoming binary (and text)
/// messages are surfaced as bytes. Pings are answered by the protocol
/// layer; a close frame maps to EOF.
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    read_buf: Vec<u8>,
    read_offset: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> WsByteStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Vec::new(),
            read_offset: 0,
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for WsByteStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // Drain leftover bytes from a previous message first.
        if this.read_offset < this.read_buf.len() {
            let available = &this.read_buf[this.read_offset..];
            let n = available.len().min(buf.remaining());
            buf.put_slice(&available[..n]);
            this.read_offset += n;
            if this.read_offset >= this.read_buf.len() {
                this.read_buf.clear();
                this.read_offset = 0;
            }
            return Poll::Ready(Ok(()));
        }

        loop {
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(msg))) => {
                    let data = match msg {
                        Message::Binary(data) => data,
                        Message::Text(text) => text.into_bytes(),
                        // Ping/pong are handled by the protocol layer.
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                        Message::Close(_) => return Poll::Ready(Ok(())),
                    };
                    if data.is_empty() {
                        continue;
                    }
                    let n = data.len().min(buf.remaining());
                    buf.put_slice(&data[..n]);
                    if n < data.len() {
                        this.read_buf = data;
                        this.read_offset = n;
                    }
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(ws_to_io(e))),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for WsByteStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                Pin::new(&mut this.inner)
                    .start_send(Message::Binary(buf.to_vec()))
                    .map_err(ws_to_io)?;
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(ws_to_io(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_flush(cx).map_err(ws_to_io)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_close(cx).map_err(ws_to_io)
    }
}
