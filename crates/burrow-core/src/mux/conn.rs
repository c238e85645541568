//! Connection driver: frame routing, flow control and keepalive for one
//! mux session.
//!
//! One reader task dispatches incoming frames, one writer task drains the
//! shared outbound frame queue, and every stream gets a pair of relay
//! tasks bridging its in-memory pipe to the frame queue.

use super::frame::{Frame, FrameKind, MAX_FRAME_PAYLOAD};
use super::stream::MuxStream;
use super::{Mode, MuxConfig};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, trace, warn};

/// Outbound frame queue depth. Data frames also contend for per-stream
/// window credit, so this only bounds burst coalescing.
const FRAME_QUEUE_DEPTH: usize = 256;

/// Per-stream bookkeeping held by the session.
struct StreamSlot {
    /// Feeds the inbound relay; `None` once the peer half-closed.
    data_tx: Option<mpsc::Sender<Bytes>>,
    /// Send credit in bytes, replenished by peer window updates.
    send_window: Arc<Semaphore>,
    local_fin: bool,
    remote_fin: bool,
}

pub(super) struct Shared {
    pub(super) config: MuxConfig,
    streams: Mutex<HashMap<u32, StreamSlot>>,
    next_stream_id: AtomicU32,
    frame_tx: mpsc::Sender<Frame>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    /// Set when a ping is outstanding; cleared by the matching pong.
    awaiting_pong: AtomicBool,
}

impl Shared {
    pub(super) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tear the session down: signal every task, release every stream.
    pub(super) fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let mut streams = self.streams.lock().expect("mux stream table poisoned");
        for (_, slot) in streams.drain() {
            slot.send_window.close();
            // Dropping data_tx ends the inbound relay, which EOFs the app.
        }
    }

    /// Queue a GoAway then tear down. Best-effort on the notification.
    pub(super) async fn close(&self) {
        if !self.is_closed() {
            let _ = tokio::time::timeout(
                std::time::Duration::from_secs(1),
                self.frame_tx.send(Frame::go_away()),
            )
            .await;
        }
        self.shutdown();
    }

    fn remove_stream(&self, id: u32) {
        let mut streams = self.streams.lock().expect("mux stream table poisoned");
        if let Some(slot) = streams.remove(&id) {
            slot.send_window.close();
        }
    }

    /// Record that our side sent a Fin; reap the slot once both
    /// directions are done, otherwise arm the close timeout.
    fn mark_local_fin(self: &Arc<Self>, id: u32) {
        let fully_closed = {
            let mut streams = self.streams.lock().expect("mux stream table poisoned");
            match streams.get_mut(&id) {
                Some(slot) => {
                    slot.local_fin = true;
                    if slot.remote_fin {
                        streams.remove(&id);
                        true
                    } else {
                        false
                    }
                }
                None => true,
            }
        };

        if !fully_closed {
            let shared = self.clone();
            let timeout = self.config.close_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let lingering = {
                    let streams = shared.streams.lock().expect("mux stream table poisoned");
                    streams.contains_key(&id)
                };
                if lingering {
                    trace!(stream_id = id, "close timeout, resetting stream");
                    let _ = shared.frame_tx.try_send(Frame::reset(id));
                    shared.remove_stream(id);
                }
            });
        }
    }

    fn mark_remote_fin(&self, id: u32) {
        let mut streams = self.streams.lock().expect("mux stream table poisoned");
        if let Some(slot) = streams.get_mut(&id) {
            slot.data_tx = None;
            slot.remote_fin = true;
            if slot.local_fin {
                streams.remove(&id);
            }
        }
    }

    /// Create the pipe + relays for a stream id and return the app handle.
    fn register_stream(self: &Arc<Self>, id: u32) -> MuxStream {
        let window = self.config.window_size;
        let (app_io, mux_io) = tokio::io::duplex(window);
        let (relay_read, relay_write) = tokio::io::split(mux_io);

        let (data_tx, data_rx) = mpsc::channel::<Bytes>(window.max(16));
        let send_window = Arc::new(Semaphore::new(window));

        {
            let mut streams = self.streams.lock().expect("mux stream table poisoned");
            streams.insert(
                id,
                StreamSlot {
                    data_tx: Some(data_tx),
                    send_window: send_window.clone(),
                    local_fin: false,
                    remote_fin: false,
                },
            );
        }

        tokio::spawn(outbound_relay(
            id,
            relay_read,
            send_window,
            self.frame_tx.clone(),
            self.clone(),
        ));
        tokio::spawn(inbound_relay(
            id,
            relay_write,
            data_rx,
            self.frame_tx.clone(),
            self.clone(),
        ));

        MuxStream::new(id, app_io)
    }

    /// Allocate the next locally-initiated stream id and open it.
    pub(super) async fn open_stream(self: &Arc<Self>) -> crate::Result<MuxStream> {
        if self.is_closed() {
            return Err(crate::TunnelError::ConnectionClosed);
        }

        let id = self.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let stream = self.register_stream(id);

        match tokio::time::timeout(self.config.open_timeout, self.frame_tx.send(Frame::open(id)))
            .await
        {
            Ok(Ok(())) => Ok(stream),
            Ok(Err(_)) => {
                self.remove_stream(id);
                Err(crate::TunnelError::ConnectionClosed)
            }
            Err(_) => {
                self.remove_stream(id);
                Err(crate::TunnelError::Timeout)
            }
        }
    }

    /// Route one incoming frame. Returns `false` when the session should
    /// stop reading.
    async fn handle_frame(
        self: &Arc<Self>,
        frame: Frame,
        accept_tx: &mpsc::Sender<MuxStream>,
    ) -> bool {
        match frame.kind {
            FrameKind::Open => {
                let id = frame.stream_id;
                let expected_parity = match self.peer_mode() {
                    Mode::Client => 1,
                    Mode::Server => 0,
                };
                let already_known = {
                    let streams = self.streams.lock().expect("mux stream table poisoned");
                    streams.contains_key(&id)
                };
                if id % 2 != expected_parity || already_known {
                    warn!(stream_id = id, "rejecting invalid stream open");
                    let _ = self.frame_tx.try_send(Frame::reset(id));
                    return true;
                }
                let stream = self.register_stream(id);
                if accept_tx.send(stream).await.is_err() {
                    self.remove_stream(id);
                    let _ = self.frame_tx.try_send(Frame::reset(id));
                }
            }
            FrameKind::Data => {
                let id = frame.stream_id;
                let mut reset = false;
                {
                    let streams = self.streams.lock().expect("mux stream table poisoned");
                    match streams.get(&id).and_then(|s| s.data_tx.as_ref()) {
                        Some(tx) => match tx.try_send(frame.payload) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                // Peer overran the advertised window.
                                warn!(stream_id = id, "receive window exceeded");
                                reset = true;
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                // Stream torn down locally; drop the data.
                            }
                        },
                        None => {
                            trace!(stream_id = id, "data for unknown or closed stream");
                        }
                    }
                }
                if reset {
                    let _ = self.frame_tx.try_send(Frame::reset(id));
                    self.remove_stream(id);
                }
            }
            FrameKind::WindowUpdate => match frame.window_increment() {
                Ok(increment) => {
                    let streams = self.streams.lock().expect("mux stream table poisoned");
                    if let Some(slot) = streams.get(&frame.stream_id) {
                        slot.send_window.add_permits(increment as usize);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "dropping malformed window update");
                }
            },
            FrameKind::Fin => {
                self.mark_remote_fin(frame.stream_id);
            }
            FrameKind::Reset => {
                debug!(stream_id = frame.stream_id, "stream reset by peer");
                self.remove_stream(frame.stream_id);
            }
            FrameKind::Ping => {
                if let Ok(nonce) = frame.nonce() {
                    let _ = self.frame_tx.try_send(Frame::pong(nonce));
                }
            }
            FrameKind::Pong => {
                self.awaiting_pong.store(false, Ordering::SeqCst);
            }
            FrameKind::GoAway => {
                debug!("peer is going away");
                return false;
            }
        }
        true
    }

    /// The mode of the peer, used to validate incoming stream id parity.
    fn peer_mode(&self) -> Mode {
        // We allocate odd ids as a client, so a server peer allocates even.
        if self.next_stream_id.load(Ordering::Relaxed) % 2 == 1 {
            Mode::Server
        } else {
            Mode::Client
        }
    }
}

/// Build a session over the given duplex connection and spawn its tasks.
pub(super) fn start<S>(
    io: S,
    mode: Mode,
    config: MuxConfig,
) -> (Arc<Shared>, mpsc::Receiver<MuxStream>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(io);
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
    let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let shared = Arc::new(Shared {
        next_stream_id: AtomicU32::new(match mode {
            Mode::Client => 1,
            Mode::Server => 2,
        }),
        config,
        streams: Mutex::new(HashMap::new()),
        frame_tx,
        closed: AtomicBool::new(false),
        shutdown_tx,
        awaiting_pong: AtomicBool::new(false),
    });

    tokio::spawn(write_loop(write_half, frame_rx, shutdown_rx.clone(), shared.clone()));
    tokio::spawn(read_loop(read_half, accept_tx, shutdown_rx.clone(), shared.clone()));
    tokio::spawn(keepalive_loop(shutdown_rx, shared.clone()));

    (shared, accept_rx)
}

async fn write_loop<S>(
    mut writer: WriteHalf<S>,
    mut frame_rx: mpsc::Receiver<Frame>,
    mut shutdown_rx: watch::Receiver<bool>,
    shared: Arc<Shared>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        tokio::select! {
            biased;
            frame = frame_rx.recv() => {
                let Some(frame) = frame else { break };
                if frame.write_to(&mut writer).await.is_err() {
                    shared.shutdown();
                    return;
                }
                // Coalesce whatever is already queued before flushing.
                while let Ok(next) = frame_rx.try_recv() {
                    if next.write_to(&mut writer).await.is_err() {
                        shared.shutdown();
                        return;
                    }
                }
                if writer.flush().await.is_err() {
                    shared.shutdown();
                    return;
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    // Best-effort drain so a queued GoAway still reaches the peer.
    while let Ok(frame) = frame_rx.try_recv() {
        if frame.write_to(&mut writer).await.is_err() {
            return;
        }
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}

async fn read_loop<S>(
    mut reader: ReadHalf<S>,
    accept_tx: mpsc::Sender<MuxStream>,
    mut shutdown_rx: watch::Receiver<bool>,
    shared: Arc<Shared>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        tokio::select! {
            result = Frame::read_from(&mut reader) => {
                match result {
                    Ok(frame) => {
                        if !shared.handle_frame(frame, &accept_tx).await {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "mux connection read ended");
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    shared.shutdown();
}

async fn keepalive_loop(mut shutdown_rx: watch::Receiver<bool>, shared: Arc<Shared>) {
    let period = shared.config.keepalive_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if shared.awaiting_pong.swap(true, Ordering::SeqCst) {
                    warn!("keepalive timeout, closing session");
                    shared.shutdown();
                    return;
                }
                let nonce = rand::random::<u64>();
                if shared.frame_tx.send(Frame::ping(nonce)).await.is_err() {
                    return;
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

/// Pump app-written bytes out as Data frames, gated on send credit.
async fn outbound_relay(
    id: u32,
    mut pipe: ReadHalf<tokio::io::DuplexStream>,
    window: Arc<Semaphore>,
    frame_tx: mpsc::Sender<Frame>,
    shared: Arc<Shared>,
) {
    let mut buf = vec![0u8; MAX_FRAME_PAYLOAD];
    loop {
        let n = match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };

        match window.acquire_many(n as u32).await {
            Ok(permits) => permits.forget(),
            // Semaphore closed: stream was reset or the session ended.
            Err(_) => return,
        }

        if frame_tx
            .send(Frame::data(id, Bytes::copy_from_slice(&buf[..n])))
            .await
            .is_err()
        {
            return;
        }
    }

    // Half-close: the app shut down (or dropped) its write side.
    let _ = frame_tx.send(Frame::fin(id)).await;
    shared.mark_local_fin(id);
}

/// Deliver peer Data frames into the stream pipe, granting window credit
/// as bytes are buffered.
async fn inbound_relay(
    id: u32,
    mut pipe: WriteHalf<tokio::io::DuplexStream>,
    mut data_rx: mpsc::Receiver<Bytes>,
    frame_tx: mpsc::Sender<Frame>,
    shared: Arc<Shared>,
) {
    while let Some(chunk) = data_rx.recv().await {
        let len = chunk.len();
        if pipe.write_all(&chunk).await.is_err() {
            // The app dropped its end; tell the peer to stop sending.
            let _ = frame_tx.try_send(Frame::reset(id));
            shared.remove_stream(id);
            return;
        }
        if frame_tx
            .send(Frame::window_update(id, len as u32))
            .await
            .is_err()
        {
            return;
        }
    }

    // Peer half-closed (or the stream was torn down): EOF the app side.
    let _ = pipe.shutdown().await;
}
