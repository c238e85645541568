//! Pooled connections to a single local endpoint.
//!
//! The idle list is a LIFO stack; a background sweeper reaps entries that
//! outlive their lifetime or idle allowance.

use burrow_core::{Result, TunnelError};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace};

/// How often the sweeper walks the idle list.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections kept for reuse.
    pub max_idle: usize,
    /// Open-connection cap; 0 = unlimited.
    pub max_open: usize,
    /// Maximum age of a connection.
    pub max_lifetime: Duration,
    /// Maximum time a connection may sit idle.
    pub max_idle_time: Duration,
    /// Timeout for establishing new connections.
    pub dial_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 10,
            max_open: 100,
            max_lifetime: Duration::from_secs(300),
            max_idle_time: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(5),
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub addr: String,
    pub idle: usize,
    pub open: usize,
    /// Refusals due to exhaustion.
    pub wait_count: u64,
    /// Successful dials.
    pub total_conns: u64,
    /// Pool hits.
    pub total_reused: u64,
}

/// A connection checked out of (or destined for) the pool. Keeps its
/// creation time across get/put cycles.
#[derive(Debug)]
pub struct PooledConn {
    conn: TcpStream,
    created_at: Instant,
}

impl Deref for PooledConn {
    type Target = TcpStream;
    fn deref(&self) -> &TcpStream {
        &self.conn
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut TcpStream {
        &mut self.conn
    }
}

struct IdleConn {
    conn: TcpStream,
    created_at: Instant,
    last_used: Instant,
}

struct PoolInner {
    idle: Vec<IdleConn>,
    num_open: usize,
    closed: bool,
}

/// A pool of reusable connections to one `host:port`.
pub struct ConnectionPool {
    addr: String,
    config: PoolConfig,
    inner: Mutex<PoolInner>,
    wait_count: AtomicU64,
    total_conns: AtomicU64,
    total_reused: AtomicU64,
    sweeper_stop: watch::Sender<bool>,
}

impl ConnectionPool {
    pub fn new(addr: impl Into<String>, config: PoolConfig) -> Arc<Self> {
        let (sweeper_stop, mut stop_rx) = watch::channel(false);
        let pool = Arc::new(Self {
            addr: addr.into(),
            config,
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                num_open: 0,
                closed: false,
            }),
            wait_count: AtomicU64::new(0),
            total_conns: AtomicU64::new(0),
            total_reused: AtomicU64::new(0),
            sweeper_stop,
        });

        let sweeper = Arc::downgrade(&pool);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await; // the immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(pool) = sweeper.upgrade() else { return };
                        pool.sweep().await;
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });

        pool
    }

    /// Pop a healthy idle connection or dial a new one.
    pub async fn get(&self) -> Result<PooledConn> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(TunnelError::PoolClosed);
        }

        // Most recently used first.
        while let Some(entry) = inner.idle.pop() {
            if self.is_valid(&entry).await {
                self.total_reused.fetch_add(1, Ordering::Relaxed);
                trace!(addr = %self.addr, "reusing pooled connection");
                return Ok(PooledConn {
                    conn: entry.conn,
                    created_at: entry.created_at,
                });
            }
            // Stale; dropping it closes the socket.
            inner.num_open -= 1;
        }

        if self.config.max_open > 0 && inner.num_open >= self.config.max_open {
            self.wait_count.fetch_add(1, Ordering::Relaxed);
            return Err(TunnelError::PoolExhausted);
        }

        inner.num_open += 1;
        drop(inner); // not held across the dial

        let conn = match tokio::time::timeout(
            self.config.dial_timeout,
            TcpStream::connect(&self.addr),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                self.inner.lock().await.num_open -= 1;
                return Err(e.into());
            }
            Err(_) => {
                self.inner.lock().await.num_open -= 1;
                return Err(TunnelError::Timeout);
            }
        };

        self.total_conns.fetch_add(1, Ordering::Relaxed);
        debug!(addr = %self.addr, "dialed local connection");
        Ok(PooledConn {
            conn,
            created_at: Instant::now(),
        })
    }

    /// Return a connection for reuse. Closed pools and full idle lists
    /// drop it instead.
    pub async fn put(&self, conn: PooledConn) {
        let mut inner = self.inner.lock().await;
        if inner.closed || inner.idle.len() >= self.config.max_idle {
            inner.num_open -= 1;
            return;
        }

        inner.idle.push(IdleConn {
            conn: conn.conn,
            created_at: conn.created_at,
            last_used: Instant::now(),
        });
    }

    /// Close the pool and every idle connection.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.idle.clear();
        inner.num_open = 0;
        let _ = self.sweeper_stop.send(true);
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        PoolStats {
            addr: self.addr.clone(),
            idle: inner.idle.len(),
            open: inner.num_open,
            wait_count: self.wait_count.load(Ordering::Relaxed),
            total_conns: self.total_conns.load(Ordering::Relaxed),
            total_reused: self.total_reused.load(Ordering::Relaxed),
        }
    }

    /// Age checks plus a liveness probe. The probe peeks rather than
    /// reads, so bytes already buffered on a keepalive connection are
    /// preserved for the next user.
    async fn is_valid(&self, entry: &IdleConn) -> bool {
        let now = Instant::now();
        if !self.config.max_lifetime.is_zero()
            && now.duration_since(entry.created_at) > self.config.max_lifetime
        {
            return false;
        }
        if !self.config.max_idle_time.is_zero()
            && now.duration_since(entry.last_used) > self.config.max_idle_time
        {
            return false;
        }

        let mut probe = [0u8; 1];
        match tokio::time::timeout(Duration::from_millis(1), entry.conn.peek(&mut probe)).await {
            Err(_) => true,      // nothing readable within 1ms: healthy and quiet
            Ok(Ok(0)) => false,  // EOF: peer closed
            Ok(Ok(_)) => true,   // buffered data, left in place
            Ok(Err(_)) => false, // hard error
        }
    }

    /// Drop idle entries past their lifetime or idle allowance.
    async fn sweep(&self) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }

        let now = Instant::now();
        let max_lifetime = self.config.max_lifetime;
        let max_idle_time = self.config.max_idle_time;
        let before = inner.idle.len();

        let mut kept = Vec::with_capacity(before);
        let mut dropped = 0usize;
        for entry in inner.idle.drain(..) {
            let expired = (!max_lifetime.is_zero()
                && now.duration_since(entry.created_at) > max_lifetime)
                || (!max_idle_time.is_zero()
                    && now.duration_since(entry.last_used) > max_idle_time);
            if expired {
                dropped += 1;
            } else {
                kept.push(entry);
            }
        }
        inner.idle = kept;
        inner.num_open -= dropped;

        if dropped > 0 {
            debug!(addr = %self.addr, dropped, "swept stale pooled connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn accepting_listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[tokio::test]
    async fn dial_put_reuse() {
        let (listener, addr) = accepting_listener().await;
        tokio::spawn(async move {
            loop {
                let Ok((conn, _)) = listener.accept().await else {
                    return;
                };
                // Hold server ends open.
                tokio::spawn(async move {
                    let mut conn = conn;
                    let mut buf = [0u8; 64];
                    while matches!(conn.read(&mut buf).await, Ok(n) if n > 0) {}
                });
            }
        });

        let pool = ConnectionPool::new(addr, PoolConfig::default());

        let first = pool.get().await.unwrap();
        pool.put(first).await;
        let _second = pool.get().await.unwrap();

        let stats = pool.stats().await;
        assert_eq!(stats.total_conns, 1);
        assert_eq!(stats.total_reused, 1);
        assert_eq!(stats.open, 1);
    }

    #[tokio::test]
    async fn exhaustion_with_max_open_one() {
        let (listener, addr) = accepting_listener().await;
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((conn, _)) = listener.accept().await {
                held.push(conn);
            }
        });

        let pool = ConnectionPool::new(
            addr,
            PoolConfig {
                max_open: 1,
                ..Default::default()
            },
        );

        let held = pool.get().await.unwrap();
        match pool.get().await {
            Err(TunnelError::PoolExhausted) => {}
            other => panic!("expected PoolExhausted, got {other:?}"),
        }
        assert_eq!(pool.stats().await.wait_count, 1);

        // Releasing the holder frees the slot again.
        pool.put(held).await;
        let _again = pool.get().await.unwrap();
    }

    #[tokio::test]
    async fn probe_does_not_consume_buffered_bytes() {
        let (listener, addr) = accepting_listener().await;
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            // Data that arrives while the connection sits in the pool.
            conn.write_all(b"queued").await.unwrap();
            // Keep the socket open.
            let mut buf = [0u8; 16];
            let _ = conn.read(&mut buf).await;
        });

        let pool = ConnectionPool::new(addr, PoolConfig::default());
        let conn = pool.get().await.unwrap();
        pool.put(conn).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The validity probe must classify the connection as healthy
        // without eating the buffered bytes.
        let mut conn = pool.get().await.unwrap();
        let mut buf = [0u8; 6];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"queued");
        assert_eq!(pool.stats().await.total_reused, 1);
    }

    #[tokio::test]
    async fn dead_connections_are_rejected() {
        let (listener, addr) = accepting_listener().await;
        let pool = ConnectionPool::new(addr, PoolConfig::default());

        // Accept then immediately close the server side.
        let accept = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            drop(conn);
        });

        let conn = pool.get().await.unwrap();
        pool.put(conn).await;
        accept.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The pooled connection is now EOF; get() must discard it and the
        // dial fails because the listener is gone.
        assert!(pool.get().await.is_err());
        assert_eq!(pool.stats().await.total_reused, 0);
    }

    #[tokio::test]
    async fn expired_entries_are_not_reused() {
        let (listener, addr) = accepting_listener().await;
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((conn, _)) = listener.accept().await {
                held.push(conn);
            }
        });

        let pool = ConnectionPool::new(
            addr,
            PoolConfig {
                max_idle_time: Duration::from_millis(20),
                ..Default::default()
            },
        );

        let conn = pool.get().await.unwrap();
        pool.put(conn).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let _fresh = pool.get().await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.total_reused, 0);
        assert_eq!(stats.total_conns, 2);
    }

    #[tokio::test]
    async fn closed_pool_refuses() {
        let (_listener, addr) = accepting_listener().await;
        let pool = ConnectionPool::new(addr, PoolConfig::default());
        pool.close().await;
        assert!(matches!(pool.get().await, Err(TunnelError::PoolClosed)));
    }
}
