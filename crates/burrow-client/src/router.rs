//! Routes server-opened streams to local services, through per-port
//! connection pools.

use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use burrow_core::mux::MuxStream;
use burrow_core::{Result, StreamHeader, TunnelConfig, TunnelError};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tracing::debug;

/// Per-local-port pools plus a direct-dial fallback.
pub struct LocalRouter {
    pools: RwLock<HashMap<u16, Arc<ConnectionPool>>>,
    pool_config: PoolConfig,
}

impl LocalRouter {
    /// Build the router with one pool per configured tunnel.
    pub fn new(tunnels: &[TunnelConfig], pool_config: PoolConfig) -> Self {
        let mut pools = HashMap::new();
        for tunnel in tunnels {
            pools.insert(
                tunnel.local_port,
                ConnectionPool::new(tunnel.local_addr(), pool_config.clone()),
            );
        }
        Self {
            pools: RwLock::new(pools),
            pool_config,
        }
    }

    /// Pipe a tunnel stream to the local endpoint the header names.
    pub async fn forward(&self, stream: &mut MuxStream, header: &StreamHeader) -> Result<()> {
        let pool = self.pools.read().await.get(&header.local_port).cloned();

        match pool {
            Some(pool) => {
                let mut conn = pool.get().await?;
                let result = tokio::io::copy_bidirectional(stream, &mut *conn).await;
                pool.put(conn).await;
                finish_copy(result)
            }
            None => {
                // No pool registered for this port; dial directly.
                debug!(addr = %header.local_addr(), "no pool, dialing directly");
                let mut conn = tokio::time::timeout(
                    self.pool_config.dial_timeout,
                    TcpStream::connect(header.local_addr()),
                )
                .await
                .map_err(|_| TunnelError::Timeout)??;
                let result = tokio::io::copy_bidirectional(stream, &mut conn).await;
                finish_copy(result)
            }
        }
    }

    /// Register a pool for a tunnel added after startup.
    pub async fn add_pool(&self, port: u16, host: &str) {
        let host = if host.is_empty() { "127.0.0.1" } else { host };
        let addr = format!("{host}:{port}");
        self.pools
            .write()
            .await
            .insert(port, ConnectionPool::new(addr, self.pool_config.clone()));
    }

    pub async fn remove_pool(&self, port: u16) {
        if let Some(pool) = self.pools.write().await.remove(&port) {
            pool.close().await;
        }
    }

    /// Close every pool and drop them.
    pub async fn close(&self) {
        let mut pools = self.pools.write().await;
        for (_, pool) in pools.drain() {
            pool.close().await;
        }
    }

    pub async fn pool_stats(&self) -> HashMap<u16, PoolStats> {
        let pools = self.pools.read().await;
        let mut stats = HashMap::new();
        for (port, pool) in pools.iter() {
            stats.insert(*port, pool.stats().await);
        }
        stats
    }
}

/// A torn-down peer mid-copy is a normal end of exchange, not a failure.
fn finish_copy(result: io::Result<(u64, u64)>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
            ) =>
        {
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
