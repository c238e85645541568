//! burrow tunnel client.
//!
//! Dials the tunnel server, establishes a multiplexed session via the
//! handshake, then accepts server-opened streams and pipes each one to a
//! pooled connection to the local service it targets. Reconnects with
//! exponential backoff when the session drops.

pub mod config;
pub mod pool;
pub mod reconnect;
pub mod router;
pub mod transport;
pub mod tunnel;

pub use config::{ClientConfig, ReconnectConfig};
pub use pool::{ConnectionPool, PoolConfig, PoolStats};
pub use reconnect::Reconnector;
pub use router::LocalRouter;
pub use tunnel::{ClientState, RequestInfo, TunnelClient};
