//! burrow tunnel server.
//!
//! Accepts long-lived client connections on the control plane, indexes
//! their tunnels in the registry, and bridges inbound public HTTP (and
//! WebSocket) requests onto multiplexed streams back to the owning
//! client.

pub mod auth;
pub mod config;
pub mod control;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod session;
pub mod wscontrol;

pub use auth::{Authenticator, NoOpAuthenticator, OwnerChecker, TokenAuthenticator};
pub use config::ServerConfig;
pub use control::ControlPlane;
pub use registry::{Registry, TunnelEntry};
pub use server::{ServerHandles, TunnelServer};
pub use session::{Session, SessionState};
