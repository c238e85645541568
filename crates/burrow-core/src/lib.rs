//! Core protocol for burrow tunnels: control-message framing, stream
//! headers, and the stream multiplexer that carries many concurrent
//! request streams over one client connection.

pub mod codec;
pub mod error;
pub mod header;
pub mod id;
pub mod messages;
pub mod mux;
pub mod transport;

pub use codec::{Codec, MAX_MESSAGE_SIZE};
pub use error::{ErrorCode, Result, TunnelError};
pub use header::{
    read_stream_header, write_stream_header, StreamHeader, StreamKind, MAX_STREAM_HEADER_SIZE,
};
pub use messages::{
    AddTunnelRequest, Envelope, ErrorMessage, HandshakeRequest, HandshakeResponse, MessageType,
    PingMessage, PongMessage, RemoveTunnelRequest, ShutdownMessage, TunnelConfig, TunnelStatus,
    TunnelUpdateResponse,
};

/// Current protocol version. Incremented on incompatible wire changes.
pub const PROTOCOL_VERSION: i32 = 1;

/// Oldest protocol version the server still accepts.
pub const MIN_SUPPORTED_VERSION: i32 = 1;

/// Check whether a client's protocol version can be served.
pub fn is_version_supported(version: i32) -> bool {
    (MIN_SUPPORTED_VERSION..=PROTOCOL_VERSION).contains(&version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_bounds() {
        assert!(is_version_supported(PROTOCOL_VERSION));
        assert!(is_version_supported(MIN_SUPPORTED_VERSION));
        assert!(!is_version_supported(MIN_SUPPORTED_VERSION - 1));
        assert!(!is_version_supported(PROTOCOL_VERSION + 1));
    }
}
