use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the tunnel protocol layer.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("message size {size} exceeds maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("subdomain is already taken")]
    SubdomainTaken,

    #[error("subdomain is reserved: {0}")]
    SubdomainReserved(String),

    #[error("subdomain format is invalid: {0}")]
    SubdomainInvalid(String),

    #[error("tunnel not found: {0}")]
    TunnelNotFound(String),

    #[error("tunnel limit reached (maximum {0})")]
    TunnelLimitReached(usize),

    #[error("rate limited")]
    RateLimited,

    #[error("unsupported protocol version {0}")]
    VersionMismatch(i32),

    #[error("operation timed out")]
    Timeout,

    #[error("stream closed")]
    StreamClosed,

    #[error("session is not active")]
    SessionNotActive,

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, TunnelError>;

/// Machine-readable error codes carried in handshake responses and
/// `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    SubdomainTaken,
    SubdomainReserved,
    SubdomainInvalid,
    RateLimited,
    InternalError,
    ProtocolError,
    ConnectionLimit,
    TunnelLimitReached,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::SubdomainTaken => "SUBDOMAIN_TAKEN",
            ErrorCode::SubdomainReserved => "SUBDOMAIN_RESERVED",
            ErrorCode::SubdomainInvalid => "SUBDOMAIN_INVALID",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::ConnectionLimit => "CONNECTION_LIMIT",
            ErrorCode::TunnelLimitReached => "TUNNEL_LIMIT_REACHED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TunnelError {
    /// Map an error to the wire code reported to the peer.
    pub fn code(&self) -> ErrorCode {
        match self {
            TunnelError::Unauthorized => ErrorCode::Unauthorized,
            TunnelError::SubdomainTaken => ErrorCode::SubdomainTaken,
            TunnelError::SubdomainReserved(_) => ErrorCode::SubdomainReserved,
            TunnelError::SubdomainInvalid(_) => ErrorCode::SubdomainInvalid,
            TunnelError::RateLimited => ErrorCode::RateLimited,
            TunnelError::TunnelLimitReached(_) => ErrorCode::TunnelLimitReached,
            TunnelError::VersionMismatch(_)
            | TunnelError::InvalidMessage(_)
            | TunnelError::Protocol(_) => ErrorCode::ProtocolError,
            _ => ErrorCode::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_mapping() {
        assert_eq!(TunnelError::Unauthorized.code(), ErrorCode::Unauthorized);
        assert_eq!(TunnelError::SubdomainTaken.code(), ErrorCode::SubdomainTaken);
        assert_eq!(
            TunnelError::Protocol("bad".into()).code(),
            ErrorCode::ProtocolError
        );
        assert_eq!(TunnelError::Timeout.code(), ErrorCode::InternalError);
    }

    #[test]
    fn code_serde_round_trip() {
        let json = serde_json::to_string(&ErrorCode::TunnelLimitReached).unwrap();
        assert_eq!(json, "\"TUNNEL_LIMIT_REACHED\"");
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorCode::TunnelLimitReached);
    }
}
