//! Control messages exchanged between client and server.
//!
//! Every control message travels inside an [`Envelope`] whose `payload`
//! is a JSON object keyed by the envelope `type`.

use crate::error::{Result, TunnelError};
use crate::MIN_SUPPORTED_VERSION;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies the type of control message being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Sent by the client to initiate a tunnel session.
    Handshake,
    /// Sent by the server in response to a handshake.
    HandshakeResponse,
    /// Requests adding a new tunnel to an existing session.
    AddTunnel,
    /// Requests removing a tunnel from an existing session.
    RemoveTunnel,
    /// Sent by the server to confirm tunnel changes.
    TunnelUpdate,
    /// Keepalive message.
    Ping,
    /// Response to a ping.
    Pong,
    /// Signals graceful shutdown intent.
    Shutdown,
    /// Indicates a protocol-level error.
    Error,
}

/// Wraps all control messages with type information for routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Create a new envelope with the given type and payload.
    pub fn new<T: Serialize>(
        msg_type: MessageType,
        request_id: impl Into<String>,
        payload: &T,
    ) -> Result<Self> {
        Ok(Self {
            msg_type,
            timestamp: Utc::now(),
            request_id: request_id.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Deserialize the envelope payload into the given target type.
    pub fn decode_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| TunnelError::InvalidMessage(format!("failed to decode payload: {e}")))
    }
}

/// A single tunnel mapping from subdomain to local port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// The requested subdomain (e.g. "api" for api.example.com).
    pub subdomain: String,

    /// The local port traffic is forwarded to.
    pub local_port: u16,

    /// The local host traffic is forwarded to (default: 127.0.0.1).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_host: String,

    /// Tunnel protocol: "http" or "tcp". HTTP tunnels route on the Host
    /// header; TCP tunnels require dedicated server ports.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

impl TunnelConfig {
    /// Validate the config, filling in defaults for host and protocol.
    pub fn validate(&mut self) -> Result<()> {
        if self.subdomain.is_empty() {
            return Err(TunnelError::InvalidMessage("subdomain is required".into()));
        }
        if self.local_port == 0 {
            return Err(TunnelError::InvalidMessage(
                "local_port must be between 1 and 65535".into(),
            ));
        }
        if self.protocol.is_empty() {
            self.protocol = "http".to_string();
        }
        if self.protocol != "http" && self.protocol != "tcp" {
            return Err(TunnelError::InvalidMessage(
                "protocol must be 'http' or 'tcp'".into(),
            ));
        }
        if self.local_host.is_empty() {
            self.local_host = "127.0.0.1".to_string();
        }
        Ok(())
    }

    /// The full local address (host:port) this tunnel forwards to.
    pub fn local_addr(&self) -> String {
        let host = if self.local_host.is_empty() {
            "127.0.0.1"
        } else {
            &self.local_host
        };
        format!("{}:{}", host, self.local_port)
    }
}

/// Sent by the client to initiate a tunnel session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Protocol version the client speaks.
    pub version: i32,

    /// Authentication token for this client.
    pub token: String,

    /// Client instance identifier, for logging and debugging.
    #[serde(default)]
    pub client_id: String,

    /// Tunnels the client wants to establish.
    pub tunnels: Vec<TunnelConfig>,

    /// Optional features the client supports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

impl HandshakeRequest {
    pub fn validate(&mut self) -> Result<()> {
        if self.version < MIN_SUPPORTED_VERSION {
            return Err(TunnelError::VersionMismatch(self.version));
        }
        if self.token.is_empty() {
            return Err(TunnelError::InvalidMessage("token is required".into()));
        }
        if self.tunnels.is_empty() {
            return Err(TunnelError::InvalidMessage(
                "at least one tunnel configuration is required".into(),
            ));
        }
        for (i, tunnel) in self.tunnels.iter_mut().enumerate() {
            tunnel
                .validate()
                .map_err(|e| TunnelError::InvalidMessage(format!("tunnel[{i}]: {e}")))?;
        }
        Ok(())
    }
}

/// The status of one registered tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub subdomain: String,
    pub local_port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// "active", "pending" or "error".
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl TunnelStatus {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

/// Sent by the server in response to a handshake request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Whether the handshake was accepted. `true` as long as at least one
    /// tunnel registered; inspect per-tunnel statuses for partial failure.
    pub success: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tunnels: Vec<TunnelStatus>,

    /// Protocol version the server is using.
    pub server_version: i32,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_code: String,
}

/// Requests adding a new tunnel to an existing session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTunnelRequest {
    pub tunnel: TunnelConfig,
}

/// Requests removing a tunnel from an existing session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveTunnelRequest {
    pub subdomain: String,
}

/// Sent by the server to confirm tunnel changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelUpdateResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelStatus>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_code: String,
}

/// Keepalive ping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingMessage {
    pub timestamp: DateTime<Utc>,
}

/// Response to a ping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongMessage {
    pub timestamp: DateTime<Utc>,
    pub ping_timestamp: DateTime<Utc>,
}

/// Signals graceful shutdown intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownMessage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// How long the sender will wait before closing.
    pub grace_period_ms: u64,
}

/// A protocol-level error report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_config_defaults() {
        let mut tc = TunnelConfig {
            subdomain: "api".into(),
            local_port: 3000,
            local_host: String::new(),
            protocol: String::new(),
        };
        tc.validate().unwrap();
        assert_eq!(tc.protocol, "http");
        assert_eq!(tc.local_host, "127.0.0.1");
        assert_eq!(tc.local_addr(), "127.0.0.1:3000");
    }

    #[test]
    fn tunnel_config_rejects_bad_protocol() {
        let mut tc = TunnelConfig {
            subdomain: "api".into(),
            local_port: 3000,
            local_host: String::new(),
            protocol: "udp".into(),
        };
        assert!(tc.validate().is_err());
    }

    #[test]
    fn handshake_requires_token_and_tunnels() {
        let mut req = HandshakeRequest {
            version: 1,
            token: String::new(),
            client_id: String::new(),
            tunnels: vec![],
            capabilities: vec![],
        };
        assert!(req.validate().is_err());

        req.token = "secret".into();
        assert!(req.validate().is_err());

        req.tunnels.push(TunnelConfig {
            subdomain: "web".into(),
            local_port: 8000,
            local_host: String::new(),
            protocol: String::new(),
        });
        req.validate().unwrap();
    }

    #[test]
    fn handshake_rejects_old_version() {
        let mut req = HandshakeRequest {
            version: 0,
            token: "secret".into(),
            client_id: String::new(),
            tunnels: vec![TunnelConfig {
                subdomain: "web".into(),
                local_port: 8000,
                local_host: String::new(),
                protocol: String::new(),
            }],
            capabilities: vec![],
        };
        assert!(matches!(
            req.validate(),
            Err(TunnelError::VersionMismatch(0))
        ));
    }

    #[test]
    fn port_boundaries() {
        // Port 0 fails validation; 65536 does not even deserialize.
        let mut tc = TunnelConfig {
            subdomain: "api".into(),
            local_port: 0,
            local_host: String::new(),
            protocol: String::new(),
        };
        assert!(tc.validate().is_err());

        for port in [1u16, 65535] {
            let mut tc = TunnelConfig {
                subdomain: "api".into(),
                local_port: port,
                local_host: String::new(),
                protocol: String::new(),
            };
            tc.validate().unwrap();
        }

        let json = r#"{"subdomain":"api","local_port":65536}"#;
        assert!(serde_json::from_str::<TunnelConfig>(json).is_err());
    }

    #[test]
    fn envelope_payload_round_trip() {
        let msg = ShutdownMessage {
            reason: "maintenance".into(),
            grace_period_ms: 5000,
        };
        let env = Envelope::new(MessageType::Shutdown, "", &msg).unwrap();
        assert_eq!(env.msg_type, MessageType::Shutdown);
        let back: ShutdownMessage = env.decode_payload().unwrap();
        assert_eq!(back.reason, "maintenance");
        assert_eq!(back.grace_period_ms, 5000);
    }

    #[test]
    fn message_type_wire_names() {
        let json = serde_json::to_string(&MessageType::HandshakeResponse).unwrap();
        assert_eq!(json, "\"handshake_response\"");
        let back: MessageType = serde_json::from_str("\"add_tunnel\"").unwrap();
        assert_eq!(back, MessageType::AddTunnel);
    }
}
