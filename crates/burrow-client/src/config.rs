//! Client configuration: TOML file + programmatic construction.

use burrow_core::{Result, TunnelConfig, TunnelError};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Top-level client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Tunnel server address: `host:port` for raw TCP, or a `ws(s)://` /
    /// `http(s)://` URL for the WebSocket control endpoint.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,

    /// Authentication token.
    #[serde(default)]
    pub token: String,

    /// Identifier for this client instance, for logging on the server.
    #[serde(default)]
    pub client_id: String,

    /// Tunnels to establish at connect time.
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Logging verbosity (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            token: String::new(),
            client_id: String::new(),
            tunnels: Vec::new(),
            reconnect: ReconnectConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// `[reconnect]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// 0 = retry forever.
    #[serde(default)]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

fn default_server_addr() -> String {
    "localhost:9000".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}

impl ClientConfig {
    /// Load configuration from a TOML file on top of the defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading client config");
        let content = tokio::fs::read_to_string(path).await?;
        let mut config: ClientConfig = toml::from_str(&content)
            .map_err(|e| TunnelError::Internal(format!("config parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check required fields and normalise the tunnel configs.
    pub fn validate(&mut self) -> Result<()> {
        if self.server_addr.is_empty() {
            return Err(TunnelError::Internal("server_addr is required".into()));
        }
        if self.token.is_empty() {
            return Err(TunnelError::Internal("token is required".into()));
        }
        if self.tunnels.is_empty() {
            return Err(TunnelError::Internal(
                "at least one tunnel is required".into(),
            ));
        }
        for (i, tunnel) in self.tunnels.iter_mut().enumerate() {
            tunnel
                .validate()
                .map_err(|e| TunnelError::Internal(format!("tunnel[{i}]: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_toml_with_defaults() {
        let mut config: ClientConfig = toml::from_str(
            r#"
            server_addr = "tunnel.example.com:9000"
            token = "secret"

            [[tunnels]]
            subdomain = "api"
            local_port = 3000

            [reconnect]
            max_attempts = 5
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.tunnels.len(), 1);
        assert_eq!(config.tunnels[0].local_host, "127.0.0.1");
        assert_eq!(config.tunnels[0].protocol, "http");
        assert!(config.reconnect.enabled);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconnect.initial_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn requires_token_and_tunnels() {
        let mut config = ClientConfig::default();
        assert!(config.validate().is_err());

        config.token = "secret".into();
        assert!(config.validate().is_err());

        config.tunnels.push(TunnelConfig {
            subdomain: "web".into(),
            local_port: 8080,
            local_host: String::new(),
            protocol: String::new(),
        });
        config.validate().unwrap();
    }
}
