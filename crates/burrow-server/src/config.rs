//! Server configuration: TOML file + CLI overrides.

use burrow_core::{Result, TunnelError};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address for client tunnel connections (e.g. "0.0.0.0:9000").
    #[serde(default = "default_control_addr")]
    pub control_addr: String,

    /// Address for public HTTP traffic (e.g. "0.0.0.0:8080").
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// Address for public HTTPS traffic. Empty disables it.
    #[serde(default)]
    pub https_addr: String,

    /// Base domain for subdomain routing (e.g. "example.com").
    #[serde(default = "default_domain")]
    pub domain: String,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// Subdomains that can never be claimed by clients.
    #[serde(default = "default_reserved_subdomains")]
    pub reserved_subdomains: Vec<String>,

    /// Logging verbosity (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            control_addr: default_control_addr(),
            http_addr: default_http_addr(),
            https_addr: String::new(),
            domain: default_domain(),
            tls: TlsConfig::default(),
            auth: AuthConfig::default(),
            limits: LimitsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            reserved_subdomains: default_reserved_subdomains(),
            log_level: default_log_level(),
        }
    }
}

/// `[tls]` section. Certificate management itself is handled by the
/// deployment edge; these fields are recognised and surfaced to it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
    #[serde(default)]
    pub auto_cert: bool,
    #[serde(default = "default_auto_cert_dir")]
    pub auto_cert_dir: String,
}

/// `[auth]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Authentication mode: "token", "jwt" or "none".
    #[serde(default = "default_auth_mode")]
    pub mode: String,
    /// File with valid tokens, one `token` or `token:user_id` per line.
    #[serde(default)]
    pub token_file: String,
    /// Secret for validating JWT tokens (mode = "jwt").
    #[serde(default)]
    pub jwt_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: default_auth_mode(),
            token_file: String::new(),
            jwt_secret: String::new(),
        }
    }
}

/// `[limits]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,
    #[serde(default = "default_max_tunnels_per_connection")]
    pub max_tunnels_per_connection: usize,
    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: usize,
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: u64,
    /// 0 = unlimited.
    #[serde(default)]
    pub max_bandwidth_bytes_per_sec: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections_per_user: default_max_connections_per_user(),
            max_tunnels_per_connection: default_max_tunnels_per_connection(),
            max_requests_per_minute: default_max_requests_per_minute(),
            max_request_body_size: default_max_request_body_size(),
            max_bandwidth_bytes_per_sec: 0,
        }
    }
}

/// `[timeouts]` section, all in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            dial_timeout_secs: default_dial_timeout(),
            write_timeout_secs: default_write_timeout(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

impl TimeoutsConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

fn default_control_addr() -> String {
    "0.0.0.0:9000".to_string()
}
fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_domain() -> String {
    "localhost".to_string()
}
fn default_auto_cert_dir() -> String {
    "./certs".to_string()
}
fn default_auth_mode() -> String {
    "token".to_string()
}
fn default_max_connections_per_user() -> usize {
    5
}
fn default_max_tunnels_per_connection() -> usize {
    10
}
fn default_max_requests_per_minute() -> usize {
    1000
}
fn default_max_request_body_size() -> u64 {
    50 * 1024 * 1024
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_request_timeout() -> u64 {
    30
}
fn default_dial_timeout() -> u64 {
    5
}
fn default_write_timeout() -> u64 {
    10
}
fn default_read_timeout() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

fn default_reserved_subdomains() -> Vec<String> {
    [
        "www", "api", "admin", "mail", "smtp", "pop", "imap", "ftp", "ssh", "dns", "ns", "mx",
        "app", "static", "cdn", "assets", "img", "images", "css", "js",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl ServerConfig {
    /// Load configuration from a TOML file on top of the defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading server config");
        let content = tokio::fs::read_to_string(path).await?;
        let config: ServerConfig = toml::from_str(&content)
            .map_err(|e| TunnelError::Internal(format!("config parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.control_addr.is_empty() {
            return Err(TunnelError::Internal("control_addr is required".into()));
        }
        if self.http_addr.is_empty() && self.https_addr.is_empty() {
            return Err(TunnelError::Internal(
                "at least one of http_addr or https_addr is required".into(),
            ));
        }
        if self.domain.is_empty() {
            return Err(TunnelError::Internal("domain is required".into()));
        }
        if self.tls.enabled && !self.tls.auto_cert && (self.tls.cert_file.is_empty() || self.tls.key_file.is_empty()) {
            return Err(TunnelError::Internal(
                "tls.cert_file and tls.key_file are required when TLS is enabled".into(),
            ));
        }
        match self.auth.mode.as_str() {
            "token" | "jwt" | "none" => {}
            other => {
                return Err(TunnelError::Internal(format!("unknown auth mode: {other}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: ServerConfig = toml::from_str(
            r#"
            domain = "tunnel.example.com"
            control_addr = "0.0.0.0:9100"

            [limits]
            max_tunnels_per_connection = 3

            [timeouts]
            handshake_timeout_secs = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.domain, "tunnel.example.com");
        assert_eq!(cfg.limits.max_tunnels_per_connection, 3);
        assert_eq!(cfg.timeouts.handshake_timeout(), Duration::from_secs(2));
        // Untouched sections keep their defaults.
        assert_eq!(cfg.http_addr, "0.0.0.0:8080");
        assert!(cfg.reserved_subdomains.iter().any(|s| s == "admin"));
    }

    #[test]
    fn rejects_tls_without_certs() {
        let mut cfg = ServerConfig::default();
        cfg.tls.enabled = true;
        assert!(cfg.validate().is_err());
        cfg.tls.auto_cert = true;
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_auth_mode() {
        let mut cfg = ServerConfig::default();
        cfg.auth.mode = "ldap".into();
        assert!(cfg.validate().is_err());
    }
}
