//! burrow — expose local servers to the internet.
//!
//! Either point it at a TOML config with multiple tunnels, or use the
//! quick form: `burrow 3000 --subdomain myapp --server tunnel.host:9000`.

use anyhow::{bail, Context};
use burrow_client::{ClientConfig, TunnelClient};
use burrow_core::TunnelConfig;
use clap::Parser;
use rand::RngCore;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// burrow client — expose local servers to the internet
#[derive(Parser)]
#[command(name = "burrow", version, about)]
struct Args {
    /// Local port to expose (quick mode; ignored with --config)
    port: Option<u16>,

    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tunnel server address (host:port or ws(s):// URL)
    #[arg(short, long, default_value = "localhost:9000")]
    server: String,

    /// Authentication token
    #[arg(short, long, default_value = "dev-token")]
    token: String,

    /// Request a specific subdomain (default: random)
    #[arg(long)]
    subdomain: Option<String>,

    /// Local host to forward to
    #[arg(long, default_value = "127.0.0.1")]
    local_host: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .await
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            let Some(port) = args.port else {
                bail!("a local port is required (e.g. `burrow 3000`) unless --config is given");
            };
            let subdomain = args.subdomain.clone().unwrap_or_else(random_subdomain);
            let mut config = ClientConfig {
                server_addr: args.server.clone(),
                token: args.token.clone(),
                tunnels: vec![TunnelConfig {
                    subdomain,
                    local_port: port,
                    local_host: args.local_host.clone(),
                    protocol: String::new(),
                }],
                log_level: args.log_level.clone(),
                ..Default::default()
            };
            config.validate().map_err(anyhow::Error::from)?;
            config
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let client = TunnelClient::new(config);

    client.on_state_change(|state| {
        info!(state = %state, "tunnel state changed");
    });
    client.on_request(|request| {
        if let Some(duration) = request.duration {
            info!(
                request_id = %request.id,
                subdomain = %request.subdomain,
                method = %request.method,
                path = %request.path,
                status = request.status,
                duration_ms = duration.as_millis() as u64,
                "request completed"
            );
        }
    });

    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };

    tokio::select! {
        result = runner => {
            result.context("client task panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            client.close().await;
        }
    }

    // Surface what the session looked like on the way out.
    for status in client.tunnel_status() {
        if status.is_active() {
            info!(subdomain = %status.subdomain, url = %status.url, "tunnel was serving");
        }
    }

    Ok(())
}

/// A random admissible subdomain, e.g. `t4f9c2a81`.
fn random_subdomain() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("t{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_subdomains_are_admissible() {
        for _ in 0..32 {
            let s = random_subdomain();
            assert!(s.len() >= 3 && s.len() <= 63);
            assert!(s.starts_with('t'));
            assert!(s
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }
}
