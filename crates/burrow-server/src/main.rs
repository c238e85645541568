//! burrow-server — accept tunnel clients and route public HTTP traffic
//! to them by subdomain.

use anyhow::Context;
use burrow_server::auth::TokenAuthenticator;
use burrow_server::{Authenticator, ServerConfig, TunnelServer};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// burrow server — expose local services to the internet
#[derive(Parser)]
#[command(name = "burrow-server", version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base domain for subdomains
    #[arg(short, long, default_value = "localhost")]
    domain: String,

    /// Address for client tunnel connections
    #[arg(long, default_value = "0.0.0.0:9000")]
    control_addr: String,

    /// Address for public HTTP traffic
    #[arg(long, default_value = "0.0.0.0:8080")]
    http_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ServerConfig::load(path)
            .await
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            let mut config = ServerConfig::default();
            config.domain = args.domain.clone();
            config.control_addr = args.control_addr.clone();
            config.http_addr = args.http_addr.clone();
            config.log_level = args.log_level.clone();
            config
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let auth: Arc<dyn Authenticator> =
        if config.auth.mode == "token" && config.auth.token_file.is_empty() {
            // Development convenience, mirroring the quick-start docs.
            warn!("no token file configured, adding default development token");
            let tokens = TokenAuthenticator::new();
            tokens.add_token("dev-token", "dev-user").await;
            Arc::new(tokens)
        } else {
            burrow_server::auth::from_config(&config.auth)
                .await
                .context("failed to build authenticator")?
        };

    let server = TunnelServer::new(config, auth);
    let handles = server.start().await.context("failed to start server")?;
    info!(
        control = %handles.control_addr,
        http = %handles.http_addr,
        "burrow server running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    server
        .shutdown("server shutting down", Duration::from_secs(10))
        .await;

    Ok(())
}
