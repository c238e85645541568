//! Server assembly: wires config, auth, registry, control plane and the
//! public HTTP surface together.

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::control::ControlPlane;
use crate::registry::Registry;
use crate::{proxy, wscontrol};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::{Json, Router};
use burrow_core::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Shared state behind every HTTP handler.
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<Registry>,
    pub control: Arc<ControlPlane>,
}

/// Addresses actually bound by [`TunnelServer::start`]; useful when the
/// config asked for port 0.
#[derive(Debug, Clone, Copy)]
pub struct ServerHandles {
    pub control_addr: SocketAddr,
    pub http_addr: SocketAddr,
}

/// The tunnel server: control plane + registry + public proxy.
pub struct TunnelServer {
    state: Arc<AppState>,
    shutdown_tx: watch::Sender<bool>,
}

impl TunnelServer {
    pub fn new(config: ServerConfig, auth: Arc<dyn Authenticator>) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(Registry::new(
            config.domain.clone(),
            &config.reserved_subdomains,
        ));
        let control = ControlPlane::new(config.clone(), registry.clone(), auth);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            state: Arc::new(AppState {
                config,
                registry,
                control,
            }),
            shutdown_tx,
        }
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.state.registry.clone()
    }

    pub fn control_plane(&self) -> Arc<ControlPlane> {
        self.state.control.clone()
    }

    /// Bind the control and HTTP listeners and start serving.
    pub async fn start(&self) -> Result<ServerHandles> {
        let control_addr = self.state.control.start().await?;

        if self.state.config.tls.enabled || !self.state.config.https_addr.is_empty() {
            // Certificate management and TLS termination belong to the
            // deployment edge in front of this process.
            warn!("tls/https configured; termination is expected at the fronting proxy");
        }

        let listener = TcpListener::bind(&self.state.config.http_addr).await?;
        let http_addr = listener.local_addr()?;
        info!(addr = %http_addr, domain = %self.state.config.domain, "HTTP proxy listening");

        let router = self.router();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let server = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });

        tokio::spawn(async move {
            if let Err(e) = server.await {
                error!(error = %e, "HTTP server error");
            }
        });

        Ok(ServerHandles {
            control_addr,
            http_addr,
        })
    }

    /// The unified public router: control upgrade endpoint, health, and
    /// the catch-all proxy.
    fn router(&self) -> Router {
        Router::new()
            .route("/tunnel", any(wscontrol::tunnel_upgrade))
            .route("/_tunnel", any(wscontrol::tunnel_upgrade))
            .route("/health", get(health))
            .route("/_health", get(health))
            .fallback(proxy::proxy_handler)
            .with_state(self.state.clone())
    }

    /// Graceful shutdown: stop accepting, notify clients, close sessions,
    /// stop the HTTP listener.
    pub async fn shutdown(&self, reason: &str, grace: Duration) {
        self.state.control.shutdown(reason, grace).await;
        let _ = self.shutdown_tx.send(true);
        info!("server stopped");
    }
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.control.session_count().await,
        "tunnels": state.registry.tunnel_count().await,
    }))
}
