//! HTTP listener and process-level shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::service::TunnelService;

use super::routes::routes;

/// Where the HTTP API listens.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Defaults to the relay port, like the tunnels game clients already know.
    pub port: u16,
    /// Stop only on SIGINT or a finished maintenance drain; SIGTERM is ignored.
    pub await_explicit_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 50001,
            await_explicit_shutdown: false,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

/// Why the server stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownReason {
    Interrupt,
    Terminate,
    DrainComplete,
}

/// Serve the HTTP API. Peer addresses are exposed to handlers through
/// `ConnectInfo` for per-address rate limiting.
pub async fn serve(config: ServerConfig, service: Arc<TunnelService>) -> anyhow::Result<()> {
    let addr = config.socket_addr()?;
    let shutdown_rx = service.shutdown_rx();

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(address = %listener.local_addr()?, "HTTP API listening");

    let app = routes(service).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let reason = wait_for_shutdown(config.await_explicit_shutdown, shutdown_rx).await;
            tracing::info!(?reason, "Stopping HTTP API");
        })
        .await?;

    tracing::info!("HTTP API stopped");
    Ok(())
}

/// Resolves on the first stop condition. Failing to install a signal
/// handler panics; nothing useful can run without one.
async fn wait_for_shutdown(
    await_explicit_shutdown: bool,
    mut shutdown_rx: watch::Receiver<bool>,
) -> ShutdownReason {
    let interrupt = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        if await_explicit_shutdown {
            std::future::pending::<()>().await
        } else {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        }
    };

    #[cfg(not(unix))]
    let terminate = {
        let _ = await_explicit_shutdown;
        std::future::pending::<()>()
    };

    // A dropped sender means no drain can ever complete.
    let drained = async {
        if shutdown_rx.wait_for(|done| *done).await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = interrupt => ShutdownReason::Interrupt,
        _ = terminate => ShutdownReason::Terminate,
        _ = drained => ShutdownReason::DrainComplete,
    }
}
