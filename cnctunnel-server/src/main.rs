//! cnctunnel process entry point.
//!
//! Wires the CLI into a [`TunnelService`], starts the lifecycle sweeper and
//! serves the HTTP API until SIGINT/SIGTERM or a completed maintenance drain.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use cnctunnel::transport::{ServerConfig, serve};
use cnctunnel::{
    LifecycleSweeper, Limits, MasterClient, MasterConfig, RecentLogs, TunnelConfig, TunnelService,
    VERSION,
};

#[derive(Debug, Parser)]
#[command(name = "cnctunnel", version, about = "Game peer-relay tunnel control plane")]
struct Args {
    /// Name advertised to the master server.
    #[arg(long, env = "CNCTUNNEL_NAME", default_value = "Unnamed server")]
    name: String,

    /// Password game clients must send with reservation requests.
    #[arg(long, env = "CNCTUNNEL_PASSWORD")]
    password: Option<String>,

    /// Relay port, advertised to the master. Also the HTTP port unless
    /// `--http-port` is given.
    #[arg(long, env = "CNCTUNNEL_PORT", default_value_t = 50001)]
    port: u16,

    #[arg(long, env = "CNCTUNNEL_HTTP_HOST", default_value = "0.0.0.0")]
    http_host: String,

    #[arg(long, env = "CNCTUNNEL_HTTP_PORT")]
    http_port: Option<u16>,

    /// Maximum concurrently allocated slots.
    #[arg(
        long,
        env = "CNCTUNNEL_MAX_CLIENTS",
        default_value_t = 200,
        value_parser = clap::value_parser!(u16).range(2..)
    )]
    max_clients: u16,

    /// Master server announce URL. Without it the master is never contacted.
    #[arg(long, env = "CNCTUNNEL_MASTER")]
    master: Option<String>,

    #[arg(long, env = "CNCTUNNEL_MASTER_PASSWORD")]
    master_password: Option<String>,

    /// Reservation groups one address may hold per window (0 = unlimited).
    #[arg(long, env = "CNCTUNNEL_IP_LIMIT", default_value_t = 0)]
    ip_limit: u32,

    #[arg(long, env = "CNCTUNNEL_ADMIN_USERNAME", default_value = "admin")]
    admin_username: String,

    #[arg(long, env = "CNCTUNNEL_ADMIN_PASSWORD", default_value = "admin")]
    admin_password: String,

    #[arg(long, env = "CNCTUNNEL_SWEEP_INTERVAL_SECS", default_value_t = 5)]
    sweep_interval_secs: u64,

    /// Ignore SIGTERM; stop only on SIGINT or a completed drain.
    #[arg(long, env = "CNCTUNNEL_AWAIT_EXPLICIT_SHUTDOWN")]
    await_explicit_shutdown: bool,
}

impl Args {
    fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            server_name: self.name.clone(),
            server_password: self.password.clone().filter(|p| !p.is_empty()),
            admin_username: self.admin_username.clone(),
            admin_password: self.admin_password.clone(),
            max_clients: usize::from(self.max_clients),
            port: self.port,
            tunnel_enabled: true,
        }
    }

    fn limits(&self) -> Limits {
        Limits {
            ip_limit: self.ip_limit,
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            ..Limits::default()
        }
    }

    fn master_config(&self) -> Option<MasterConfig> {
        self.master
            .as_ref()
            .filter(|url| !url.is_empty())
            .map(|url| MasterConfig::new(url.clone()).with_password(self.master_password.clone()))
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.http_host.clone(),
            port: self.http_port.unwrap_or(self.port),
            await_explicit_shutdown: self.await_explicit_shutdown,
        }
    }
}

/// Initialize tracing.
///
/// `RUST_LOG` wins when set; otherwise `CNCTUNNEL_LOG` picks the level for
/// our crates. `LOG_FORMAT=json` switches to JSON lines. Every event is also
/// kept in `recent_logs` for the admin UI.
fn init_tracing(recent_logs: RecentLogs) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("CNCTUNNEL_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "cnctunnel={level},cnctunnel_server={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(recent_logs);
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(recent_logs);
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let recent_logs = RecentLogs::default();
    init_tracing(recent_logs.clone());

    info!(
        version = VERSION,
        name = %args.name,
        port = args.port,
        max_clients = args.max_clients,
        ip_limit = args.ip_limit,
        "cnctunnel starting"
    );

    let mut service =
        TunnelService::new(args.tunnel_config(), args.limits()).with_recent_logs(recent_logs);
    if let Some(master) = args.master_config() {
        info!(url = %master.url, "Master notifications enabled");
        let client = MasterClient::new(master).context("failed to build master client")?;
        service = service.with_notifier(Arc::new(client));
    }
    let service = Arc::new(service);

    let cancel = CancellationToken::new();
    let sweeper = tokio::spawn(LifecycleSweeper::new(service.clone()).run(cancel.clone()));

    let result = serve(args.server_config(), service).await;

    cancel.cancel();
    if let Err(e) = sweeper.await {
        tracing::error!(error = %e, "Sweeper task failed");
    }

    result
}
