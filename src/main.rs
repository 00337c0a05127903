use axum::routing::get;
use axum::Router;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::middleware::{Initializer, Manager};

/// Request admission service: rate limiting and an ordered middleware chain.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "turnstile.yaml")]
    config: PathBuf,

    /// Override the configured listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Validate the configuration, print the chain and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let initializer = Arc::new(Initializer::new());
    let config = initializer.load_from_file(&args.config)?;
    initializer.initialize()?;

    let manager = Arc::new(Manager::new());
    initializer.register_all(&manager)?;
    let report = manager.validate()?;
    for info in manager.list() {
        info!(
            name = %info.name,
            priority = info.priority,
            overridden = info.overridden,
            "Middleware in chain"
        );
    }

    if args.check {
        info!(duplicates = report.duplicate_priorities.len(), "Configuration OK");
        return Ok(());
    }

    let app = manager.apply(Router::new().route("/health", get(|| async { "ok" })));
    let addr = args.listen.unwrap_or(config.server.listen_addr);

    #[cfg(unix)]
    spawn_reload_on_hangup(args.config.clone(), initializer.clone(), manager.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Turnstile stopped");
    Ok(())
}

/// Reload the configuration file on SIGHUP.
#[cfg(unix)]
fn spawn_reload_on_hangup(path: PathBuf, initializer: Arc<Initializer>, manager: Arc<Manager>) {
    tokio::spawn(async move {
        let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGHUP handler, hot reload disabled");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            info!(path = %path.display(), "Received SIGHUP, reloading configuration");
            if let Err(e) = initializer.reload_from_file(&path, &manager).await {
                error!(error = %e, "Configuration reload failed, keeping previous configuration");
            }
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
