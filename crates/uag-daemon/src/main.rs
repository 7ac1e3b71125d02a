//! uagd - the UAG gateway daemon.
//!
//! Startup order matters and mirrors the coherence protocol: audit sink
//! first, cache listeners before cache warm-up, policy snapshot before the
//! servers. Shutdown runs the same sequence backwards — stop accepting,
//! drain in-flight requests, stop the servers, and only then drain the
//! audit sink so the last events reach the store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use uag_core::config::UagConfig;
use uag_daemon::http::{self, AppState};
use uag_daemon::rpc::RpcServer;
use uag_daemon::GatewayRuntime;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// UAG gateway daemon.
#[derive(Parser, Debug)]
#[command(name = "uagd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "uag.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Log format override (json, pretty).
    #[arg(long)]
    log_format: Option<String>,
}

fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    if format == "pretty" {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config =
        UagConfig::load_or_default(&args.config).context("failed to load configuration")?;
    let level = args.log_level.as_deref().unwrap_or(&config.log.level);
    let format = args.log_format.as_deref().unwrap_or(&config.log.format);
    init_tracing(level, format);

    info!(config = %args.config.display(), "uag gateway starting");

    let runtime = GatewayRuntime::start(&config).await?;
    let server_cancel = runtime.cancel_token().child_token();

    // HTTP endpoint.
    let http_addr = format!("{}:{}", config.server.host, config.server.port);
    let http_listener = TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("failed to bind http listener on {http_addr}"))?;
    info!(addr = %http_addr, "http server listening");

    let app = http::router(AppState {
        gateway: Arc::clone(&runtime.gateway),
        validator: Arc::clone(&runtime.validator),
    });
    let http_cancel = server_cancel.clone();
    let http_task = tokio::spawn(async move {
        let shutdown = async move { http_cancel.cancelled().await };
        if let Err(e) = axum::serve(http_listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %e, "http server failed");
        }
    });

    // RPC endpoint.
    let rpc_task = if config.rpc.disabled {
        None
    } else {
        let rpc_listener = TcpListener::bind(&config.rpc.listen)
            .await
            .with_context(|| format!("failed to bind rpc listener on {}", config.rpc.listen))?;
        let server = Arc::new(RpcServer::new(
            Arc::clone(&runtime.gateway),
            Arc::clone(&runtime.validator),
        ));
        let cancel = server_cancel.clone();
        Some(tokio::spawn(server.serve(rpc_listener, cancel)))
    };

    // Wait for a termination signal.
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
    info!("uag gateway shutting down");

    // Stop accepting and give in-flight requests a bounded drain window.
    server_cancel.cancel();
    let drain = async {
        let _ = http_task.await;
        if let Some(rpc_task) = rpc_task {
            let _ = rpc_task.await;
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        error!("servers did not drain in time, continuing shutdown");
    }

    // The audit sink stops after the servers so the final events flush.
    runtime.shutdown().await;

    info!("uag gateway exited cleanly");
    Ok(())
}
