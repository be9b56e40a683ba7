//! overseer - watcher node
//!
//! Watches broadcast streams for match results, delegating streams down a
//! small tree of nodes and reporting results up to the root.

use anyhow::Context;
use clap::Parser;
use overseer_core::Database;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod error;
mod middleware;
mod routes;
mod services;
mod state;
#[cfg(test)]
mod testing;

use config::Config;
use middleware::AllowList;
use services::{recovery, HttpSink, LogSink, ResultSink};
use state::AppState;

/// How long shutdown waits for cancelled watches to release their slots
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "overseer", version, about = "Stream watcher node")]
struct Cli {
    /// Configuration file
    #[arg(long, env = "OVERSEER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("overseer_server=info,overseer_core=info,tower_http=info"))?;
    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    info!("overseer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.node.listen = listen;
    }
    info!(
        path = ?config.config_path,
        node = %config.node.name,
        root = config.is_root(),
        children = config.children.len(),
        game_kinds = config.game_kinds.len(),
        "Config loaded"
    );

    let database_path = config.database_path();
    let db = Database::open_path(&database_path)
        .with_context(|| format!("Failed to open watch registry {}", database_path.display()))?;

    let sink: Arc<dyn ResultSink> = match &config.app.url {
        Some(url) => Arc::new(HttpSink::new(
            url,
            Duration::from_secs(config.app.request_timeout_secs),
        )?),
        None => {
            if config.is_root() {
                warn!("No application configured, results will only be logged");
            }
            Arc::new(LogSink)
        }
    };

    let allow = AllowList::resolve(&config).await;
    info!(addresses = allow.len(), "Allow-list ready");

    let listen = config.node.listen;
    let state = AppState::new(config, db, sink, allow)?;

    let summary = recovery::recover(&state).context("Recovery failed")?;
    info!(
        resumed = summary.resumed,
        discarded = summary.discarded,
        redelivered = summary.redelivered,
        failed = summary.failed,
        "Recovery complete"
    );

    let app = routes::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!(addr = %listen, "Server ready");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // records stay as they are; recovery resumes them on the next start
    let cancelled = state.pool.cancel_all();
    info!(cancelled, "Shutting down...");
    if !state.pool.wait_idle(SHUTDOWN_GRACE).await {
        warn!(running = state.pool.len(), "Watches still running at exit");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
