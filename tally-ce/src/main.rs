//! Categorization engine (tally-ce) - Main entry point
//!
//! `tally-ce` (or `tally-ce serve`) runs the HTTP batch trigger;
//! `tally-ce worker` runs a single worker pass and exits.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tally_ce::db::SqliteStore;
use tally_ce::AppState;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for tally-ce
#[derive(Parser, Debug)]
#[command(name = "tally-ce")]
#[command(about = "Hybrid transaction categorization engine")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "TALLY_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides [orchestrator] port)
    #[arg(short, long, env = "TALLY_CE_PORT")]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP batch trigger (default)
    Serve,
    /// Run one worker pass over every organization with backlog, then exit
    Worker,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = tally_common::config::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(tally_ce::config::log_filter(&config))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tally-ce (Categorization Engine)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let db_path = config.database_path();
    info!("Database: {}", db_path.display());

    let pool = tally_common::db::init_database_pool(&db_path)
        .await
        .context("Failed to initialize database")?;
    info!("Database connection established");

    let orchestrator = Arc::new(
        tally_ce::build_sqlite_orchestrator(&config, SqliteStore::new(pool))
            .context("Failed to initialize categorization engine")?,
    );

    match args.command.unwrap_or(Command::Serve) {
        Command::Worker => {
            let summary = orchestrator
                .run_worker()
                .await
                .context("Worker pass failed")?;
            for org in &summary.organizations {
                info!(
                    org_id = %org.org_id,
                    calls = org.calls,
                    processed = org.processed,
                    stopped = ?org.stopped,
                    "Organization summary"
                );
            }
            info!(processed = summary.processed, "Worker pass complete");
            Ok(())
        }
        Command::Serve => {
            let port = args.port.unwrap_or(config.orchestrator.port);
            let app = tally_ce::build_router(AppState::new(orchestrator));

            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .context("Failed to bind to address")?;
            info!("Listening on http://{}", addr);
            info!("Health check: http://{}/health", addr);

            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .context("Server error")?;

            info!("tally-ce stopped");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
