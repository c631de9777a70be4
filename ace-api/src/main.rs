//! Facade server binary.

use std::net::SocketAddr;
use std::sync::Arc;

use ace_api::{create_router, ApiState};
use ace_core::{CoreConfig, CoreSystem};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Analysis correlation engine facade
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Set the log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the core API over HTTP
    Serve {
        /// Listen address
        #[arg(short, long, default_value = "127.0.0.1:8643")]
        listen: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level: Level = cli
        .log_level
        .parse()
        .with_context(|| format!("invalid log level {:?}", cli.log_level))?;
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default tracing subscriber")?;

    match cli.command {
        Commands::Serve { listen } => serve(listen).await,
    }
}

async fn serve(listen: SocketAddr) -> Result<()> {
    let config = CoreConfig::from_env();
    let core = Arc::new(
        CoreSystem::with_local_storage(config)
            .context("initializing core with local blob storage")?,
    );

    let state = ApiState::new(core);
    if state.api_key.is_none() {
        info!("ACE_API_KEY is unset, serving without authentication");
    }
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(%listen, "serving analysis core API");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("serving API")
}
