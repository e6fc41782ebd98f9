//! FlowScout Daemon
//!
//! Runs analysis jobs through the scout process, derives test plans from
//! their output and executes those plans in a browser.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod checkpoint;
mod chrome;
mod config;
mod error;
mod hub;
mod llm;
mod orchestrator;
mod protocol;
mod registry;
mod scout;
mod slots;
mod state;
mod supervisor;
mod timeout;

use config::DaemonConfig;

#[derive(Parser)]
#[command(name = "flowscoutd")]
#[command(about = "FlowScout daemon - analysis orchestration and flow execution")]
#[command(version)]
struct Cli {
    /// Configuration file path (default: <store>/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long, env = "FLOWSCOUT_STORE")]
    store: Option<PathBuf>,

    /// HTTP listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("FlowScout daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration, then apply command line overrides
    let config_path = cli.config.clone().unwrap_or_else(|| {
        cli.store
            .clone()
            .unwrap_or_else(flowscout_common::default_store_path)
            .join("config.toml")
    });
    let mut config = DaemonConfig::load(&config_path)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    let state = state::StateManager::new(&config)?;
    let browsers = Arc::new(chrome::ChromeLauncher::new(config.browser.clone()));
    let model = Arc::new(llm::AnthropicClient::from_config(&config.model)?);
    let orchestrator = orchestrator::Orchestrator::new(config, state, browsers, model);

    let recovered = orchestrator.recover_interrupted()?;
    if recovered > 0 {
        info!("Marked {} interrupted job(s) as failed", recovered);
    }

    let config = orchestrator.config();
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("Daemon listening on http://{}", config.listen);
    info!("Store: {:?}", config.store_path);

    let app = api::router(orchestrator.clone());
    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Received shutdown signal");
    });

    if let Err(e) = server.await {
        error!("HTTP server error: {}", e);
    }

    orchestrator.shutdown().await;
    info!("Daemon shutdown complete");
    Ok(())
}
