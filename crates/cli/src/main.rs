//! FlowScout CLI - Main Entry Point
//!
//! Talks to the FlowScout daemon over HTTP and runs flow tooling locally.

use clap::{Parser, Subcommand};

use flowscout_cli::client::DaemonClient;
use flowscout_cli::commands::{flow, job};
use flowscout_cli::output::{self, print_error};

/// FlowScout CLI - flow analysis and test execution
#[derive(Parser)]
#[command(name = "flowscout")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Daemon address
    #[arg(long, default_value = "http://127.0.0.1:8787", env = "FLOWSCOUT_DAEMON", global = true)]
    daemon_addr: String,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse, normalize and reconstruct flow files locally
    #[command(subcommand)]
    Flow(flow::FlowCommands),

    /// Submit and inspect daemon jobs
    #[command(subcommand)]
    Job(job::JobCommands),

    /// Check daemon status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Flow(cmd) => flow::execute(cmd, cli.format)?,
        Commands::Job(cmd) => {
            let client = DaemonClient::new(&cli.daemon_addr)?;
            job::execute(cmd, client, cli.format).await?
        }
        Commands::Status => {
            let client = DaemonClient::new(&cli.daemon_addr)?;
            if client.health_check().await {
                output::print_success(&format!("Daemon is running at {}", cli.daemon_addr));
            } else {
                print_error(&format!("Daemon is not responding at {}", cli.daemon_addr));
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
