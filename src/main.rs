use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use treesync::{sync_directory, Server, SessionOutcome, SyncConfig};

#[derive(Parser)]
#[command(name = "treesync")]
#[command(version)]
#[command(about = "Two-way directory tree synchronization over TCP")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// TOML config file
    #[arg(long, global = true, env = "TREESYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Only transfer changes whose newer timestamp is at most this many seconds old
    #[arg(long, global = true, value_name = "SECS")]
    recency_window: Option<u64>,

    /// Per-operation read/write deadline in seconds
    #[arg(long, global = true, value_name = "SECS")]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept sessions and store each peer tree as `{username}-{directory}`
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: u16,

        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,

        /// Working root (default: config `root`, else the current directory)
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Synchronize a local directory with a responder
    Sync {
        host: String,
        port: u16,
        username: String,
        directory: PathBuf,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SyncConfig::default(),
    };

    if let Some(window) = cli.recency_window {
        config.recency_window_secs = window;
    }
    if let Some(timeout) = cli.timeout {
        config.read_timeout_secs = timeout;
        config.write_timeout_secs = timeout;
    }
    if let Commands::Serve {
        root: Some(root), ..
    } = &cli.command
    {
        config.root = root.clone();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Serve { port, bind, .. } => {
            let addr = format!("{}:{}", bind, port);
            let server = Server::bind(&addr, config)
                .await
                .with_context(|| format!("Failed to start server on {}", addr))?;

            tokio::select! {
                res = server.run() => res.context("Server stopped")?,
                _ = tokio::signal::ctrl_c() => info!("shutting down"),
            }
        }
        Commands::Sync {
            host,
            port,
            username,
            directory,
        } => {
            let report = sync_directory(&host, port, &username, &directory, Arc::new(config))
                .await
                .with_context(|| format!("Sync of {} failed", directory.display()))?;

            match report.outcome {
                SessionOutcome::Completed => info!(
                    sent = report.files_sent,
                    received = report.files_received,
                    "sync complete"
                ),
                SessionOutcome::Busy => bail!(
                    "{} is already being synchronized on {}:{}, try again later",
                    directory.display(),
                    host,
                    port
                ),
                SessionOutcome::PeerClosed => {
                    bail!("{}:{} closed the connection before logout", host, port)
                }
            }
        }
    }

    Ok(())
}
