//! Node Load Watcher CLI
//!
//! A command-line tool for querying a running watcher service: the most
//! recent snapshot or the rolling mean/variance analysis, per host or for
//! the whole cluster.

mod client;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use client::{WatcherClient, DEFAULT_WATCHER_ENDPOINT};
use output::OutputFormat;

/// Node Load Watcher CLI
#[derive(Parser)]
#[command(name = "watcherctl")]
#[command(author, version, about = "CLI for the node load watcher", long_about = None)]
pub struct Cli {
    /// Watcher endpoint URL (can also be set via WATCHER_URL env var)
    #[arg(long, env = "WATCHER_URL", default_value = DEFAULT_WATCHER_ENDPOINT)]
    pub watcher_url: String,

    /// Accept invalid TLS certificates
    #[arg(long)]
    pub insecure: bool,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the most recent metrics snapshot
    Latest {
        /// Restrict the snapshot to a single host
        #[arg(long)]
        host: Option<String>,
    },

    /// Show mean/variance analysis across the cached window
    Variation {
        /// Restrict the analysis to a single host
        #[arg(long)]
        host: Option<String>,

        /// Window duration (15m, 10m or 5m)
        #[arg(long)]
        duration: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        output::print_error(&format!("{err:#}"));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client = WatcherClient::new(&cli.watcher_url, cli.insecure)?;

    let metrics = match &cli.command {
        Commands::Latest { host } => client.latest_metrics(host.as_deref()).await?,
        Commands::Variation { host, duration } => {
            client
                .variation_metrics(host.as_deref(), duration.as_deref())
                .await?
        }
    };

    output::print_metrics(&metrics, cli.format)
}
