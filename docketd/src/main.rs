//! # docketd
//!
//! Unattended document ingestion. Watches a directory tree, renames scanned
//! PDFs after the first barcode found on their leading pages, and keeps a
//! content-hash store plus an append-only change log of every file
//! transition.
//!
//! Besides the daemon (`watch`, the default), the binary offers one-shot
//! extraction of a single PDF and read-only views of the store and log.

mod cli;
mod commands;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Override via RUST_LOG.
                "info,docket_core=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = commands::load_config(&cli.global)?;

    match cli.command.unwrap_or(Command::Watch) {
        Command::Watch => commands::watch(config).await,
        Command::Extract(args) => commands::extract(config, args).await,
        Command::Snapshot => commands::snapshot(&config),
        Command::History { limit } => commands::history(&config, limit),
    }
}
