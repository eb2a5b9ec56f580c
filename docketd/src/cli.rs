use std::path::PathBuf;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};
use docket_config::DocketConfig;
use docket_config::util::{duration_ms, parse_duration};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "docketd", version)]
#[command(
    about = "Watch an inbox, rename scanned PDFs after their barcode and log every file change"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub global: GlobalArgs,
}

/// Overrides applied on top of the loaded configuration.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Configuration file (TOML or JSON). Defaults to $DOCKET_CONFIG_PATH,
    /// then docket.toml in the working directory
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory to watch recursively
    #[arg(long, env = "DOCKET_WATCH_ROOT", global = true)]
    pub root: Option<PathBuf>,

    /// Hash store file
    #[arg(long, env = "DOCKET_HASH_STORE", global = true)]
    pub hash_store: Option<PathBuf>,

    /// Change log file
    #[arg(long, env = "DOCKET_CHANGE_LOG", global = true)]
    pub change_log: Option<PathBuf>,

    /// Quiet period before a file event is acted on (e.g. 300ms, 2s)
    #[arg(long, env = "DOCKET_SETTLE_WINDOW", value_parser = parse_duration, global = true)]
    pub settle_window: Option<Duration>,

    /// Interval between size checks while a file is still being written
    #[arg(long, env = "DOCKET_POLL_INTERVAL", value_parser = parse_duration, global = true)]
    pub poll_interval: Option<Duration>,

    /// Process a file anyway once it has not settled for this long
    #[arg(long, env = "DOCKET_STABILIZE_TIMEOUT", value_parser = parse_duration, global = true)]
    pub stabilize_timeout: Option<Duration>,

    /// How long docket's own renames are remembered
    #[arg(long, env = "DOCKET_ECHO_TTL", value_parser = parse_duration, global = true)]
    pub echo_ttl: Option<Duration>,

    /// Scan only this many leading PDF pages (default: all)
    #[arg(long, env = "DOCKET_MAX_PAGES", global = true)]
    pub max_pages: Option<usize>,

    /// Rasterization resolution
    #[arg(long, env = "DOCKET_DPI", global = true)]
    pub dpi: Option<u32>,
}

impl GlobalArgs {
    pub fn apply(&self, config: &mut DocketConfig) {
        if let Some(root) = &self.root {
            config.watch.root = root.clone();
        }
        if let Some(path) = &self.hash_store {
            config.storage.hash_store_path = path.clone();
        }
        if let Some(path) = &self.change_log {
            config.storage.change_log_path = path.clone();
        }
        if let Some(window) = self.settle_window {
            config.watch.settle_window_ms = duration_ms(window);
        }
        if let Some(interval) = self.poll_interval {
            config.watch.poll_interval_ms = duration_ms(interval);
        }
        if let Some(timeout) = self.stabilize_timeout {
            config.watch.stabilize_timeout_ms = duration_ms(timeout);
        }
        if let Some(ttl) = self.echo_ttl {
            config.pipeline.echo_ttl_ms = duration_ms(ttl);
        }
        if let Some(pages) = self.max_pages {
            config.extraction.max_pages = Some(pages);
        }
        if let Some(dpi) = self.dpi {
            config.extraction.dpi = dpi;
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Watch the root and process documents until interrupted (default)
    Watch,
    /// Extract the barcode from one PDF and rename it
    Extract(ExtractArgs),
    /// Print the hash store as JSON
    Snapshot,
    /// Print the most recent change log entries
    History {
        /// Number of entries to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ExtractArgs {
    /// PDF to read
    pub pdf: PathBuf,

    /// Report the barcode and target name without renaming or recording
    #[arg(long)]
    pub dry_run: bool,
}
