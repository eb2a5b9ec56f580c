use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use docket_core::extract::DEFAULT_DPI;
use docket_core::extract::DEFAULT_MAX_PAGES;
use docket_core::paths::DEFAULT_TRANSIENT_SUFFIXES;
use docket_core::runtime::DEFAULT_CHANNEL_CAPACITY;
use docket_core::{
    BarcodeExtractor, DebounceConfig, PipelineConfig, PopplerRasterizer,
    RetryPolicy, RuntimeConfig, ZbarDecoder,
};
use serde::{Deserialize, Serialize};

fn default_transient_suffixes() -> Vec<String> {
    DEFAULT_TRANSIENT_SUFFIXES
        .iter()
        .map(|suffix| suffix.to_string())
        .collect()
}

/// Where the loaded configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    /// Explicit path handed to the loader (CLI flag).
    Explicit(PathBuf),
    /// `$DOCKET_CONFIG_PATH`.
    EnvPath(PathBuf),
    /// `$DOCKET_CONFIG_JSON`.
    EnvInline,
    /// One of the well-known files in the working directory.
    File(PathBuf),
}

/// Complete daemon configuration. Every section is optional in a file;
/// missing keys fall back to the defaults below.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct DocketConfig {
    pub watch: WatchConfig,
    pub storage: StorageConfig,
    pub extraction: ExtractionConfig,
    pub pipeline: PipelineSettings,
}

/// The watched tree and how raw notifications are debounced.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Directory watched recursively. Must exist at startup.
    pub root: PathBuf,
    /// Paths ending in one of these are ignored until renamed away.
    #[serde(default = "default_transient_suffixes")]
    pub transient_suffixes: Vec<String>,
    /// Quiet period (ms) after the last event for a path before it is acted
    /// on. Longer windows merge slower uploads into one event.
    pub settle_window_ms: u64,
    /// Size/mtime poll interval (ms) while waiting for a file to settle.
    pub poll_interval_ms: u64,
    /// Give up waiting for a file to settle after this many ms and process
    /// it anyway.
    pub stabilize_timeout_ms: u64,
    /// Capacity of the raw and logical event channels.
    pub channel_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("Testing"),
            transient_suffixes: default_transient_suffixes(),
            settle_window_ms: 300,
            poll_interval_ms: 100,
            stabilize_timeout_ms: 10_000,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub hash_store_path: PathBuf,
    pub change_log_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            hash_store_path: PathBuf::from("file_hashes.json"),
            change_log_path: PathBuf::from("file_changes.log"),
        }
    }
}

/// Rasterizer and decoder settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Scan only this many leading pages; every page when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<usize>,
    pub dpi: u32,
    pub pdfinfo_path: PathBuf,
    pub pdftoppm_path: PathBuf,
    pub zbarimg_path: PathBuf,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_pages: DEFAULT_MAX_PAGES,
            dpi: DEFAULT_DPI,
            pdfinfo_path: PathBuf::from("pdfinfo"),
            pdftoppm_path: PathBuf::from("pdftoppm"),
            zbarimg_path: PathBuf::from("zbarimg"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// How long (ms) a rename performed by docket is remembered so that its
    /// own notification is not processed again.
    pub echo_ttl_ms: u64,
    /// Open/read retries while a writer still holds a file.
    pub retry: RetryPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            echo_ttl_ms: 30_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl WatchConfig {
    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stabilize_timeout(&self) -> Duration {
        Duration::from_millis(self.stabilize_timeout_ms)
    }
}

impl DocketConfig {
    /// Parse a file's contents, picking the format from `extension` and
    /// trying TOML then JSON when the extension says nothing.
    pub fn parse(
        contents: &str,
        extension: Option<&str>,
        origin: &str,
    ) -> anyhow::Result<Self> {
        match extension {
            Some("json") => serde_json::from_str(contents)
                .with_context(|| format!("invalid docket config {origin}")),
            Some("toml") | Some("tml") => toml::from_str(contents)
                .map_err(|err| anyhow!("invalid docket config {origin}: {err}")),
            _ => toml::from_str(contents).or_else(|toml_err| {
                serde_json::from_str(contents).map_err(|json_err| {
                    anyhow!(
                        "failed to parse docket config {origin}: toml error: {toml_err}; json error: {json_err}"
                    )
                })
            }),
        }
    }

    /// Runtime settings for [`docket_core::Runtime::start`].
    pub fn runtime_config(&self) -> RuntimeConfig {
        let mut runtime = RuntimeConfig::new(&self.watch.root);
        runtime.store_path = self.storage.hash_store_path.clone();
        runtime.changelog_path = self.storage.change_log_path.clone();
        runtime.debounce = DebounceConfig {
            settle_window: self.watch.settle_window(),
            poll_interval: self.watch.poll_interval(),
            stabilize_timeout: self.watch.stabilize_timeout(),
            transient_suffixes: self.watch.transient_suffixes.clone(),
        };
        runtime.pipeline = PipelineConfig {
            transient_suffixes: self.watch.transient_suffixes.clone(),
            echo_ttl: Duration::from_millis(self.pipeline.echo_ttl_ms),
        };
        runtime.channel_capacity = self.watch.channel_capacity;
        runtime.retry = self.pipeline.retry;
        runtime
    }

    /// Extractor backed by the poppler and zbar command-line tools.
    pub fn build_extractor(&self) -> BarcodeExtractor {
        let extraction = &self.extraction;
        BarcodeExtractor::new(
            Arc::new(PopplerRasterizer::new(
                &extraction.pdfinfo_path,
                &extraction.pdftoppm_path,
                extraction.dpi,
            )),
            Arc::new(ZbarDecoder::new(&extraction.zbarimg_path)),
            extraction.max_pages,
        )
    }
}
