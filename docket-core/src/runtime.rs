//! Process wiring: one watcher, one debouncer task, one pipeline task.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::changelog::ChangeLog;
use crate::debounce::{DebounceConfig, EventDebouncer, FingerprintSource};
use crate::error::{DocketError, Result};
use crate::extract::BarcodeExtractor;
use crate::fs_watch::FsWatchService;
use crate::hasher::ContentHasher;
use crate::pipeline::{IngestionPipeline, PipelineConfig, PipelineStats};
use crate::retry::RetryPolicy;
use crate::store::HashStore;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub root: PathBuf,
    pub store_path: PathBuf,
    pub changelog_path: PathBuf,
    pub debounce: DebounceConfig,
    pub pipeline: PipelineConfig,
    /// Capacity of both the raw and the logical event channel.
    pub channel_capacity: usize,
    /// Open/read retries for hashing and extraction.
    pub retry: RetryPolicy,
}

impl RuntimeConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            store_path: PathBuf::from("file_hashes.json"),
            changelog_path: PathBuf::from("file_changes.log"),
            debounce: DebounceConfig::default(),
            pipeline: PipelineConfig::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            retry: RetryPolicy::default(),
        }
    }
}

/// A running ingestion engine. All state is owned here; nothing is global.
#[derive(Debug)]
pub struct Runtime {
    root: PathBuf,
    store: Arc<HashStore>,
    log: Arc<ChangeLog>,
    watcher: Option<FsWatchService>,
    debouncer: JoinHandle<()>,
    pipeline: JoinHandle<PipelineStats>,
}

impl Runtime {
    /// Open the durable state, start the watcher and spawn the tasks.
    ///
    /// Fails when the root is missing, the store or log cannot be written, or
    /// the watcher cannot be initialised.
    pub async fn start(
        config: RuntimeConfig,
        extractor: BarcodeExtractor,
    ) -> Result<Self> {
        let root = validate_root(&config.root).await?;
        for (what, path) in [
            ("hash store", &config.store_path),
            ("change log", &config.changelog_path),
        ] {
            reject_state_inside_root(&root, what, path)?;
        }
        let store = Arc::new(HashStore::open(&config.store_path)?);
        let log = Arc::new(ChangeLog::open(&config.changelog_path)?);
        let hasher = ContentHasher::new(config.retry);

        info!(
            root = %root.display(),
            store = %store.path().display(),
            changelog = %log.path().display(),
            known_files = store.len(),
            "starting docket runtime"
        );

        let capacity = config.channel_capacity.max(1);
        let (raw_tx, raw_rx) = mpsc::channel(capacity);
        let (logical_tx, logical_rx) = mpsc::channel(capacity);

        let source: Arc<dyn FingerprintSource> = store.clone();
        let debouncer =
            EventDebouncer::new(config.debounce, source, hasher.clone());
        let pipeline = IngestionPipeline::new(
            config.pipeline,
            Arc::clone(&store),
            Arc::clone(&log),
            hasher,
            extractor,
        );

        let watcher = FsWatchService::start(&root, raw_tx)?;
        let debouncer = tokio::spawn(debouncer.run(raw_rx, logical_tx));
        let pipeline = tokio::spawn(pipeline.run(logical_rx));

        Ok(Self {
            root,
            store,
            log,
            watcher: Some(watcher),
            debouncer,
            pipeline,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &Arc<HashStore> {
        &self.store
    }

    pub fn change_log(&self) -> &Arc<ChangeLog> {
        &self.log
    }

    /// Run until `cancel` fires, then shut down cleanly.
    pub async fn run_until(self, cancel: CancellationToken) -> Result<PipelineStats> {
        cancel.cancelled().await;
        info!("shutdown requested");
        self.shutdown().await
    }

    /// Stop the watcher, let the debouncer flush, and let the pipeline drain.
    pub async fn shutdown(mut self) -> Result<PipelineStats> {
        // Dropping the watcher drops the raw sender; everything downstream
        // finishes on its own once its input closes.
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }

        if let Err(err) = self.debouncer.await {
            warn!(error = %err, "debouncer task ended abnormally");
        }
        let stats = self
            .pipeline
            .await
            .map_err(|err| DocketError::Internal(format!("pipeline task failed: {err}")))?;

        info!(
            processed = stats.processed,
            failed = stats.failed,
            renamed = stats.renamed,
            "docket runtime stopped"
        );
        Ok(stats)
    }
}

/// The root must exist and be a directory. Returned canonicalized so watcher
/// paths and store keys agree.
async fn validate_root(root: &Path) -> Result<PathBuf> {
    let meta = tokio::fs::metadata(root).await.map_err(|err| {
        DocketError::InvalidConfig(format!(
            "watch root {} is not accessible: {err}",
            root.display()
        ))
    })?;
    if !meta.is_dir() {
        return Err(DocketError::InvalidConfig(format!(
            "watch root {} is not a directory",
            root.display()
        )));
    }
    Ok(tokio::fs::canonicalize(root).await?)
}

/// State files below the watched tree would feed their own writes back as
/// file events. `root` is canonical; `path` may not exist yet, so the
/// deepest existing ancestor is resolved instead.
fn reject_state_inside_root(root: &Path, what: &str, path: &Path) -> Result<()> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let resolved = absolute
        .ancestors()
        .skip(1)
        .find_map(|dir| std::fs::canonicalize(dir).ok());
    match resolved {
        Some(dir) if dir.starts_with(root) => Err(DocketError::InvalidConfig(format!(
            "{what} {} lives inside the watch root {}",
            path.display(),
            root.display()
        ))),
        _ => Ok(()),
    }
}
