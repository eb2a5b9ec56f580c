use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use docket_config::{ConfigLoader, ConfigSource, DocketConfig, validation};
use docket_core::paths::is_pdf;
use docket_core::{
    ChangeLog, ChangeLogEntry, ChangeTag, ContentHasher, FingerprintRecord,
    HashStore, RenameCoordinator, RenameOutcome, Runtime, sanitize_barcode,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::{ExtractArgs, GlobalArgs};

/// Load configuration, apply CLI overrides and report what was used.
pub fn load_config(args: &GlobalArgs) -> anyhow::Result<DocketConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_config_path(path);
    }
    let load = loader
        .load_with(|config| args.apply(config))
        .context("failed to load configuration")?;

    if load.env_file_loaded {
        info!("loaded .env file");
    }
    match &load.source {
        ConfigSource::Default => {}
        ConfigSource::Explicit(path) | ConfigSource::File(path) => {
            info!(path = %path.display(), "configuration loaded from file")
        }
        ConfigSource::EnvPath(path) => {
            info!(path = %path.display(), "configuration loaded from env path")
        }
        ConfigSource::EnvInline => {
            info!("configuration loaded from inline environment json")
        }
    }
    for warning in &load.warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => {
                warn!(message = %warning.message, "configuration warning")
            }
        }
    }

    Ok(load.config)
}

/// Run the daemon until Ctrl-C.
pub async fn watch(config: DocketConfig) -> anyhow::Result<()> {
    validation::require_watch_root(&config)?;

    let runtime = Runtime::start(config.runtime_config(), config.build_extractor())
        .await
        .context("failed to start docket runtime")?;

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl-C"),
            Err(err) => error!(error = %err, "failed to listen for Ctrl-C"),
        }
        signal.cancel();
    });

    let stats = runtime.run_until(cancel).await?;
    if stats.failed > 0 {
        warn!(failed = stats.failed, "some events could not be processed");
    }
    Ok(())
}

/// One-shot extraction and rename of a single PDF.
pub async fn extract(config: DocketConfig, args: ExtractArgs) -> anyhow::Result<()> {
    let path = tokio::fs::canonicalize(&args.pdf)
        .await
        .with_context(|| format!("cannot open {}", args.pdf.display()))?;
    if !is_pdf(&path) {
        warn!(path = %path.display(), "file does not have a .pdf extension");
    }

    let hasher = ContentHasher::new(config.pipeline.retry);
    let bytes = hasher
        .read(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let result = config.build_extractor().extract(&bytes).await;

    let Some(value) = result.value() else {
        println!("{}: no barcode found", path.display());
        if !args.dry_run {
            let (store, log) = open_state(&config)?;
            record_in_place(&store, &log, &path, &bytes, Some(ChangeTag::NoBarcode))?;
        }
        return Ok(());
    };

    if args.dry_run {
        match sanitize_barcode(value) {
            Some(stem) => println!("{}: barcode {value} -> {stem}.pdf", path.display()),
            None => println!("{}: barcode {value} is not usable as a name", path.display()),
        }
        return Ok(());
    }

    let (store, log) = open_state(&config)?;
    let coordinator = RenameCoordinator::new(Arc::clone(&store), Arc::clone(&log));
    let record = FingerprintRecord::new(
        ContentHasher::hash_bytes(&bytes),
        bytes.len() as u64,
    );
    let decision = coordinator.rename(&path, value, &record).await;

    match &decision.outcome {
        RenameOutcome::Renamed => {
            log.append(&ChangeLogEntry::created(&decision.target, record.digest))?;
            println!(
                "{} -> {}",
                decision.source.display(),
                decision.target.display()
            );
        }
        RenameOutcome::AlreadyNamed => {
            record_in_place(&store, &log, &path, &bytes, None)?;
            println!("{}: already named after barcode {value}", path.display());
        }
        RenameOutcome::Failed(reason) => {
            bail!("failed to rename {}: {reason}", path.display());
        }
    }
    Ok(())
}

/// Print the hash store as pretty JSON.
pub fn snapshot(config: &DocketConfig) -> anyhow::Result<()> {
    let store = HashStore::open(&config.storage.hash_store_path)
        .context("failed to open hash store")?;
    let json = serde_json::to_string_pretty(&store.snapshot())?;
    println!("{json}");
    Ok(())
}

/// Print the last `limit` change log lines.
pub fn history(config: &DocketConfig, limit: usize) -> anyhow::Result<()> {
    let entries = ChangeLog::tail(&config.storage.change_log_path, limit)
        .context("failed to read change log")?;
    for entry in entries {
        println!("{}", entry.to_line());
    }
    Ok(())
}

fn open_state(
    config: &DocketConfig,
) -> anyhow::Result<(Arc<HashStore>, Arc<ChangeLog>)> {
    let store = HashStore::open(&config.storage.hash_store_path)
        .context("failed to open hash store")?;
    let log = ChangeLog::open(&config.storage.change_log_path)
        .context("failed to open change log")?;
    Ok((Arc::new(store), Arc::new(log)))
}

/// Store and log a file that keeps its name, unless the store already holds
/// the same bytes for it.
fn record_in_place(
    store: &HashStore,
    log: &ChangeLog,
    path: &Path,
    bytes: &[u8],
    tag: Option<ChangeTag>,
) -> anyhow::Result<()> {
    let digest = ContentHasher::hash_bytes(bytes);
    if !store.is_changed(path, &digest) {
        return Ok(());
    }
    store.put(path, FingerprintRecord::new(digest, bytes.len() as u64))?;
    let entry = ChangeLogEntry::created(path, digest);
    log.append(&match tag {
        Some(tag) => entry.with_tag(tag),
        None => entry,
    })?;
    Ok(())
}
