//! Per-event processing.
//!
//! The pipeline consumes logical events strictly one at a time, which makes
//! it the only writer of the hash store and the change log.

mod echo;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::Receiver;
use tracing::{debug, error, info, instrument};

use crate::changelog::{ChangeLog, ChangeLogEntry, ChangeTag};
use crate::debounce::LogicalEvent;
use crate::error::{DocketError, Result};
use crate::extract::BarcodeExtractor;
use crate::hasher::{ContentHasher, Digest};
use crate::paths::{DEFAULT_TRANSIENT_SUFFIXES, PathPolicy, is_pdf};
use crate::rename::{RenameCoordinator, RenameOutcome};
use crate::store::{FingerprintRecord, HashStore};

use echo::EchoJournal;

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub transient_suffixes: Vec<String>,
    /// How long a rename we performed is remembered so its notification can
    /// be recognised. Must outlast settle window plus stabilization.
    pub echo_ttl: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            transient_suffixes: DEFAULT_TRANSIENT_SUFFIXES
                .iter()
                .map(|suffix| suffix.to_string())
                .collect(),
            echo_ttl: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub processed: u64,
    pub failed: u64,
    pub renamed: u64,
    pub echoes: u64,
}

pub struct IngestionPipeline {
    policy: PathPolicy,
    store: Arc<HashStore>,
    log: Arc<ChangeLog>,
    hasher: ContentHasher,
    extractor: BarcodeExtractor,
    renamer: RenameCoordinator,
    echoes: EchoJournal,
    stats: PipelineStats,
}

impl std::fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionPipeline")
            .field("store", &self.store.path())
            .field("log", &self.log.path())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl IngestionPipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<HashStore>,
        log: Arc<ChangeLog>,
        hasher: ContentHasher,
        extractor: BarcodeExtractor,
    ) -> Self {
        let renamer = RenameCoordinator::new(Arc::clone(&store), Arc::clone(&log));
        Self {
            policy: PathPolicy::new(config.transient_suffixes),
            store,
            log,
            hasher,
            extractor,
            renamer,
            echoes: EchoJournal::new(config.echo_ttl),
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Drain `rx` until the debouncer closes it.
    pub async fn run(mut self, mut rx: Receiver<LogicalEvent>) -> PipelineStats {
        while let Some(event) = rx.recv().await {
            self.stats.processed += 1;
            if let Err(err) = self.process(event.clone()).await {
                self.stats.failed += 1;
                report_failure(&event, &err);
            }
        }
        info!(
            processed = self.stats.processed,
            failed = self.stats.failed,
            renamed = self.stats.renamed,
            "ingestion pipeline drained"
        );
        self.stats
    }

    /// Apply one logical event to the store and the log.
    #[instrument(level = "debug", skip(self), fields(path = %event.path().display()))]
    pub async fn process(&mut self, event: LogicalEvent) -> Result<()> {
        match event {
            LogicalEvent::Created { path } => self.on_created(&path).await,
            LogicalEvent::Modified { path } => self.on_modified(&path).await,
            LogicalEvent::Deleted { path } => self.on_deleted(&path),
            LogicalEvent::Moved { from, to, digest } => {
                self.on_moved(&from, &to, digest).await
            }
        }
    }

    async fn on_created(&mut self, path: &Path) -> Result<()> {
        if self.policy.is_transient(path) {
            return Ok(());
        }
        let (digest, size) = self.hasher.fingerprint(path).await?;
        if self.echoes.consume_arrival(path, &digest) {
            self.stats.echoes += 1;
            debug!("own rename reported back; ignoring");
            return Ok(());
        }

        if !self.store.is_changed(path, &digest) {
            debug!("content already recorded; replay");
            return self.log.append(
                &ChangeLogEntry::created(path, digest).with_tag(ChangeTag::Unchanged),
            );
        }

        if !is_pdf(path) {
            self.store.put(path, FingerprintRecord::new(digest, size))?;
            return self.log.append(&ChangeLogEntry::created(path, digest));
        }

        let bytes = self.hasher.read(path).await?;
        let barcode = self.extractor.extract(&bytes).await;
        let Some(value) = barcode.value() else {
            info!(path = %path.display(), "no barcode found");
            self.store.put(path, FingerprintRecord::new(digest, size))?;
            return self.log.append(
                &ChangeLogEntry::created(path, digest).with_tag(ChangeTag::NoBarcode),
            );
        };

        let record = FingerprintRecord::new(digest, size);
        let decision = self.renamer.rename(path, value, &record).await;
        match &decision.outcome {
            RenameOutcome::Renamed => {
                self.stats.renamed += 1;
                self.echoes.record(&decision.source, &decision.target, digest);
                self.log
                    .append(&ChangeLogEntry::created(&decision.target, digest))
            }
            RenameOutcome::AlreadyNamed | RenameOutcome::Failed(_) => {
                self.store.put(path, record)?;
                self.log.append(&ChangeLogEntry::created(path, digest))
            }
        }
    }

    async fn on_modified(&mut self, path: &Path) -> Result<()> {
        if self.policy.is_transient(path) {
            return Ok(());
        }
        let (digest, size) = self.hasher.fingerprint(path).await?;
        if self.echoes.consume_arrival(path, &digest) {
            self.stats.echoes += 1;
            return Ok(());
        }

        let entry = ChangeLogEntry::modified(path, digest);
        let entry = match self.store.get(path) {
            Some(previous) if previous.digest == digest => {
                entry.with_tag(ChangeTag::Unchanged)
            }
            Some(previous) => {
                self.store.put(path, FingerprintRecord::new(digest, size))?;
                entry.with_tag(ChangeTag::ContentChanged {
                    previous: previous.digest,
                })
            }
            None => {
                self.store.put(path, FingerprintRecord::new(digest, size))?;
                entry.with_tag(ChangeTag::Untracked)
            }
        };
        self.log.append(&entry)
    }

    fn on_deleted(&mut self, path: &Path) -> Result<()> {
        if self.echoes.consume_delete(path) {
            self.stats.echoes += 1;
            return Ok(());
        }

        let entry = match self.store.remove(path)? {
            Some(previous) => ChangeLogEntry::deleted(path, Some(previous.digest)),
            None => ChangeLogEntry::deleted(path, None).with_tag(ChangeTag::Untracked),
        };
        self.log.append(&entry)
    }

    async fn on_moved(
        &mut self,
        from: &Path,
        to: &Path,
        digest: Option<Digest>,
    ) -> Result<()> {
        if self.echoes.consume_move(from, to) {
            self.stats.echoes += 1;
            debug!("own rename reported back; ignoring");
            return Ok(());
        }

        if tokio::fs::metadata(to)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
        {
            let moved = self.store.rename_prefix(from, to)?;
            info!(
                from = %from.display(),
                to = %to.display(),
                files = moved.len(),
                "directory moved"
            );
            let entries: Vec<ChangeLogEntry> = moved
                .into_iter()
                .flat_map(|(old, new, record)| {
                    ChangeLogEntry::moved_pair(&old, &new, record.digest)
                })
                .collect();
            return self.log.append_all(&entries);
        }

        let previous = self.store.get(from);
        let record = match (digest, &previous) {
            (Some(digest), Some(previous)) if previous.digest == digest => {
                FingerprintRecord::new(digest, previous.size)
            }
            _ => {
                let (digest, size) = self.hasher.fingerprint(to).await?;
                FingerprintRecord::new(digest, size)
            }
        };

        let tag = match &previous {
            None => Some(ChangeTag::Untracked),
            Some(previous) if previous.digest != record.digest => {
                Some(ChangeTag::ContentChanged {
                    previous: previous.digest,
                })
            }
            Some(_) => None,
        };

        let digest = record.digest;
        self.store.rename_key(from, to, record)?;
        let pair = ChangeLogEntry::moved_pair(from, to, digest)
            .map(|entry| match tag {
                Some(tag) => entry.with_tag(tag),
                None => entry,
            });
        self.log.append_all(&pair)
    }
}

fn report_failure(event: &LogicalEvent, err: &DocketError) {
    let path = event.path().display();
    match err {
        DocketError::LogWrite { .. } => {
            error!(%path, error = %err, "change log entry omitted");
        }
        DocketError::IoUnavailable { attempts, .. } => {
            error!(%path, attempts, error = %err, "file unavailable; event skipped");
        }
        _ => error!(%path, error = %err, event = ?event, "event processing failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::changelog::ChangeKind;
    use crate::extract::{MockBarcodeDecoder, MockRasterizer};
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        dir: TempDir,
        store: Arc<HashStore>,
        log: Arc<ChangeLog>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let store = Arc::new(HashStore::open(dir.path().join("hashes.json")).unwrap());
            let log = Arc::new(ChangeLog::open(dir.path().join("changes.log")).unwrap());
            Self { dir, store, log }
        }

        fn pipeline(&self, barcode: Option<&'static str>) -> IngestionPipeline {
            let mut rasterizer = MockRasterizer::new();
            rasterizer.expect_page_count().returning(|_| Ok(1));
            rasterizer
                .expect_render()
                .returning(|_, _| Ok(image::DynamicImage::new_luma8(2, 2)));
            let mut decoder = MockBarcodeDecoder::new();
            decoder
                .expect_decode()
                .returning(move |_| Ok(barcode.map(str::to_string)));

            IngestionPipeline::new(
                PipelineConfig::default(),
                Arc::clone(&self.store),
                Arc::clone(&self.log),
                ContentHasher::default(),
                BarcodeExtractor::new(Arc::new(rasterizer), Arc::new(decoder), None),
            )
        }

        fn kinds(&self) -> Vec<(ChangeKind, Option<ChangeTag>)> {
            ChangeLog::read_entries(self.log.path())
                .unwrap()
                .into_iter()
                .map(|entry| (entry.kind, entry.tag))
                .collect()
        }
    }

    #[tokio::test]
    async fn modified_distinguishes_unchanged_and_changed() {
        let fx = Fixture::new();
        let file = fx.dir.path().join("notes.txt");
        std::fs::write(&file, b"v1").unwrap();
        let mut pipeline = fx.pipeline(None);

        pipeline
            .process(LogicalEvent::Modified { path: file.clone() })
            .await
            .unwrap();
        pipeline
            .process(LogicalEvent::Modified { path: file.clone() })
            .await
            .unwrap();
        std::fs::write(&file, b"v2").unwrap();
        pipeline
            .process(LogicalEvent::Modified { path: file.clone() })
            .await
            .unwrap();

        let previous = ContentHasher::hash_bytes(b"v1");
        assert_eq!(
            fx.kinds(),
            vec![
                (ChangeKind::Modified, Some(ChangeTag::Untracked)),
                (ChangeKind::Modified, Some(ChangeTag::Unchanged)),
                (ChangeKind::Modified, Some(ChangeTag::ContentChanged { previous })),
            ]
        );
        assert_eq!(
            fx.store.get(&file).unwrap().digest,
            ContentHasher::hash_bytes(b"v2")
        );
    }

    #[tokio::test]
    async fn delete_of_unknown_file_is_untracked() {
        let fx = Fixture::new();
        let mut pipeline = fx.pipeline(None);

        pipeline
            .process(LogicalEvent::Deleted {
                path: fx.dir.path().join("stray.txt"),
            })
            .await
            .unwrap();

        let entries = ChangeLog::read_entries(fx.log.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].digest, None);
        assert_eq!(entries[0].tag, Some(ChangeTag::Untracked));
    }

    #[tokio::test]
    async fn own_rename_echo_is_swallowed() {
        let fx = Fixture::new();
        let scan = fx.dir.path().join("scan001.pdf");
        std::fs::write(&scan, b"%PDF scan").unwrap();
        let mut pipeline = fx.pipeline(Some("EAN-900112345"));

        pipeline
            .process(LogicalEvent::Created { path: scan.clone() })
            .await
            .unwrap();
        let renamed = fx.dir.path().join("EAN-900112345.pdf");
        pipeline
            .process(LogicalEvent::Moved {
                from: scan.clone(),
                to: renamed.clone(),
                digest: None,
            })
            .await
            .unwrap();

        assert_eq!(pipeline.stats().echoes, 1);
        assert_eq!(pipeline.stats().renamed, 1);
        assert_eq!(
            fx.kinds(),
            vec![
                (ChangeKind::MovedFrom, None),
                (ChangeKind::MovedTo, None),
                (ChangeKind::Created, None),
            ]
        );
    }

    #[tokio::test]
    async fn own_rename_seen_as_create_and_delete_is_swallowed() {
        let fx = Fixture::new();
        let scan = fx.dir.path().join("scan002.pdf");
        std::fs::write(&scan, b"%PDF scan two").unwrap();
        let mut pipeline = fx.pipeline(Some("EAN-2"));

        pipeline
            .process(LogicalEvent::Created { path: scan.clone() })
            .await
            .unwrap();
        let renamed = fx.dir.path().join("EAN-2.pdf");
        pipeline
            .process(LogicalEvent::Created {
                path: renamed.clone(),
            })
            .await
            .unwrap();
        pipeline
            .process(LogicalEvent::Deleted { path: scan.clone() })
            .await
            .unwrap();

        assert_eq!(pipeline.stats().echoes, 2);
        assert!(fx.store.get(&renamed).is_some());
        assert_eq!(
            fx.kinds(),
            vec![
                (ChangeKind::MovedFrom, None),
                (ChangeKind::MovedTo, None),
                (ChangeKind::Created, None),
            ]
        );
    }

    #[tokio::test]
    async fn moved_file_keeps_its_record() {
        let fx = Fixture::new();
        let a = fx.dir.path().join("a.txt");
        let b = fx.dir.path().join("b.txt");
        std::fs::write(&a, b"body").unwrap();
        let mut pipeline = fx.pipeline(None);
        pipeline
            .process(LogicalEvent::Created { path: a.clone() })
            .await
            .unwrap();

        std::fs::rename(&a, &b).unwrap();
        pipeline
            .process(LogicalEvent::Moved {
                from: a.clone(),
                to: b.clone(),
                digest: None,
            })
            .await
            .unwrap();

        assert!(fx.store.get(&a).is_none());
        assert_eq!(
            fx.store.get(&b).unwrap().digest,
            ContentHasher::hash_bytes(b"body")
        );
        assert_eq!(
            fx.kinds(),
            vec![
                (ChangeKind::Created, None),
                (ChangeKind::MovedFrom, None),
                (ChangeKind::MovedTo, None),
            ]
        );
    }

    #[tokio::test]
    async fn directory_move_rekeys_children() {
        let fx = Fixture::new();
        let inbox = fx.dir.path().join("inbox");
        let archive = fx.dir.path().join("archive");
        std::fs::create_dir(&inbox).unwrap();
        std::fs::write(inbox.join("a.txt"), b"a").unwrap();
        let mut pipeline = fx.pipeline(None);
        pipeline
            .process(LogicalEvent::Created {
                path: inbox.join("a.txt"),
            })
            .await
            .unwrap();

        std::fs::rename(&inbox, &archive).unwrap();
        pipeline
            .process(LogicalEvent::Moved {
                from: inbox.clone(),
                to: archive.clone(),
                digest: None,
            })
            .await
            .unwrap();

        assert!(fx.store.get(&archive.join("a.txt")).is_some());
        assert!(fx.store.get(&inbox.join("a.txt")).is_none());
    }
}
