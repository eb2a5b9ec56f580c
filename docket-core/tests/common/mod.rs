#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use docket_core::extract::{DecodeError, RasterError};
use docket_core::{
    BarcodeDecoder, BarcodeExtractor, Bitmap, ChangeKind, ChangeLog,
    ChangeLogEntry, ChangeTag, ContentHasher, HashStore, IngestionPipeline,
    PipelineConfig, Rasterizer,
};
use tempfile::TempDir;

const MARKER: &str = "BARCODE=";

/// Test PDF body whose single page carries `barcode`.
pub fn pdf_with_barcode(barcode: &str, salt: &str) -> Vec<u8> {
    format!("%PDF-1.7\n% {salt}\n{MARKER}{barcode}\n%%EOF\n").into_bytes()
}

pub fn pdf_without_barcode(salt: &str) -> Vec<u8> {
    format!("%PDF-1.7\n% {salt}\n%%EOF\n").into_bytes()
}

/// Renders the `BARCODE=` marker of a fake PDF into the pixels of a one-row
/// grey image.
#[derive(Debug, Default)]
pub struct MarkerRasterizer;

#[async_trait]
impl Rasterizer for MarkerRasterizer {
    async fn page_count(&self, _pdf: &[u8]) -> Result<usize, RasterError> {
        Ok(1)
    }

    async fn render(
        &self,
        pdf: &[u8],
        page_index: usize,
    ) -> Result<Bitmap, RasterError> {
        if page_index > 0 {
            return Err(RasterError::PageOutOfRange(page_index));
        }
        let text = String::from_utf8_lossy(pdf);
        let value = text
            .lines()
            .find_map(|line| line.strip_prefix(MARKER))
            .unwrap_or_default();
        let width = value.len().max(1) as u32;
        let mut pixels = value.as_bytes().to_vec();
        pixels.resize(width as usize, 0);
        let image = image::GrayImage::from_raw(width, 1, pixels)
            .ok_or_else(|| RasterError::InvalidOutput("bad buffer".into()))?;
        Ok(Bitmap::ImageLuma8(image))
    }
}

/// Reads back what [`MarkerRasterizer`] painted.
#[derive(Debug, Default)]
pub struct MarkerDecoder;

#[async_trait]
impl BarcodeDecoder for MarkerDecoder {
    async fn decode(
        &self,
        bitmap: &Bitmap,
    ) -> Result<Option<String>, DecodeError> {
        let bytes: Vec<u8> = bitmap
            .to_luma8()
            .pixels()
            .map(|pixel| pixel.0[0])
            .take_while(|byte| *byte != 0)
            .collect();
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

pub fn marker_extractor() -> BarcodeExtractor {
    BarcodeExtractor::new(Arc::new(MarkerRasterizer), Arc::new(MarkerDecoder), None)
}

/// Scratch inbox plus state files.
pub struct Workspace {
    pub dir: TempDir,
    pub inbox: PathBuf,
    pub store: Arc<HashStore>,
    pub log: Arc<ChangeLog>,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let inbox = dir.path().join("inbox");
        std::fs::create_dir(&inbox).expect("inbox");
        let store = Arc::new(
            HashStore::open(dir.path().join("file_hashes.json")).expect("store"),
        );
        let log = Arc::new(
            ChangeLog::open(dir.path().join("file_changes.log")).expect("log"),
        );
        Self {
            dir,
            inbox,
            store,
            log,
        }
    }

    pub fn write(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.inbox.join(name);
        std::fs::write(&path, bytes).expect("write file");
        path
    }

    pub fn pipeline(&self) -> IngestionPipeline {
        IngestionPipeline::new(
            PipelineConfig::default(),
            Arc::clone(&self.store),
            Arc::clone(&self.log),
            ContentHasher::default(),
            marker_extractor(),
        )
    }

    pub fn entries(&self) -> Vec<ChangeLogEntry> {
        ChangeLog::read_entries(self.log.path()).expect("read log")
    }

    pub fn kinds(&self) -> Vec<(ChangeKind, Option<ChangeTag>)> {
        self.entries()
            .into_iter()
            .map(|entry| (entry.kind, entry.tag))
            .collect()
    }

    pub fn store_path(&self) -> &Path {
        self.store.path()
    }
}
