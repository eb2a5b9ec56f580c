//! Barcode extraction from PDF bytes.
//!
//! Extraction sits on two seams: a [`Rasterizer`] that turns one PDF page
//! into a bitmap and a [`BarcodeDecoder`] that finds a value in a bitmap.
//! [`BarcodeExtractor`] walks pages in order and returns the first value it
//! decodes. Nothing in here touches the source file.

mod poppler;
mod zbar;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use poppler::{DEFAULT_DPI, PopplerRasterizer};
pub use zbar::ZbarDecoder;

/// Rendered page.
pub type Bitmap = image::DynamicImage;

/// Default page cap: none, every page is scanned.
pub const DEFAULT_MAX_PAGES: Option<usize> = None;

#[derive(Error, Debug)]
pub enum RasterError {
    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("page {0} is out of range")]
    PageOutOfRange(usize),

    #[error("invalid rasterizer output: {0}")]
    InvalidOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("failed to encode bitmap: {0}")]
    Encode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// PDF page rendering.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Rasterizer: Send + Sync {
    async fn page_count(&self, pdf: &[u8]) -> Result<usize, RasterError>;

    /// Render the zero-based `page_index`.
    async fn render(
        &self,
        pdf: &[u8],
        page_index: usize,
    ) -> Result<Bitmap, RasterError>;
}

/// Barcode decoding primitive. `Ok(None)` means the image holds no
/// decodable symbol.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BarcodeDecoder: Send + Sync {
    async fn decode(&self, bitmap: &Bitmap)
    -> Result<Option<String>, DecodeError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Confidence {
    Decoded,
    NotFound,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BarcodeResult {
    pub value: Option<String>,
    /// Zero-based page the value was found on.
    pub page_index: Option<usize>,
    pub confidence: Confidence,
}

impl BarcodeResult {
    pub fn decoded(value: impl Into<String>, page_index: usize) -> Self {
        Self {
            value: Some(value.into()),
            page_index: Some(page_index),
            confidence: Confidence::Decoded,
        }
    }

    pub fn not_found() -> Self {
        Self {
            value: None,
            page_index: None,
            confidence: Confidence::NotFound,
        }
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn is_decoded(&self) -> bool {
        self.confidence == Confidence::Decoded
    }
}

/// First-match barcode extraction over the pages of a PDF, optionally
/// capped to a leading prefix.
#[derive(Clone)]
pub struct BarcodeExtractor {
    rasterizer: Arc<dyn Rasterizer>,
    decoder: Arc<dyn BarcodeDecoder>,
    max_pages: Option<usize>,
}

impl std::fmt::Debug for BarcodeExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarcodeExtractor")
            .field("max_pages", &self.max_pages)
            .finish_non_exhaustive()
    }
}

impl BarcodeExtractor {
    pub fn new(
        rasterizer: Arc<dyn Rasterizer>,
        decoder: Arc<dyn BarcodeDecoder>,
        max_pages: Option<usize>,
    ) -> Self {
        Self {
            rasterizer,
            decoder,
            max_pages: max_pages.map(|cap| cap.max(1)),
        }
    }

    pub fn max_pages(&self) -> Option<usize> {
        self.max_pages
    }

    /// Scan pages from the first one and stop at the first decodable value.
    ///
    /// Failures on a page are logged and treated as "nothing on this page";
    /// the result is [`BarcodeResult::not_found`] when no page yields a value.
    pub async fn extract(&self, pdf: &[u8]) -> BarcodeResult {
        let cap = self.max_pages.unwrap_or(usize::MAX);
        let (pages, counted) = match self.rasterizer.page_count(pdf).await {
            Ok(count) => (count.min(cap), true),
            Err(err) => {
                // Keep probing; render reports PageOutOfRange past the end.
                warn!(error = %err, "failed to count PDF pages");
                (cap, false)
            }
        };

        for page_index in 0..pages {
            let bitmap = match self.rasterizer.render(pdf, page_index).await {
                Ok(bitmap) => bitmap,
                Err(RasterError::PageOutOfRange(_)) => break,
                Err(err) => {
                    warn!(page = page_index + 1, error = %err, "failed to render page");
                    // Without a count or a cap a failing page may be the end.
                    if !counted && self.max_pages.is_none() {
                        break;
                    }
                    continue;
                }
            };

            match self.decoder.decode(&bitmap).await {
                Ok(Some(value)) => {
                    let value = value.trim();
                    if value.is_empty() {
                        continue;
                    }
                    info!(page = page_index + 1, barcode = %value, "barcode decoded");
                    return BarcodeResult::decoded(value, page_index);
                }
                Ok(None) => {
                    debug!(page = page_index + 1, "no barcode on page");
                }
                Err(err) => {
                    warn!(page = page_index + 1, error = %err, "barcode decoding failed");
                }
            }
        }

        BarcodeResult::not_found()
    }
}
