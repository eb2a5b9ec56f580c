//! # Docket Core
//!
//! Core library for docket, an unattended document-ingestion daemon. It turns
//! the noisy notification stream of a watched directory tree into a clean
//! sequence of logical file events, extracts barcodes from newly-arrived PDFs,
//! renames them from the decoded value, and keeps a durable hash store and an
//! append-only change log of every transition it observes.
//!
//! ## Architecture
//!
//! ```text
//! notify ──raw──▶ EventDebouncer ──logical──▶ IngestionPipeline
//!                     │                          │
//!                     │ (move matching)          ├─▶ BarcodeExtractor ─▶ RenameCoordinator
//!                     ▼                          ├─▶ HashStore
//!                 HashStore (read)               └─▶ ChangeLog
//! ```
//!
//! - [`fs_watch`]: adapts `notify` into the raw event channel
//! - [`debounce`]: settle windows, coalescing, move detection, stabilization
//! - [`pipeline`]: per-event state machine, single worker
//! - [`extract`]: rasterizer / decoder seams and first-match extraction
//! - [`rename`]: collision-safe barcode renames
//! - [`store`] and [`changelog`]: the durable records
//! - [`runtime`]: wires everything for one process and owns shutdown

pub mod changelog;
pub mod debounce;
pub mod error;
pub mod extract;
pub mod fs_watch;
pub mod hasher;
pub mod paths;
pub mod pipeline;
pub mod rename;
pub mod retry;
pub mod runtime;
pub mod store;

pub use changelog::{ChangeKind, ChangeLog, ChangeLogEntry, ChangeTag};
pub use debounce::{
    DebounceConfig, EventDebouncer, FingerprintSource, LogicalEvent, RawEvent,
    RawEventKind, WatchedFile,
};
pub use error::{DocketError, Result};
pub use extract::{
    BarcodeDecoder, BarcodeExtractor, BarcodeResult, Bitmap, Confidence,
    DecodeError, PopplerRasterizer, RasterError, Rasterizer, ZbarDecoder,
};
pub use fs_watch::FsWatchService;
pub use hasher::{ContentHasher, Digest};
pub use paths::PathPolicy;
pub use pipeline::{IngestionPipeline, PipelineConfig, PipelineStats};
pub use rename::{
    RenameCoordinator, RenameDecision, RenameOutcome, sanitize_barcode,
};
pub use retry::{RetryError, RetryPolicy, retry_with_backoff};
pub use runtime::{Runtime, RuntimeConfig};
pub use store::{FingerprintRecord, HashStore, Snapshot};
