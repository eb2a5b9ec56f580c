//! Configuration library for docket.
//!
//! Loads a [`DocketConfig`] from a file, inline JSON or defaults, applies the
//! guard rails in [`validation`], and turns the result into the
//! [`docket_core::RuntimeConfig`] and [`docket_core::BarcodeExtractor`] the
//! daemon runs with.

pub mod loader;
pub mod models;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoader, ConfigLoaderOptions, error::ConfigLoadError};
pub use models::{
    ConfigSource, DocketConfig, ExtractionConfig, PipelineSettings,
    StorageConfig, WatchConfig,
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
