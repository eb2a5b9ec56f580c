//! Resolves where configuration comes from and parses it.
//!
//! Evaluation order:
//! 1) an explicit path handed to [`ConfigLoader::with_config_path`],
//! 2) `$DOCKET_CONFIG_PATH` (TOML or JSON file),
//! 3) `$DOCKET_CONFIG_JSON` (inline JSON),
//! 4) `docket.toml`, `docket.json` or `config/docket.toml` in the working
//!    directory,
//! 5) defaults.
//!
//! A `.env` file is loaded first so the variables above may live there.

pub mod error;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use self::error::ConfigLoadError;
use crate::models::{ConfigSource, DocketConfig};
use crate::util::parse_csv;
use crate::validation::{self, ConfigWarnings};

pub const CONFIG_PATH_VAR: &str = "DOCKET_CONFIG_PATH";
pub const CONFIG_JSON_VAR: &str = "DOCKET_CONFIG_JSON";
pub const TRANSIENT_SUFFIXES_VAR: &str = "DOCKET_TRANSIENT_SUFFIXES";

const DEFAULT_CONFIG_LOCATIONS: [&str; 3] =
    ["docket.toml", "docket.json", "config/docket.toml"];

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Skip `.env` loading entirely.
    pub skip_env_file: bool,
    /// Directory searched for the well-known config files. Defaults to the
    /// process working directory.
    pub search_dir: Option<PathBuf>,
}

/// Outcome of a successful load.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: DocketConfig,
    pub source: ConfigSource,
    pub warnings: ConfigWarnings,
    pub env_file_loaded: bool,
}

pub struct ConfigLoader {
    options: ConfigLoaderOptions,
    env: EnvLookup,
}

impl std::fmt::Debug for ConfigLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigLoader")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::with_options(ConfigLoaderOptions::default())
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self {
            options,
            env: Arc::new(|name| std::env::var(name).ok()),
        }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn with_search_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.options.search_dir = Some(dir.into());
        self
    }

    pub fn without_env_file(mut self) -> Self {
        self.options.skip_env_file = true;
        self
    }

    /// Replace the process environment with `lookup`.
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Arc::new(lookup);
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        self.load_with(|_| {})
    }

    /// Load, let `overrides` adjust the result (CLI flags), then apply the
    /// guard rails to the final values.
    pub fn load_with<F>(&self, overrides: F) -> Result<ConfigLoad, ConfigLoadError>
    where
        F: FnOnce(&mut DocketConfig),
    {
        let env_file_loaded = self.load_env_file()?;
        let mut warnings = ConfigWarnings::default();

        let (mut config, source) = self.load_config()?;
        if source == ConfigSource::Default {
            warnings.push_with_hint(
                "No docket.toml detected; running with built-in defaults",
                format!("Set {CONFIG_PATH_VAR} or create docket.toml in the working directory"),
            );
        }

        if let Some(raw) = self.var(TRANSIENT_SUFFIXES_VAR) {
            let suffixes = parse_csv(&raw);
            if suffixes.is_empty() {
                return Err(ConfigLoadError::InvalidEnv {
                    name: TRANSIENT_SUFFIXES_VAR,
                    reason: "expected a comma-separated list of suffixes".into(),
                });
            }
            config.watch.transient_suffixes = suffixes;
        }

        overrides(&mut config);
        warnings.extend(validation::apply_guard_rails(&config)?);

        debug!(source = ?source, env_file_loaded, "configuration loaded");
        Ok(ConfigLoad {
            config,
            source,
            warnings,
            env_file_loaded,
        })
    }

    fn var(&self, name: &str) -> Option<String> {
        (self.env)(name).filter(|value| !value.trim().is_empty())
    }

    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        if self.options.skip_env_file {
            return Ok(false);
        }
        let loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true),
            None => dotenvy::dotenv().map(|_| true),
        };
        match loaded {
            Ok(loaded) => Ok(loaded),
            Err(dotenvy::Error::Io(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn load_config(&self) -> Result<(DocketConfig, ConfigSource), ConfigLoadError> {
        if let Some(path) = &self.options.config_path {
            let config = read_file(path)?;
            return Ok((config, ConfigSource::Explicit(path.clone())));
        }

        if let Some(raw) = self.var(CONFIG_PATH_VAR) {
            let path = PathBuf::from(raw.trim());
            let config = read_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Some(raw) = self.var(CONFIG_JSON_VAR) {
            let config = DocketConfig::parse(&raw, Some("json"), CONFIG_JSON_VAR)
                .map_err(|source| ConfigLoadError::Parse {
                    origin: CONFIG_JSON_VAR.to_string(),
                    source,
                })?;
            return Ok((config, ConfigSource::EnvInline));
        }

        let search_dir = self.options.search_dir.as_deref();
        let found = DEFAULT_CONFIG_LOCATIONS
            .iter()
            .map(|candidate| match search_dir {
                Some(dir) => dir.join(candidate),
                None => PathBuf::from(candidate),
            })
            .find(|candidate| candidate.is_file());

        match found {
            Some(path) => {
                let config = read_file(&path)?;
                Ok((config, ConfigSource::File(path)))
            }
            None => Ok((DocketConfig::default(), ConfigSource::Default)),
        }
    }
}

fn read_file(path: &Path) -> Result<DocketConfig, ConfigLoadError> {
    if !path.exists() {
        return Err(ConfigLoadError::MissingConfig {
            path: path.to_path_buf(),
        });
    }
    let contents =
        fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let extension = path.extension().and_then(|ext| ext.to_str());
    let origin = path.display().to_string();
    DocketConfig::parse(&contents, extension, &origin)
        .map_err(|source| ConfigLoadError::Parse { origin, source })
}
