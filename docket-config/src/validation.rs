use std::path::Path;

use thiserror::Error;

use crate::models::DocketConfig;
use crate::util::format_ms;

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },
    #[error("{field} must not be empty")]
    EmptyPath { field: &'static str },
    #[error("hash store and change log both point at {path}")]
    SharedStatePath { path: String },
    #[error("transient suffix list contains an empty entry; it would hide every file")]
    EmptyTransientSuffix,
    #[error("watch root {path} is not an existing directory")]
    MissingWatchRoot { path: String },
    #[error("{field} {path} lives inside the watched tree; its own writes would be picked up as file events")]
    StateInsideWatchRoot { field: &'static str, path: String },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

/// Reject settings the daemon cannot run with and collect the ones that
/// merely look wrong.
///
/// The watch root is not checked here; commands that never watch (history,
/// snapshot) must work without it. See [`require_watch_root`].
pub fn apply_guard_rails(
    config: &DocketConfig,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    non_zero("watch.channel_capacity", config.watch.channel_capacity as u64)?;
    non_zero("watch.poll_interval_ms", config.watch.poll_interval_ms)?;
    if let Some(pages) = config.extraction.max_pages {
        non_zero("extraction.max_pages", pages as u64)?;
    }
    non_zero("extraction.dpi", u64::from(config.extraction.dpi))?;
    non_zero(
        "pipeline.retry.max_attempts",
        u64::from(config.pipeline.retry.max_attempts),
    )?;

    validate_state_paths(config)?;

    if config
        .watch
        .transient_suffixes
        .iter()
        .any(|suffix| suffix.trim().is_empty())
    {
        return Err(ConfigGuardRailError::EmptyTransientSuffix);
    }

    let watch = &config.watch;
    if watch.settle_window_ms < watch.poll_interval_ms {
        warnings.push_with_hint(
            format!(
                "settle window ({}) is shorter than the stabilization poll interval ({})",
                format_ms(watch.settle_window_ms),
                format_ms(watch.poll_interval_ms)
            ),
            "Raise watch.settle_window_ms or lower watch.poll_interval_ms so bursts are merged before polling starts",
        );
    }

    if watch.stabilize_timeout_ms < watch.poll_interval_ms {
        warnings.push(format!(
            "stabilize timeout ({}) allows a single poll; files still being written may be processed early",
            format_ms(watch.stabilize_timeout_ms)
        ));
    }

    let echo_floor = watch
        .settle_window_ms
        .saturating_add(watch.stabilize_timeout_ms);
    if config.pipeline.echo_ttl_ms < echo_floor {
        warnings.push_with_hint(
            format!(
                "echo TTL ({}) is shorter than settle window plus stabilize timeout ({})",
                format_ms(config.pipeline.echo_ttl_ms),
                format_ms(echo_floor)
            ),
            "Notifications for docket's own renames may be processed as new files; raise pipeline.echo_ttl_ms",
        );
    }

    Ok(warnings)
}

/// The watch root must exist and be a directory before the watcher starts.
pub fn require_watch_root(
    config: &DocketConfig,
) -> Result<(), ConfigGuardRailError> {
    if config.watch.root.is_dir() {
        Ok(())
    } else {
        Err(ConfigGuardRailError::MissingWatchRoot {
            path: config.watch.root.display().to_string(),
        })
    }
}

fn non_zero(field: &'static str, value: u64) -> Result<(), ConfigGuardRailError> {
    if value == 0 {
        return Err(ConfigGuardRailError::ZeroValue { field });
    }
    Ok(())
}

fn validate_state_paths(config: &DocketConfig) -> Result<(), ConfigGuardRailError> {
    let storage = &config.storage;
    if storage.hash_store_path.as_os_str().is_empty() {
        return Err(ConfigGuardRailError::EmptyPath {
            field: "storage.hash_store_path",
        });
    }
    if storage.change_log_path.as_os_str().is_empty() {
        return Err(ConfigGuardRailError::EmptyPath {
            field: "storage.change_log_path",
        });
    }
    if storage.hash_store_path == storage.change_log_path {
        return Err(ConfigGuardRailError::SharedStatePath {
            path: storage.hash_store_path.display().to_string(),
        });
    }
    for (field, path) in [
        ("storage.hash_store_path", &storage.hash_store_path),
        ("storage.change_log_path", &storage.change_log_path),
    ] {
        if is_inside(path, &config.watch.root) {
            return Err(ConfigGuardRailError::StateInsideWatchRoot {
                field,
                path: path.display().to_string(),
            });
        }
    }
    Ok(())
}

// Lexical check only; relative paths are compared as written.
fn is_inside(path: &Path, root: &Path) -> bool {
    !root.as_os_str().is_empty() && path.starts_with(root)
}
