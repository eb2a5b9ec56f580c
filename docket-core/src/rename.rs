//! Collision-safe renames driven by a decoded barcode value.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::changelog::{ChangeLog, ChangeLogEntry};
use crate::store::{FingerprintRecord, HashStore};

/// Upper bound for the `-N` suffix tried when the target name is taken.
pub const MAX_COLLISION_SUFFIX: u32 = 10_000;

/// Longest sanitized barcode used as a file stem.
const MAX_STEM_CHARS: usize = 200;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RenameOutcome {
    Renamed,
    /// The file already carries the target name; nothing was touched.
    AlreadyNamed,
    Failed(String),
}

#[derive(Clone, Debug)]
pub struct RenameDecision {
    pub source: PathBuf,
    pub target: PathBuf,
    pub collision_resolved: bool,
    pub outcome: RenameOutcome,
}

impl RenameDecision {
    fn failed(source: &Path, reason: impl Into<String>) -> Self {
        Self {
            source: source.to_path_buf(),
            target: source.to_path_buf(),
            collision_resolved: false,
            outcome: RenameOutcome::Failed(reason.into()),
        }
    }

    /// Where the file lives after the decision was carried out.
    pub fn final_path(&self) -> &Path {
        match self.outcome {
            RenameOutcome::Renamed => &self.target,
            _ => &self.source,
        }
    }
}

/// Make a decoded barcode usable as a file stem.
///
/// Separators, NUL and control characters, and a leading `.` become `_`.
/// Returns `None` when nothing usable is left.
pub fn sanitize_barcode(raw: &str) -> Option<String> {
    let mut stem: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .take(MAX_STEM_CHARS)
        .collect();

    if stem.starts_with('.') {
        stem.replace_range(..1, "_");
    }
    if stem.chars().all(|c| c == '_') {
        return None;
    }
    Some(stem)
}

/// Performs barcode renames and records them in the store and the log.
///
/// A target name is claimed by hard-linking the file to it, which fails
/// when the name is taken, and only then is the old name unlinked. An
/// existing file is never replaced.
#[derive(Debug, Clone)]
pub struct RenameCoordinator {
    store: Arc<HashStore>,
    log: Arc<ChangeLog>,
}

impl RenameCoordinator {
    pub fn new(store: Arc<HashStore>, log: Arc<ChangeLog>) -> Self {
        Self { store, log }
    }

    /// Rename `path` after `barcode` inside its own directory. `record` is
    /// the fingerprint of the file at `path`; a rename does not change it.
    pub async fn rename(
        &self,
        path: &Path,
        barcode: &str,
        record: &FingerprintRecord,
    ) -> RenameDecision {
        let Some(stem) = sanitize_barcode(barcode) else {
            warn!(path = %path.display(), barcode, "barcode is not usable as a file name");
            return RenameDecision::failed(path, "barcode has no usable characters");
        };
        let Some(dir) = path.parent() else {
            return RenameDecision::failed(path, "path has no parent directory");
        };
        let extension = path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();

        let (target, collision_resolved) =
            match claim_target(dir, path, &stem, &extension).await {
                Ok(Some(claimed)) => claimed,
                Ok(None) => {
                    error!(
                        path = %path.display(),
                        barcode = %stem,
                        "no free target name within {MAX_COLLISION_SUFFIX} candidates"
                    );
                    return RenameDecision::failed(path, "no free target name");
                }
                Err(err) => {
                    error!(path = %path.display(), error = %err, "rename failed");
                    return RenameDecision::failed(path, err.to_string());
                }
            };

        if target == path {
            info!(path = %path.display(), "file already carries its barcode name");
            return RenameDecision {
                source: path.to_path_buf(),
                target,
                collision_resolved,
                outcome: RenameOutcome::AlreadyNamed,
            };
        }

        if let Err(err) = tokio::fs::remove_file(path).await {
            error!(
                source = %path.display(),
                target = %target.display(),
                error = %err,
                "could not release old name; undoing rename"
            );
            if let Err(err) = tokio::fs::remove_file(&target).await {
                error!(target = %target.display(), error = %err, "failed to undo rename");
            }
            return RenameDecision {
                source: path.to_path_buf(),
                target,
                collision_resolved,
                outcome: RenameOutcome::Failed(err.to_string()),
            };
        }
        info!(
            source = %path.display(),
            target = %target.display(),
            collision_resolved,
            "renamed from barcode"
        );

        self.record_rename(path, &target, record);
        RenameDecision {
            source: path.to_path_buf(),
            target,
            collision_resolved,
            outcome: RenameOutcome::Renamed,
        }
    }

    fn record_rename(&self, source: &Path, target: &Path, record: &FingerprintRecord) {
        if let Err(err) = self.store.rename_key(source, target, record.clone()) {
            error!(error = %err, "failed to re-key hash store after rename");
        }
        let pair = ChangeLogEntry::moved_pair(source, target, record.digest);
        if let Err(err) = self.log.append_all(&pair) {
            error!(error = %err, "rename not recorded in change log");
        }
    }
}

/// Link `source` under the first name in `stem.ext`, `stem-2.ext`,
/// `stem-3.ext`... that is free, or stop at the name `source` already has.
/// Returns the claimed name and whether a suffix was needed.
async fn claim_target(
    dir: &Path,
    source: &Path,
    stem: &str,
    extension: &str,
) -> io::Result<Option<(PathBuf, bool)>> {
    for n in 1..=MAX_COLLISION_SUFFIX {
        let name = if n == 1 {
            format!("{stem}{extension}")
        } else {
            format!("{stem}-{n}{extension}")
        };
        let candidate = dir.join(name);
        if candidate == source {
            return Ok(Some((candidate, n > 1)));
        }
        match tokio::fs::hard_link(source, &candidate).await {
            Ok(()) => return Ok(Some((candidate, n > 1))),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(None)
}
