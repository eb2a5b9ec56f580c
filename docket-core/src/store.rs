//! Durable path → fingerprint mapping.
//!
//! The store lives in a single, human-readable JSON document. Every mutation
//! rewrites the whole document through a sibling temp file that is fsynced
//! and renamed over the previous version, so a reader (or a crash) only ever
//! observes a complete old or a complete new state.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{DocketError, Result};
use crate::hasher::Digest;
use crate::paths::path_key;

/// What the store remembers about one file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub digest: Digest,
    pub size: u64,
    pub recorded_at: DateTime<Utc>,
}

impl FingerprintRecord {
    pub fn new(digest: Digest, size: u64) -> Self {
        Self {
            digest,
            size,
            recorded_at: Utc::now(),
        }
    }
}

/// Full store contents, keyed by canonical path string.
pub type Snapshot = BTreeMap<String, FingerprintRecord>;

/// Single-writer, atomically persisted hash store.
#[derive(Debug)]
pub struct HashStore {
    path: PathBuf,
    records: Mutex<Snapshot>,
}

impl HashStore {
    /// Open (or create) the store at `path`.
    ///
    /// A missing file yields an empty store. An unparsable file also yields
    /// an empty store; the unreadable document is preserved next to it as
    /// `<name>.corrupt-<unix-ts>`. Failing to write the location is fatal.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| {
                DocketError::StoreWrite {
                    path: path.clone(),
                    source,
                }
            })?;
        }

        let (records, needs_write) = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Snapshot>(&contents) {
                Ok(records) => {
                    info!(
                        path = %path.display(),
                        entries = records.len(),
                        "loaded hash store"
                    );
                    (records, false)
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "hash store is unreadable; starting empty"
                    );
                    preserve_corrupt(&path);
                    (Snapshot::new(), true)
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no hash store yet; starting empty");
                (Snapshot::new(), true)
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read hash store; starting empty"
                );
                (Snapshot::new(), true)
            }
        };

        // Writing up front surfaces an unwritable location at startup rather
        // than on the first event.
        if needs_write {
            persist(&path, &records)?;
        }

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, path: &Path) -> Option<FingerprintRecord> {
        self.lock().get(&path_key(path)).cloned()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().contains_key(&path_key(path))
    }

    /// True when `path` is unknown or its recorded digest differs.
    pub fn is_changed(&self, path: &Path, digest: &Digest) -> bool {
        self.lock()
            .get(&path_key(path))
            .is_none_or(|record| record.digest != *digest)
    }

    pub fn put(&self, path: &Path, record: FingerprintRecord) -> Result<()> {
        self.mutate(|records| {
            records.insert(path_key(path), record);
        })
    }

    /// Remove `path`, returning its last record. Absent paths do not touch
    /// the file on disk.
    pub fn remove(&self, path: &Path) -> Result<Option<FingerprintRecord>> {
        let key = path_key(path);
        let mut guard = self.lock();
        if !guard.contains_key(&key) {
            return Ok(None);
        }
        let mut next = guard.clone();
        let removed = next.remove(&key);
        persist(&self.path, &next)?;
        *guard = next;
        Ok(removed)
    }

    /// Move the record from `from` to `to` in one write, storing `record`
    /// under the new key. Returns the record previously held by `from`.
    pub fn rename_key(
        &self,
        from: &Path,
        to: &Path,
        record: FingerprintRecord,
    ) -> Result<Option<FingerprintRecord>> {
        let mut previous = None;
        self.mutate(|records| {
            previous = records.remove(&path_key(from));
            records.insert(path_key(to), record);
        })?;
        Ok(previous)
    }

    /// Re-key every record below the directory `from` to sit below `to`.
    /// Returns the `(old, new)` path pairs that moved.
    pub fn rename_prefix(
        &self,
        from: &Path,
        to: &Path,
    ) -> Result<Vec<(PathBuf, PathBuf, FingerprintRecord)>> {
        let mut moved = Vec::new();
        self.mutate(|records| {
            let keys: Vec<String> = records
                .keys()
                .filter(|key| {
                    let candidate = Path::new(key.as_str());
                    candidate != from && candidate.starts_with(from)
                })
                .cloned()
                .collect();
            for key in keys {
                let old = PathBuf::from(&key);
                let Ok(rel) = old.strip_prefix(from) else {
                    continue;
                };
                let new = to.join(rel);
                if let Some(record) = records.remove(&key) {
                    records.insert(path_key(&new), record.clone());
                    moved.push((old, new, record));
                }
            }
        })?;
        Ok(moved)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Apply `change` to a copy of the records, persist the copy, and only
    /// then make it the in-memory state.
    fn mutate<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Snapshot),
    {
        let mut guard = self.lock();
        let mut next = guard.clone();
        change(&mut next);
        persist(&self.path, &next)?;
        *guard = next;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Snapshot> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Atomically replace `path` with the JSON rendering of `records`.
fn persist(path: &Path, records: &Snapshot) -> Result<()> {
    let to_store_err = |source: io::Error| DocketError::StoreWrite {
        path: path.to_path_buf(),
        source,
    };

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let body = serde_json::to_vec_pretty(records)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(to_store_err)?;
    tmp.write_all(&body).map_err(to_store_err)?;
    tmp.write_all(b"\n").map_err(to_store_err)?;
    tmp.flush().map_err(to_store_err)?;
    tmp.as_file().sync_all().map_err(to_store_err)?;
    tmp.persist(path).map_err(|err| to_store_err(err.error))?;

    // Best-effort fsync of the directory so the rename itself is durable.
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }

    debug!(path = %path.display(), entries = records.len(), "hash store written");
    Ok(())
}

fn preserve_corrupt(path: &Path) {
    let Some(name) = path.file_name() else {
        return;
    };
    let mut backup_name = name.to_os_string();
    backup_name.push(format!(".corrupt-{}", Utc::now().timestamp()));
    let backup = path.with_file_name(backup_name);
    match fs::copy(path, &backup) {
        Ok(_) => warn!(
            backup = %backup.display(),
            "preserved unreadable hash store"
        ),
        Err(err) => warn!(
            backup = %backup.display(),
            error = %err,
            "failed to preserve unreadable hash store"
        ),
    }
}
