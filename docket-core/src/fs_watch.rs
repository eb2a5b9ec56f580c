//! Adapter from `notify` to the raw event channel.
//!
//! The watcher thread converts each notification into zero or more
//! [`RawEvent`]s and pushes them with `blocking_send`, so a slow consumer
//! applies backpressure to the watcher instead of growing a queue.

use std::fmt;
use std::path::{Path, PathBuf};

use notify::event::{
    CreateKind, EventKind, MetadataKind, ModifyKind, RemoveKind, RenameMode,
};
use notify::{
    Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher,
};
use tokio::sync::mpsc;
use tracing::{info, trace, warn};

use crate::debounce::{RawEvent, RawEventKind};
use crate::error::{DocketError, Result};
use crate::paths::resolve_within;

/// Recursive watch on one root. Dropping the service stops the watcher and
/// releases its sender, which eventually closes the raw channel.
pub struct FsWatchService {
    root: PathBuf,
    watcher: Option<RecommendedWatcher>,
}

impl fmt::Debug for FsWatchService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsWatchService")
            .field("root", &self.root)
            .field("active", &self.watcher.is_some())
            .finish()
    }
}

impl FsWatchService {
    pub fn start(root: &Path, tx: mpsc::Sender<RawEvent>) -> Result<Self> {
        let watch_root = root.to_path_buf();
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    for raw in convert_event(&event, &watch_root) {
                        if let Err(err) = tx.blocking_send(raw) {
                            warn!(
                                "fs_watch channel send failed for {}: {}",
                                watch_root.display(),
                                err
                            );
                            return;
                        }
                    }
                }
                Err(err) => {
                    warn!(root = %watch_root.display(), error = %err, "watcher error");
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|err| {
            DocketError::Watch(format!(
                "failed to create watcher for {}: {}",
                root.display(),
                err
            ))
        })?;

        watcher.watch(root, RecursiveMode::Recursive).map_err(|err| {
            DocketError::Watch(format!("failed to watch {}: {}", root.display(), err))
        })?;

        info!(root = %root.display(), recursive = true, "watching for file changes");

        Ok(Self {
            root: root.to_path_buf(),
            watcher: Some(watcher),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            info!(root = %self.root.display(), "watcher stopped");
        }
    }
}

impl Drop for FsWatchService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Raw events for one notification. Paths outside `root` are dropped.
pub(crate) fn convert_event(event: &Event, root: &Path) -> Vec<RawEvent> {
    let within = |path: &PathBuf| resolve_within(root, path);
    let first = event.paths.first().and_then(within);

    let raw = |kind: RawEventKind, path: PathBuf| vec![RawEvent::new(kind, path)];

    match (&event.kind, first) {
        (EventKind::Create(CreateKind::Folder), _) => Vec::new(),
        (EventKind::Create(_), Some(path)) => {
            if path.is_dir() {
                Vec::new()
            } else {
                raw(RawEventKind::Created, path)
            }
        }

        (EventKind::Modify(ModifyKind::Name(RenameMode::From)), Some(path)) => {
            raw(RawEventKind::MovedFrom, path)
        }
        (EventKind::Modify(ModifyKind::Name(RenameMode::To)), Some(path)) => {
            raw(RawEventKind::MovedTo, path)
        }
        // Backends reporting `Both` have already reported `From` and `To`.
        (EventKind::Modify(ModifyKind::Name(RenameMode::Both)), _) => Vec::new(),
        (EventKind::Modify(ModifyKind::Name(_)), Some(path)) => {
            if path.exists() {
                raw(RawEventKind::MovedTo, path)
            } else {
                raw(RawEventKind::MovedFrom, path)
            }
        }
        (
            EventKind::Modify(
                ModifyKind::Data(_)
                | ModifyKind::Any
                | ModifyKind::Other
                | ModifyKind::Metadata(MetadataKind::WriteTime),
            ),
            Some(path),
        ) => {
            if path.is_dir() {
                Vec::new()
            } else {
                raw(RawEventKind::Modified, path)
            }
        }

        (EventKind::Remove(RemoveKind::Folder), _) => Vec::new(),
        (EventKind::Remove(_), Some(path)) => raw(RawEventKind::Deleted, path),

        (EventKind::Other, _) => {
            warn!(
                root = %root.display(),
                "watcher reported an unclassified event; changes may have been missed"
            );
            Vec::new()
        }
        (kind, _) => {
            trace!(?kind, paths = ?event.paths, "ignoring notification");
            Vec::new()
        }
    }
}
