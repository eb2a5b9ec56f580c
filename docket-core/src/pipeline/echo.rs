use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

use crate::hasher::Digest;

/// A rename the pipeline performed itself, waiting for the watcher to report
/// it back.
#[derive(Debug, Clone)]
struct Echo {
    source: PathBuf,
    target: PathBuf,
    digest: Digest,
    expires_at: Instant,
    source_seen: bool,
    target_seen: bool,
}

/// Short-lived memory of our own renames so their notifications are not
/// processed as user activity.
#[derive(Debug)]
pub(crate) struct EchoJournal {
    ttl: Duration,
    entries: Vec<Echo>,
}

impl EchoJournal {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, source: &Path, target: &Path, digest: Digest) {
        self.purge();
        self.entries.push(Echo {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            digest,
            expires_at: Instant::now() + self.ttl,
            source_seen: false,
            target_seen: false,
        });
    }

    /// The watcher paired our rename into a single move.
    pub(crate) fn consume_move(&mut self, from: &Path, to: &Path) -> bool {
        self.purge();
        let Some(index) = self
            .entries
            .iter()
            .position(|echo| echo.source == from && echo.target == to)
        else {
            return false;
        };
        self.entries.remove(index);
        true
    }

    /// The source half of a rename reported on its own.
    pub(crate) fn consume_delete(&mut self, path: &Path) -> bool {
        self.purge();
        let Some(echo) = self
            .entries
            .iter_mut()
            .find(|echo| !echo.source_seen && echo.source == path)
        else {
            return false;
        };
        echo.source_seen = true;
        self.retire();
        true
    }

    /// The target half of a rename reported on its own. Only consumed while
    /// the content is still what we renamed.
    pub(crate) fn consume_arrival(&mut self, path: &Path, digest: &Digest) -> bool {
        self.purge();
        let Some(echo) = self
            .entries
            .iter_mut()
            .find(|echo| !echo.target_seen && echo.target == path)
        else {
            return false;
        };
        if echo.digest != *digest {
            return false;
        }
        echo.target_seen = true;
        self.retire();
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn purge(&mut self) {
        let now = Instant::now();
        self.entries.retain(|echo| echo.expires_at > now);
    }

    fn retire(&mut self) {
        self.entries
            .retain(|echo| !(echo.source_seen && echo.target_seen));
    }
}
