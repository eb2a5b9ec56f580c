//! Turns raw filesystem notifications into logical file events.
//!
//! Every raw event lands in a per-path pending entry whose deadline is
//! pushed out by the settle window on each new event. One timer, the
//! earliest deadline, drives the loop. When a deadline passes quietly the
//! entry is handed to a stabilization task that polls the file until it
//! stops growing; the loop keeps taking raw events and firing other
//! deadlines meanwhile. A new event for a path under stabilization aborts
//! the task and reopens the window.
//!
//! Moves are recovered two ways. OS renames arrive as a `MovedFrom` directly
//! followed by a `MovedTo` and are paired. Copy-and-delete moves arrive as an
//! unrelated delete and create. A settled creation is hashed and paired with
//! a pending delete whose last-known digest matches; due deletes wait (for a
//! bounded time) while creations are still settling.

mod pending;
mod stabilize;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace, warn};

use crate::hasher::{ContentHasher, Digest};
use crate::paths::{DEFAULT_TRANSIENT_SUFFIXES, PathPolicy};
use crate::retry::RetryPolicy;
use crate::store::{FingerprintRecord, HashStore};

use pending::{PendingChange, PendingEntry};
use stabilize::{Stability, stabilize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RawEventKind {
    Created,
    Modified,
    Deleted,
    MovedFrom,
    MovedTo,
}

/// One notification as reported by the watcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: RawEventKind,
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

impl RawEvent {
    pub fn new(kind: RawEventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Settled, deduplicated file event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogicalEvent {
    Created {
        path: PathBuf,
    },
    Modified {
        path: PathBuf,
    },
    Deleted {
        path: PathBuf,
    },
    /// `digest` is set when the debouncer already hashed the destination.
    Moved {
        from: PathBuf,
        to: PathBuf,
        digest: Option<Digest>,
    },
}

impl LogicalEvent {
    /// The path the event leaves the file at (the destination for moves).
    pub fn path(&self) -> &Path {
        match self {
            LogicalEvent::Created { path }
            | LogicalEvent::Modified { path }
            | LogicalEvent::Deleted { path } => path,
            LogicalEvent::Moved { to, .. } => to,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DebounceConfig {
    /// Quiet period after the last event for a path before it is finalized.
    pub settle_window: Duration,
    /// Interval between size/mtime polls while stabilizing.
    pub poll_interval: Duration,
    /// Give up waiting for a file to settle after this long.
    pub stabilize_timeout: Duration,
    pub transient_suffixes: Vec<String>,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            settle_window: Duration::from_millis(300),
            poll_interval: Duration::from_millis(100),
            stabilize_timeout: Duration::from_secs(10),
            transient_suffixes: DEFAULT_TRANSIENT_SUFFIXES
                .iter()
                .map(|suffix| suffix.to_string())
                .collect(),
        }
    }
}

/// Read access to last-known fingerprints.
pub trait FingerprintSource: Send + Sync {
    fn last_known(&self, path: &Path) -> Option<FingerprintRecord>;

    /// Every path with a fingerprint.
    fn known(&self) -> Vec<(PathBuf, FingerprintRecord)>;
}

impl FingerprintSource for HashStore {
    fn last_known(&self, path: &Path) -> Option<FingerprintRecord> {
        self.get(path)
    }

    fn known(&self) -> Vec<(PathBuf, FingerprintRecord)> {
        self.snapshot()
            .into_iter()
            .map(|(key, record)| (PathBuf::from(key), record))
            .collect()
    }
}

/// Debouncer-side view of a file in the active set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchedFile {
    pub path: PathBuf,
    pub fingerprint: Option<Digest>,
    pub size: Option<u64>,
    pub last_seen: Option<DateTime<Utc>>,
    pub pending_stabilization: bool,
}

impl WatchedFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            fingerprint: None,
            size: None,
            last_seen: None,
            pending_stabilization: false,
        }
    }

    fn from_record(path: PathBuf, record: &FingerprintRecord) -> Self {
        Self {
            fingerprint: Some(record.digest),
            size: Some(record.size),
            last_seen: Some(record.recorded_at),
            ..Self::new(path)
        }
    }
}

/// Result of one background stabilization.
struct Settled {
    path: PathBuf,
    generation: u64,
    stability: Stability,
    /// Digest and size once settled; only taken for creations.
    fingerprint: Option<(Digest, u64)>,
}

/// An entry whose stabilization task is running.
struct InFlight {
    change: PendingChange,
    seq: u64,
    generation: u64,
    handle: AbortHandle,
}

/// The scheduling core between the watcher and the pipeline.
pub struct EventDebouncer {
    config: DebounceConfig,
    policy: PathPolicy,
    stabilize_policy: RetryPolicy,
    source: Arc<dyn FingerprintSource>,
    hasher: ContentHasher,
    watched: HashMap<PathBuf, WatchedFile>,
    pending: HashMap<PathBuf, PendingEntry>,
    in_flight: HashMap<PathBuf, InFlight>,
    settling: JoinSet<Settled>,
    last_moved_from: Option<PathBuf>,
    next_seq: u64,
    next_generation: u64,
}

impl std::fmt::Debug for EventDebouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDebouncer")
            .field("config", &self.config)
            .field("watched", &self.watched.len())
            .field("pending", &self.pending.len())
            .field("stabilizing", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl EventDebouncer {
    /// Build a debouncer whose active set is seeded from `source`.
    pub fn new(
        config: DebounceConfig,
        source: Arc<dyn FingerprintSource>,
        hasher: ContentHasher,
    ) -> Self {
        let watched = source
            .known()
            .into_iter()
            .map(|(path, record)| {
                (path.clone(), WatchedFile::from_record(path, &record))
            })
            .collect();
        Self {
            policy: PathPolicy::new(config.transient_suffixes.iter().cloned()),
            stabilize_policy: RetryPolicy::polling(
                config.poll_interval,
                config.stabilize_timeout,
            ),
            config,
            source,
            hasher,
            watched,
            pending: HashMap::new(),
            in_flight: HashMap::new(),
            settling: JoinSet::new(),
            last_moved_from: None,
            next_seq: 0,
            next_generation: 0,
        }
    }

    pub fn watched(&self, path: &Path) -> Option<&WatchedFile> {
        self.watched.get(path)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Consume `rx` until it closes, emitting logical events on `tx`.
    /// Pending entries are flushed (still stabilized) once the input closes.
    pub async fn run(
        mut self,
        mut rx: Receiver<RawEvent>,
        tx: Sender<LogicalEvent>,
    ) {
        loop {
            let next = self.next_deadline();
            tokio::select! {
                biased;

                Some(joined) = self.settling.join_next(), if !self.settling.is_empty() => {
                    if !self.on_settled(joined, &tx).await {
                        debug!("logical event receiver dropped; stopping debouncer");
                        return;
                    }
                }
                _ = wait_until(next) => {
                    if !self.flush_due(&tx).await {
                        debug!("logical event receiver dropped; stopping debouncer");
                        return;
                    }
                }
                raw = rx.recv() => match raw {
                    Some(raw) => self.intake(raw),
                    None => {
                        debug!(
                            pending = self.pending.len(),
                            stabilizing = self.in_flight.len(),
                            "raw events closed; flushing"
                        );
                        self.drain(&tx).await;
                        return;
                    }
                },
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|entry| entry.deadline).min()
    }

    fn is_known(&self, path: &Path) -> bool {
        self.watched.contains_key(path) || self.source.last_known(path).is_some()
    }

    /// Last-known digest and size of `path`, preferring the store.
    fn known_fingerprint(&self, path: &Path) -> Option<(Digest, u64)> {
        if let Some(record) = self.source.last_known(path) {
            return Some((record.digest, record.size));
        }
        let watched = self.watched.get(path)?;
        Some((watched.fingerprint?, watched.size?))
    }

    fn intake(&mut self, raw: RawEvent) {
        trace!(kind = ?raw.kind, path = %raw.path.display(), "raw event");
        // Pairing only holds for a MovedTo that directly follows its MovedFrom.
        let moved_from = self.last_moved_from.take();

        if self.policy.is_transient(&raw.path) {
            trace!(path = %raw.path.display(), "ignoring transient path");
            return;
        }

        self.recall(&raw.path);
        if let Some(watched) = self.watched.get_mut(&raw.path) {
            watched.last_seen = Some(raw.timestamp);
            watched.pending_stabilization = true;
        }

        match raw.kind {
            RawEventKind::MovedTo => {
                if let Some(origin) = moved_from
                    && let Some(entry) = self.pending.remove(&origin)
                {
                    if let PendingChange::MovedFrom { prior } = entry.change {
                        let change = PendingChange::arrived(
                            prior.map(|prior| *prior),
                            origin,
                            &raw.path,
                        );
                        self.schedule(raw.path, change);
                        return;
                    }
                    self.pending.insert(origin, entry);
                }
                self.record_creation(raw.path, RawEventKind::MovedTo);
            }
            RawEventKind::Created => {
                self.record_creation(raw.path, RawEventKind::Created);
            }
            RawEventKind::Modified => {
                let change = match self.pending.remove(&raw.path) {
                    Some(entry) => entry.change.absorb(RawEventKind::Modified),
                    None => PendingChange::Modified,
                };
                self.schedule(raw.path, change);
            }
            RawEventKind::MovedFrom => {
                let change = match self.pending.remove(&raw.path) {
                    Some(entry) => entry.change.absorb(RawEventKind::MovedFrom),
                    None => PendingChange::MovedFrom { prior: None },
                };
                if matches!(change, PendingChange::MovedFrom { .. }) {
                    self.last_moved_from = Some(raw.path.clone());
                }
                self.schedule(raw.path, change);
            }
            RawEventKind::Deleted => self.record_deletion(raw.path),
        }
    }

    /// Pull `path` back out of stabilization: the file is still changing.
    fn recall(&mut self, path: &Path) {
        let Some(flight) = self.in_flight.remove(path) else {
            return;
        };
        flight.handle.abort();
        trace!(path = %path.display(), "event during stabilization; reopening window");
        self.pending.insert(
            path.to_path_buf(),
            PendingEntry {
                change: flight.change,
                deadline: Instant::now() + self.config.settle_window,
                seq: flight.seq,
                held_since: None,
            },
        );
    }

    /// Creations of known paths stay creations here; whether the content is
    /// new is decided after stabilization.
    fn record_creation(&mut self, path: PathBuf, kind: RawEventKind) {
        let change = match self.pending.remove(&path) {
            Some(entry) => entry.change.absorb(kind),
            None => PendingChange::Created,
        };
        self.schedule(path, change);
    }

    fn record_deletion(&mut self, path: PathBuf) {
        let change = match self.pending.remove(&path) {
            Some(PendingEntry {
                change: PendingChange::MovedIn { from },
                ..
            }) => {
                // A→B then B deleted: what disappeared is A's file.
                let target = if self.pending.contains_key(&from) {
                    path
                } else {
                    from
                };
                self.schedule(target, PendingChange::Deleted);
                return;
            }
            Some(entry) => entry.change.absorb(RawEventKind::Deleted),
            None if self.is_known(&path) => PendingChange::Deleted,
            None => {
                trace!(path = %path.display(), "ignoring delete of untracked path");
                return;
            }
        };
        self.schedule(path, change);
    }

    /// Insert or refresh the pending entry for `path`, pushing its deadline
    /// out by the settle window.
    fn schedule(&mut self, path: PathBuf, change: PendingChange) {
        let deadline = Instant::now() + self.config.settle_window;
        let seq = match self.pending.get(&path) {
            Some(existing) => existing.seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        self.pending.insert(
            path,
            PendingEntry {
                change,
                deadline,
                seq,
                held_since: None,
            },
        );
    }

    /// Act on every entry whose deadline has passed: settle-bound entries
    /// start stabilizing, departures are emitted unless a creation that may
    /// claim them is still outstanding. Returns false once the output
    /// receiver is gone.
    async fn flush_due(&mut self, tx: &Sender<LogicalEvent>) -> bool {
        let now = Instant::now();
        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        let (settling, departures) = self.take_sorted(due);

        for (path, entry) in settling {
            self.start_settle(path, entry);
        }
        for (path, entry) in departures {
            if self.should_hold(&path, &entry, now) {
                let held_since = entry.held_since.unwrap_or(now);
                self.pending.insert(
                    path,
                    PendingEntry {
                        deadline: now + self.hold_interval(),
                        held_since: Some(held_since),
                        ..entry
                    },
                );
                continue;
            }
            if !self.emit_departure(path, entry.change, tx).await {
                return false;
            }
        }
        true
    }

    /// Input closed: settle everything still pending, wait for every
    /// stabilization, then emit what is left.
    async fn drain(&mut self, tx: &Sender<LogicalEvent>) {
        let all: Vec<PathBuf> = self.pending.keys().cloned().collect();
        let (settling, departures) = self.take_sorted(all);
        for (path, entry) in settling {
            self.start_settle(path, entry);
        }
        self.pending.extend(departures);

        while let Some(joined) = self.settling.join_next().await {
            if !self.on_settled(joined, tx).await {
                return;
            }
        }

        // Only entries whose task died without reporting are left here.
        let stranded: Vec<(PathBuf, InFlight)> = self.in_flight.drain().collect();
        for (path, flight) in stranded {
            let event = self.conclude(path, flight.change, Stability::Unsettled, None);
            if !self.emit(event, tx).await {
                return;
            }
        }

        let rest: Vec<PathBuf> = self.pending.keys().cloned().collect();
        let (_, departures) = self.take_sorted(rest);
        for (path, entry) in departures {
            if !self.emit_departure(path, entry.change, tx).await {
                return;
            }
        }
    }

    /// Remove `paths` from the pending table in deadline order, split into
    /// entries that need stabilization and departures.
    fn take_sorted(
        &mut self,
        paths: Vec<PathBuf>,
    ) -> (Vec<(PathBuf, PendingEntry)>, Vec<(PathBuf, PendingEntry)>) {
        let mut entries: Vec<(PathBuf, PendingEntry)> = paths
            .into_iter()
            .filter_map(|path| {
                let entry = self.pending.remove(&path)?;
                Some((path, entry))
            })
            .collect();
        entries.sort_by_key(|(_, entry)| (entry.deadline, entry.seq));
        entries
            .into_iter()
            .partition(|(_, entry)| entry.change.needs_settle())
    }

    fn start_settle(&mut self, path: PathBuf, entry: PendingEntry) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let policy = self.stabilize_policy;
        let hasher = self.hasher.clone();
        let wants_digest = entry.change == PendingChange::Created;
        let task_path = path.clone();

        let handle = self.settling.spawn(async move {
            let stability = stabilize(&task_path, &policy).await;
            let fingerprint = if wants_digest && stability != Stability::Vanished {
                hasher.probe(&task_path).await.ok()
            } else {
                None
            };
            Settled {
                path: task_path,
                generation,
                stability,
                fingerprint,
            }
        });

        self.in_flight.insert(
            path,
            InFlight {
                change: entry.change,
                seq: entry.seq,
                generation,
                handle,
            },
        );
    }

    async fn on_settled(
        &mut self,
        joined: Result<Settled, JoinError>,
        tx: &Sender<LogicalEvent>,
    ) -> bool {
        let settled = match joined {
            Ok(settled) => settled,
            Err(err) if err.is_cancelled() => return true,
            Err(err) => {
                warn!(error = %err, "stabilization task failed");
                return true;
            }
        };
        // A result from an aborted or superseded task.
        match self.in_flight.get(&settled.path) {
            Some(flight) if flight.generation == settled.generation => {}
            _ => return true,
        }
        let Some(flight) = self.in_flight.remove(&settled.path) else {
            return true;
        };

        let path = settled.path.clone();
        let event = self.conclude(
            settled.path,
            flight.change,
            settled.stability,
            settled.fingerprint,
        );
        if !self.emit(event, tx).await {
            return false;
        }
        if let Some((digest, size)) = settled.fingerprint
            && let Some(watched) = self.watched.get_mut(&path)
        {
            watched.fingerprint = Some(digest);
            watched.size = Some(size);
        }
        true
    }

    /// Decide the logical event for an entry that finished stabilizing.
    fn conclude(
        &mut self,
        path: PathBuf,
        change: PendingChange,
        stability: Stability,
        fingerprint: Option<(Digest, u64)>,
    ) -> LogicalEvent {
        if stability == Stability::Unsettled {
            warn!(
                path = %path.display(),
                timeout_ms = self.config.stabilize_timeout.as_millis() as u64,
                "file still changing after stabilization timeout; emitting anyway"
            );
        }

        match change {
            PendingChange::MovedIn { from } => match stability {
                Stability::Vanished => LogicalEvent::Deleted { path: from },
                _ => LogicalEvent::Moved {
                    from,
                    to: path,
                    digest: None,
                },
            },
            _ if stability == Stability::Vanished => LogicalEvent::Deleted { path },
            PendingChange::Created => {
                let Some((digest, size)) = fingerprint else {
                    return LogicalEvent::Created { path };
                };
                if let Some(origin) = self.claim_departure(&path, &digest, size) {
                    debug!(
                        from = %origin.display(),
                        to = %path.display(),
                        "matched creation to deleted file by digest"
                    );
                    return LogicalEvent::Moved {
                        from: origin,
                        to: path,
                        digest: Some(digest),
                    };
                }
                match self.known_fingerprint(&path) {
                    Some((known, _)) if known == digest => {
                        LogicalEvent::Modified { path }
                    }
                    _ => LogicalEvent::Created { path },
                }
            }
            PendingChange::Modified => LogicalEvent::Modified { path },
            PendingChange::Deleted | PendingChange::MovedFrom { .. } => {
                LogicalEvent::Deleted { path }
            }
        }
    }

    /// Take the oldest pending departure whose last-known content is
    /// `digest`/`size`, if any.
    fn claim_departure(
        &mut self,
        path: &Path,
        digest: &Digest,
        size: u64,
    ) -> Option<PathBuf> {
        let (_, origin) = self
            .pending
            .iter()
            .filter(|(origin, entry)| {
                entry.change.is_departure() && origin.as_path() != path
            })
            .filter(|(origin, _)| {
                self.known_fingerprint(origin)
                    .is_some_and(|(known, known_size)| {
                        known == *digest && known_size == size
                    })
            })
            .map(|(origin, entry)| (entry.seq, origin.clone()))
            .min()?;

        self.pending.remove(&origin);
        if self.last_moved_from.as_deref() == Some(origin.as_path()) {
            self.last_moved_from = None;
        }
        Some(origin)
    }

    /// A due departure of a known file waits while some creation could
    /// still turn out to carry its content, up to one settle window plus
    /// the stabilization timeout.
    fn should_hold(&self, path: &Path, entry: &PendingEntry, now: Instant) -> bool {
        if !entry.change.is_departure() || self.known_fingerprint(path).is_none() {
            return false;
        }
        let creation_outstanding = self
            .pending
            .values()
            .any(|entry| entry.change == PendingChange::Created)
            || self
                .in_flight
                .values()
                .any(|flight| flight.change == PendingChange::Created);
        let limit = entry.held_since.unwrap_or(now)
            + self.config.settle_window
            + self.config.stabilize_timeout;
        creation_outstanding && now < limit
    }

    fn hold_interval(&self) -> Duration {
        self.config.poll_interval.max(Duration::from_millis(1))
    }

    async fn emit_departure(
        &mut self,
        path: PathBuf,
        change: PendingChange,
        tx: &Sender<LogicalEvent>,
    ) -> bool {
        if self.last_moved_from.as_deref() == Some(path.as_path()) {
            self.last_moved_from = None;
        }
        let event = match change {
            PendingChange::MovedFrom { prior } => match prior.as_deref() {
                Some(PendingChange::Created) => {
                    debug!(
                        path = %path.display(),
                        "created file left the tree before settling"
                    );
                    return true;
                }
                None if !self.is_known(&path) => {
                    trace!(path = %path.display(), "untracked path moved out");
                    return true;
                }
                _ => LogicalEvent::Deleted { path },
            },
            _ => LogicalEvent::Deleted { path },
        };
        self.emit(event, tx).await
    }

    async fn emit(&mut self, event: LogicalEvent, tx: &Sender<LogicalEvent>) -> bool {
        self.track(&event);
        tx.send(event).await.is_ok()
    }

    /// Keep the active set in step with what was emitted.
    fn track(&mut self, event: &LogicalEvent) {
        match event {
            LogicalEvent::Created { path } | LogicalEvent::Modified { path } => {
                let watched = self
                    .watched
                    .entry(path.clone())
                    .or_insert_with(|| WatchedFile::new(path.clone()));
                watched.last_seen = Some(Utc::now());
                watched.pending_stabilization = false;
            }
            LogicalEvent::Deleted { path } => {
                self.watched.remove(path);
            }
            LogicalEvent::Moved { from, to, digest } => {
                let mut watched = self
                    .watched
                    .remove(from)
                    .unwrap_or_else(|| WatchedFile::new(to.clone()));
                watched.path = to.clone();
                if digest.is_some() {
                    watched.fingerprint = *digest;
                }
                watched.last_seen = Some(Utc::now());
                watched.pending_stabilization = false;
                self.watched.insert(to.clone(), watched);
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
