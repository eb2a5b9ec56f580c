use std::path::PathBuf;

use tokio::time::Instant;

use super::RawEventKind;

/// What a path's buffered events add up to so far.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum PendingChange {
    Created,
    Modified,
    Deleted,
    /// Left via an OS rename; waiting for the matching `MovedTo`. `prior` is
    /// what was pending for the path before it moved away.
    MovedFrom {
        prior: Option<Box<PendingChange>>,
    },
    /// Arrived from `from` by an OS rename.
    MovedIn { from: PathBuf },
}

impl PendingChange {
    /// Fold a later raw event for the same path into this change.
    ///
    /// `MovedTo` is only seen here when it could not be paired and therefore
    /// counts as a creation. Callers handle `MovedIn` + `Deleted` themselves
    /// because it may move the entry back to the origin path.
    pub(crate) fn absorb(self, kind: RawEventKind) -> PendingChange {
        use PendingChange as P;
        use RawEventKind as R;

        match (self, kind) {
            (P::Created, R::Created | R::Modified | R::MovedTo) => P::Created,
            (P::Created, R::Deleted) => P::Deleted,
            (P::Created, R::MovedFrom) => P::MovedFrom {
                prior: Some(Box::new(P::Created)),
            },

            (P::Modified, R::Created | R::Modified | R::MovedTo) => P::Modified,
            (P::Modified, R::Deleted) => P::Deleted,
            (P::Modified, R::MovedFrom) => P::MovedFrom {
                prior: Some(Box::new(P::Modified)),
            },

            // Replaced in place. Whether the new file counts as a creation
            // is decided once its digest is known.
            (P::Deleted, R::Created | R::MovedTo) => P::Created,
            (P::Deleted, R::Modified) => P::Modified,
            (P::Deleted, R::Deleted | R::MovedFrom) => P::Deleted,

            (P::MovedFrom { .. }, R::Created | R::MovedTo) => P::Created,
            (P::MovedFrom { .. }, R::Modified) => P::Modified,
            (moved @ P::MovedFrom { .. }, R::Deleted | R::MovedFrom) => moved,

            (moved @ P::MovedIn { .. }, R::Created | R::Modified | R::MovedTo) => {
                moved
            }
            (P::MovedIn { .. }, R::Deleted) => P::Deleted,
            (moved @ P::MovedIn { .. }, R::MovedFrom) => P::MovedFrom {
                prior: Some(Box::new(moved)),
            },
        }
    }

    /// State for the destination of a paired OS rename whose origin had
    /// `prior` pending. `origin` is the path the rename left.
    pub(crate) fn arrived(
        prior: Option<PendingChange>,
        origin: PathBuf,
        destination: &std::path::Path,
    ) -> PendingChange {
        match prior {
            Some(PendingChange::Created) => PendingChange::Created,
            Some(PendingChange::MovedIn { from }) if from == destination => {
                PendingChange::Modified
            }
            Some(PendingChange::MovedIn { from }) => PendingChange::MovedIn { from },
            _ => PendingChange::MovedIn { from: origin },
        }
    }

    /// Entries that are polled for stability before they are emitted.
    pub(crate) fn needs_settle(&self) -> bool {
        matches!(
            self,
            PendingChange::Created | PendingChange::Modified | PendingChange::MovedIn { .. }
        )
    }

    /// Entries that end as the disappearance of the file at their path,
    /// which makes that file a candidate origin for a copy-and-delete move.
    pub(crate) fn is_departure(&self) -> bool {
        match self {
            PendingChange::Deleted => true,
            PendingChange::MovedFrom { prior } => {
                !matches!(prior.as_deref(), Some(PendingChange::Created))
            }
            _ => false,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct PendingEntry {
    pub change: PendingChange,
    pub deadline: Instant,
    /// Arrival order of the entry's first event.
    pub seq: u64,
    /// Set while a due departure waits for pending creations to settle.
    pub held_since: Option<Instant>,
}
