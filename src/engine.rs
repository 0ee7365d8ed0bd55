//! Seam to the underlying persistent-snapshot database engine.

use std::fmt::Debug;

use crate::data::{Domain, Effects, IdMapping, Lid, LidAlloc, Novelty};
use crate::instruction::Instruction;

/// Outcome of a failed [`SnapshotEngine::apply`].
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// The change's assumptions no longer hold against this base, e.g. a
    /// referenced entity was concurrently retracted.
    ///
    /// This is the soft-conflict signal: the caller is expected to fall
    /// back to full reconsideration rather than treat it as an error.
    #[error("assumptions violated: {0}")]
    AssumptionsViolated(String),
    /// Any other failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ApplyError {
    /// Whether this is the recoverable soft-conflict signal.
    pub fn is_soft(&self) -> bool {
        matches!(self, ApplyError::AssumptionsViolated(_))
    }
}

/// Result bundle of a successful apply.
#[derive(Debug, Clone)]
pub struct Applied<S> {
    /// The new snapshot.
    pub snapshot: S,
    /// Facts produced by the change.
    pub novelty: Novelty,
    /// Side effects produced by the change.
    pub effects: Effects,
    /// Local-to-global bindings created by GID-defining asserts.
    pub id_mapping: IdMapping,
}

/// The snapshot database this crate rebases on top of.
///
/// Snapshots are immutable values: `apply` never mutates its base, it
/// produces a successor. Equality of snapshots must be cheap, since the
/// replay fast path compares bases on every rebase round.
pub trait SnapshotEngine: Clone + Debug + Send + 'static {
    /// The immutable, versioned snapshot type.
    type Snapshot: Clone + PartialEq + Debug + Send + 'static;

    /// Apply `instructions` to `base`, producing a successor snapshot plus
    /// the novelty, effects, and id bindings of the change.
    fn apply(
        &self,
        base: &Self::Snapshot,
        instructions: &[Instruction],
    ) -> Result<Applied<Self::Snapshot>, ApplyError>;

    /// Restrict `base` to the entities of one domain.
    fn select_domain(&self, base: &Self::Snapshot, domain: Domain) -> Self::Snapshot;

    /// The committed local-to-global bindings visible in `base`.
    fn id_mapping(&self, base: &Self::Snapshot) -> IdMapping;

    /// The allocator for fresh local ids, shared with codecs.
    fn lid_alloc(&self) -> LidAlloc;

    /// Mint a fresh local id.
    fn new_lid(&self) -> Lid {
        self.lid_alloc().next()
    }
}
