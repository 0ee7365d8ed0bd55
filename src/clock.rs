//! Logical clock for ordering a replica's outgoing transactions.

use std::collections::BTreeMap;

use crate::transaction::ReplicaId;

/// Clock misuse.
#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    /// [`LogicalClock::tick`] was called for an origin that was never
    /// registered.
    #[error("clock not initialized for origin {0}")]
    Uninitialized(ReplicaId),
}

/// Strictly monotonic per-origin tick counter.
///
/// An explicit value owned by the orchestration layer and passed to log
/// operations as needed; there is no process-wide clock. Every tick is
/// distinct: two transactions from the same origin never share an index.
#[derive(Debug, Clone, Default)]
pub struct LogicalClock {
    ticks: BTreeMap<ReplicaId, u64>,
}

impl LogicalClock {
    /// Create an empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `origin`, starting its counter at `start`.
    ///
    /// Re-registering an origin keeps the larger of the stored and supplied
    /// values, so restoring from a persisted counter is safe.
    pub fn register(&mut self, origin: ReplicaId, start: u64) {
        self.ticks
            .entry(origin)
            .and_modify(|t| *t = (*t).max(start))
            .or_insert(start);
    }

    /// Produce the next tick for `origin` and commit it.
    pub fn tick(&mut self, origin: ReplicaId) -> Result<u64, ClockError> {
        let counter = self
            .ticks
            .get_mut(&origin)
            .ok_or(ClockError::Uninitialized(origin))?;
        *counter += 1;
        Ok(*counter)
    }

    /// The last committed tick for `origin`, if registered.
    pub fn last(&self, origin: &ReplicaId) -> Option<u64> {
        self.ticks.get(origin).copied()
    }
}
