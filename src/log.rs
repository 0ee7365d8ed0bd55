//! The rebase log: the state machine that keeps optimistic local changes
//! consistent with the sequencer's confirmed order.
//!
//! The log is two ordered runs of entries anchored at snapshots. The
//! *speculation* segment holds entries already validated against the
//! current committed base and awaiting acknowledgement; the *rebasing*
//! segment holds entries whose basis moved and which must be recomputed.
//! Appends enter at the tail of rebasing; [`RebaseLog::continue_rebase`]
//! migrates entries into speculation one at a time; acknowledgements
//! retire them from the front, strictly in order.
//!
//! No IO happens here. The connection layer feeds confirmed transactions
//! and acknowledgements in and sends out whatever [`RebaseLog`] hands
//! back, in the manner of a protocol state machine.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::data::{Attr, Effects, IdMapping, Novelty};
use crate::engine::{Applied, ApplyError, SnapshotEngine};
use crate::entry::RebaseLogEntry;
use crate::instruction::{decode, DecodeContext, Instruction};
use crate::transaction::{Transaction, TransactionId};

/// Local and remote state have diverged in a way the rebase loop cannot
/// reconcile.
///
/// Fatal: the caller must tear down the connection and resynchronize from
/// the committed state rather than continue, because continuing could
/// duplicate or drop confirmed effects.
#[derive(Debug, thiserror::Error)]
pub enum OutOfSync {
    /// The log holds no entry to advance or acknowledge.
    #[error("no pending entry in the log")]
    Empty,
    /// An acknowledgement arrived but no pending entry carries a
    /// transaction.
    #[error("acknowledgement for {got} but no transaction is pending")]
    NoPendingTransaction {
        /// The acknowledged id.
        got: TransactionId,
    },
    /// The acknowledged id is not the log head's transaction id.
    #[error("acknowledgement for {got} but the log head is {expected}")]
    TransactionMismatch {
        /// The head's transaction id.
        expected: TransactionId,
        /// The acknowledged id.
        got: TransactionId,
    },
    /// The sequencer's verdict contradicts the local replay status.
    #[error("transaction {tx} acknowledged with failed={remote} but local replay failed={local}")]
    StatusMismatch {
        /// The acknowledged transaction.
        tx: TransactionId,
        /// Whether the local replay degraded the entry.
        local: bool,
        /// Whether the sequencer rejected the transaction.
        remote: bool,
    },
    /// An entry assumed valid could no longer be replayed.
    #[error("pending entry can no longer be replayed against the committed base")]
    ReplayImpossible,
}

/// Aggregated outputs of the entries retired by one acknowledgement.
#[derive(Debug, Clone, Default)]
pub struct AckOutcome {
    /// Replicated-domain facts of all retired entries.
    pub novelty: Novelty,
    /// Effects of all retired entries.
    pub effects: Effects,
}

/// An ordered run of change records anchored at a base snapshot.
#[derive(Debug, Clone)]
pub struct LogSegment<E: SnapshotEngine> {
    base: E::Snapshot,
    entries: VecDeque<RebaseLogEntry<E>>,
}

impl<E: SnapshotEngine> LogSegment<E> {
    /// An empty segment anchored at `base`.
    pub fn new(base: E::Snapshot) -> Self {
        LogSegment {
            base,
            entries: VecDeque::new(),
        }
    }

    /// The anchor snapshot.
    pub fn base(&self) -> &E::Snapshot {
        &self.base
    }

    /// The entries, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &RebaseLogEntry<E>> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the segment holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The snapshot after all entries, or the base when empty.
    pub fn head(&self) -> &E::Snapshot {
        self.entries
            .back()
            .map(|e| &e.db_after)
            .unwrap_or(&self.base)
    }
}

/// The rebase log.
///
/// Core invariant: `rebasing.base` equals the snapshot that results from
/// applying all speculation entries to `speculation.base`: committed base,
/// speculative entries, and rebasing entries form one continuous chain.
#[derive(Debug, Clone)]
pub struct RebaseLog<E: SnapshotEngine> {
    speculation: LogSegment<E>,
    rebasing: LogSegment<E>,
    send_epoch: u64,
}

impl<E: SnapshotEngine> RebaseLog<E> {
    /// An empty log anchored at the committed snapshot `base`.
    pub fn new(base: E::Snapshot) -> Self {
        RebaseLog {
            speculation: LogSegment::new(base.clone()),
            rebasing: LogSegment::new(base),
            send_epoch: 0,
        }
    }

    /// The entries awaiting acknowledgement against the current base.
    pub fn speculation(&self) -> &LogSegment<E> {
        &self.speculation
    }

    /// The entries that still need recomputation.
    pub fn rebasing(&self) -> &LogSegment<E> {
        &self.rebasing
    }

    /// The current rebase round.
    pub fn send_epoch(&self) -> u64 {
        self.send_epoch
    }

    /// The committed snapshot the log is anchored at.
    pub fn committed(&self) -> &E::Snapshot {
        &self.speculation.base
    }

    /// The snapshot including every pending entry; new changes are
    /// computed against this.
    pub fn head(&self) -> &E::Snapshot {
        self.rebasing.head()
    }

    /// Total number of pending entries.
    pub fn len(&self) -> usize {
        self.speculation.len() + self.rebasing.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.speculation.is_empty() && self.rebasing.is_empty()
    }

    /// Union of the bindings created by all speculation entries.
    pub fn speculative_mapping(&self) -> IdMapping {
        let mut mapping = IdMapping::default();
        for entry in self.speculation.entries() {
            mapping.merge(&entry.id_mapping);
        }
        mapping
    }

    /// Append a freshly created entry at the tail of the rebasing segment.
    ///
    /// The entry must have been computed against [`RebaseLog::head`].
    pub fn append(&mut self, entry: RebaseLogEntry<E>) {
        debug_assert!(
            entry.db_before == *self.head(),
            "appended entry was not computed against the log head"
        );
        trace!(
            tx = ?entry.transaction.as_ref().map(|t| t.id),
            "append entry"
        );
        self.rebasing.entries.push_back(entry);
    }

    /// Pop the oldest pending entry, preferring speculation.
    ///
    /// Entries in speculation are already validated against the current
    /// base, so popping them is a no-op transform. Popping from rebasing
    /// replays first; by construction those entries were validated by
    /// [`RebaseLog::continue_rebase`] before an acknowledgement can reach
    /// them, so a replay conflict here is an unrecoverable inconsistency.
    pub fn advance(&mut self, engine: &E) -> Result<RebaseLogEntry<E>, OutOfSync> {
        if let Some(entry) = self.speculation.entries.pop_front() {
            self.speculation.base = entry.db_after.clone();
            return Ok(entry);
        }
        let Some(entry) = self.rebasing.entries.pop_front() else {
            return Err(OutOfSync::Empty);
        };
        match entry.replay(engine, &self.rebasing.base) {
            Ok(replayed) => {
                self.rebasing.base = replayed.db_after.clone();
                self.speculation.base = replayed.db_after.clone();
                Ok(replayed)
            }
            Err(_) => {
                self.rebasing.entries.push_front(entry);
                Err(OutOfSync::ReplayImpossible)
            }
        }
    }

    /// Rebase the oldest rebasing entry onto the current chain head and
    /// move it into speculation.
    ///
    /// Tries the cheap replay first, falling back to full reconsideration
    /// on a soft conflict. Returns the entry's transaction only if its
    /// content was regenerated this round; a replay that reproduced the
    /// already-sent content needs no re-send.
    pub fn continue_rebase(&mut self, engine: &E, gid_attr: Attr) -> Option<Transaction> {
        let entry = self.rebasing.entries.pop_front()?;
        let prev_epoch = entry.send_epoch;
        let rebased = match entry.replay(engine, &self.rebasing.base) {
            Ok(replayed) => replayed,
            Err(conflict) => {
                debug!(%conflict, "replay conflicted, reconsidering");
                entry.reconsider(
                    engine,
                    gid_attr,
                    &self.rebasing.base,
                    &self.speculative_mapping(),
                    self.send_epoch,
                )
            }
        };
        self.rebasing.base = rebased.db_after.clone();
        let resend = if rebased.send_epoch != prev_epoch {
            rebased.transaction.clone()
        } else {
            None
        };
        self.speculation.entries.push_back(rebased);
        resend
    }

    /// Rebase every pending rebasing entry, collecting the transactions
    /// that must be re-sent.
    pub fn drain_rebase(&mut self, engine: &E, gid_attr: Attr) -> Vec<Transaction> {
        let mut resend = Vec::new();
        while !self.rebasing.is_empty() {
            if let Some(tx) = self.continue_rebase(engine, gid_attr) {
                resend.push(tx);
            }
        }
        resend
    }

    /// Re-anchor the log at a new committed snapshot.
    ///
    /// Called when a transaction not originated by this replica is
    /// confirmed: every locally unconfirmed entry, speculation included,
    /// must be revalidated against the new committed state.
    pub fn reset(&mut self, committed: E::Snapshot) {
        self.send_epoch += 1;
        debug!(
            epoch = self.send_epoch,
            pending = self.len(),
            "reset onto new committed base"
        );
        let mut entries = std::mem::take(&mut self.speculation.entries);
        entries.append(&mut self.rebasing.entries);
        self.speculation.base = committed.clone();
        self.rebasing.base = committed;
        self.rebasing.entries = entries;
    }

    /// Apply a confirmed remote transaction to the committed base and
    /// re-anchor the log on the result.
    pub fn consume_tx(
        &mut self,
        engine: &E,
        gid_attr: Attr,
        transaction: &Transaction,
    ) -> Result<Applied<E::Snapshot>, ApplyError> {
        let mut cx = DecodeContext::new(
            gid_attr,
            engine.id_mapping(&self.speculation.base),
            engine.lid_alloc(),
        );
        let mut instructions: Vec<Instruction> = Vec::new();
        for shared in &transaction.instructions {
            instructions.extend(decode(&mut cx, shared));
        }
        let applied = engine.apply(&self.speculation.base, &instructions)?;
        self.reset(applied.snapshot.clone());
        Ok(applied)
    }

    /// Retire the acknowledged transaction from the front of the log.
    ///
    /// The acknowledged id must belong to the oldest pending transaction,
    /// and the sequencer's verdict must agree with the local replay
    /// status; anything else is a fatal [`OutOfSync`], and the log is left
    /// untouched. Purely local entries adjacent to the acknowledged one
    /// are folded into the outcome.
    pub fn ack(
        &mut self,
        engine: &E,
        tx_id: TransactionId,
        failed: bool,
    ) -> Result<AckOutcome, OutOfSync> {
        // Validate against an immutable view before touching anything.
        let to_retire = {
            let mut pending = self
                .speculation
                .entries
                .iter()
                .chain(self.rebasing.entries.iter());
            let mut leading = 0usize;
            let entry = loop {
                match pending.next() {
                    None if leading == 0 => return Err(OutOfSync::Empty),
                    None => return Err(OutOfSync::NoPendingTransaction { got: tx_id }),
                    Some(entry) => match &entry.transaction {
                        None => leading += 1,
                        Some(tx) => {
                            if tx.id != tx_id {
                                return Err(OutOfSync::TransactionMismatch {
                                    expected: tx.id,
                                    got: tx_id,
                                });
                            }
                            break entry;
                        }
                    },
                }
            };
            if entry.replay_failed != failed {
                return Err(OutOfSync::StatusMismatch {
                    tx: tx_id,
                    local: entry.replay_failed,
                    remote: failed,
                });
            }
            let trailing = pending
                .take_while(|entry| entry.transaction.is_none())
                .count();
            leading + 1 + trailing
        };

        // Retire on a staged copy: a replay failure while advancing into
        // the rebasing segment must not leave the log half-retired.
        let mut staged = self.clone();
        let mut outcome = AckOutcome::default();
        for _ in 0..to_retire {
            let entry = staged.advance(engine)?;
            outcome.novelty.merge(entry.novelty());
            outcome.effects.merge(entry.effects());
        }
        *self = staged;
        debug!(tx = %tx_id, retired = to_retire, "acknowledged");
        Ok(outcome)
    }

    /// Structural continuity of the chain: committed base, speculation
    /// entries, and rebasing base line up snapshot by snapshot.
    pub fn is_continuous(&self) -> bool {
        let mut cursor = &self.speculation.base;
        for entry in self.speculation.entries() {
            if entry.db_before != *cursor {
                return false;
            }
            cursor = &entry.db_after;
        }
        *cursor == self.rebasing.base
    }
}
