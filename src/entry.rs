//! One entry of the rebase log and its recomputation algorithms.

use tracing::{debug, error, warn};

use crate::block::{InstructionsPair, SharedBlock};
use crate::data::{Attr, Effects, IdMapping, Novelty};
use crate::engine::{ApplyError, SnapshotEngine};
use crate::instruction::SharedInstruction;
use crate::transaction::Transaction;

/// The cheap replay path found its assumptions violated; the entry must be
/// reconsidered against the new base instead.
#[derive(Debug, thiserror::Error)]
#[error("replay assumptions violated: {reason}")]
pub struct SoftConflict {
    /// What the engine reported.
    pub reason: String,
}

/// One unit of pending work in the rebase log.
///
/// Invariant: `db_after` is exactly the result of applying `blocks` to
/// `db_before`, or equals `db_before` when `replay_failed` is set.
#[derive(Debug, Clone)]
pub struct RebaseLogEntry<E: SnapshotEngine> {
    /// The change units of this entry, in application order.
    pub blocks: Vec<SharedBlock<E>>,
    /// Local-to-global bindings created by this entry.
    pub id_mapping: IdMapping,
    /// The snapshot this entry was computed against.
    pub db_before: E::Snapshot,
    /// The snapshot after applying `blocks`.
    pub db_after: E::Snapshot,
    /// The framed transaction, `None` when the entry produced no shared
    /// instruction.
    pub transaction: Option<Transaction>,
    /// The rebase round in which the transaction content was last
    /// (re)generated.
    pub send_epoch: u64,
    /// Whether the last replay degraded this entry to a no-op.
    pub replay_failed: bool,
}

impl<E: SnapshotEngine> RebaseLogEntry<E> {
    /// Build a fresh entry by running `recipe` against `base`.
    ///
    /// `visible_mapping` is the union of committed and speculative
    /// bindings; `frame` turns the produced shared instructions into a
    /// transaction (ticking the caller's clock) and is only called when
    /// the change reaches the replicated domain.
    pub fn from_recipe(
        engine: &E,
        gid_attr: Attr,
        base: &E::Snapshot,
        visible_mapping: IdMapping,
        recipe: Box<dyn crate::block::Recipe<E>>,
        send_epoch: u64,
        frame: impl FnOnce(Vec<SharedInstruction>) -> anyhow::Result<Transaction>,
    ) -> anyhow::Result<(Self, Novelty, Effects)> {
        let (block, outcome) =
            crate::block::run_recipe(engine, gid_attr, base, visible_mapping, recipe)?;
        let shared: Vec<SharedInstruction> = block
            .items
            .iter()
            .filter_map(|item| item.shared.clone())
            .collect();
        let transaction = if shared.is_empty() {
            None
        } else {
            Some(frame(shared)?)
        };
        let entry = RebaseLogEntry {
            blocks: vec![SharedBlock::Reconsiderable(block)],
            id_mapping: outcome.id_mapping,
            db_before: base.clone(),
            db_after: outcome.db,
            transaction,
            send_epoch,
            replay_failed: false,
        };
        Ok((entry, outcome.novelty, outcome.effects))
    }

    /// Replicated-domain facts of this entry; empty when degraded.
    pub fn novelty(&self) -> Novelty {
        if self.replay_failed {
            return Novelty::default();
        }
        let mut out = Novelty::default();
        for block in &self.blocks {
            out.merge(block.novelty());
        }
        out
    }

    /// Effects of this entry; empty when degraded.
    pub fn effects(&self) -> Effects {
        if self.replay_failed {
            return Effects::default();
        }
        let mut out = Effects::default();
        for block in &self.blocks {
            out.merge(block.effects());
        }
        out
    }

    /// The shared instructions across all blocks, in application order.
    pub fn shared_instructions(&self) -> Vec<SharedInstruction> {
        self.blocks
            .iter()
            .flat_map(|b| b.shared_instructions().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Cheap recomputation against `base`.
    ///
    /// If `base` is the entry's own basis the entry is returned unchanged.
    /// Otherwise every already-finalized local instruction is re-applied in
    /// order. A soft conflict reports `Err(SoftConflict)` so the caller can
    /// fall back to [`RebaseLogEntry::reconsider`]; any other apply failure
    /// degrades the entry to a no-op rather than propagating, because one
    /// entry's failure must never corrupt the rest of the log.
    pub fn replay(&self, engine: &E, base: &E::Snapshot) -> Result<Self, SoftConflict> {
        if *base == self.db_before {
            return Ok(self.clone());
        }
        let mut db = base.clone();
        let mut id_mapping = IdMapping::default();
        let mut visible = engine.id_mapping(base);
        let mut blocks = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let mut items = Vec::with_capacity(block.items().len());
            for item in block.items() {
                let applied =
                    match engine.apply(&db, std::slice::from_ref(&item.local)) {
                        Ok(applied) => applied,
                        Err(ApplyError::AssumptionsViolated(reason)) => {
                            debug!(%reason, "soft conflict during replay");
                            return Err(SoftConflict { reason });
                        }
                        Err(ApplyError::Other(err)) => {
                            warn!("replay failed, degrading entry to a no-op: {err:#}");
                            return Ok(self.degraded_replay(base));
                        }
                    };
                id_mapping.merge(&applied.id_mapping);
                visible.merge(&applied.id_mapping);
                let novelty = applied.novelty.filtered(|lid| visible.contains(lid));
                items.push(InstructionsPair {
                    shared: item.shared.clone(),
                    local: item.local.clone(),
                    effects: applied.effects,
                    // Engine effects are recomputed; emitted payloads are
                    // part of the change and survive the replay verbatim.
                    emitted: item.emitted.clone(),
                    novelty,
                });
                db = applied.snapshot;
            }
            blocks.push(match block {
                SharedBlock::Pair(_) => {
                    // A pair block holds exactly one item.
                    match items.pop() {
                        Some(item) => SharedBlock::Pair(item),
                        None => block.clone(),
                    }
                }
                SharedBlock::Reconsiderable(inner) => {
                    let mut inner = inner.clone();
                    inner.items = items;
                    SharedBlock::Reconsiderable(inner)
                }
            });
        }
        Ok(RebaseLogEntry {
            blocks,
            id_mapping,
            db_before: base.clone(),
            db_after: db,
            transaction: self.transaction.clone(),
            send_epoch: self.send_epoch,
            replay_failed: false,
        })
    }

    /// Full recomputation against `base`, for when replay signalled a soft
    /// conflict.
    ///
    /// Reconsiderable blocks re-run their recipe with `speculative_mapping`
    /// (the bindings of entries already rebased ahead of this one) visible;
    /// finalized blocks are re-applied as in replay. On success the
    /// transaction is rebuilt with a fresh id and `send_epoch` is set to
    /// the current round. On failure the entry's effect is dropped for this
    /// round: the result is an empty-block no-op that keeps the prior
    /// transaction so a later acknowledgement can still match.
    pub fn reconsider(
        &self,
        engine: &E,
        gid_attr: Attr,
        base: &E::Snapshot,
        speculative_mapping: &IdMapping,
        send_epoch: u64,
    ) -> Self {
        match self.try_reconsider(engine, gid_attr, base, speculative_mapping, send_epoch) {
            Ok(entry) => entry,
            Err(err) => {
                error!("reconsideration failed, dropping entry effect: {err:#}");
                RebaseLogEntry {
                    blocks: Vec::new(),
                    id_mapping: IdMapping::default(),
                    db_before: base.clone(),
                    db_after: base.clone(),
                    transaction: self.transaction.clone(),
                    send_epoch: self.send_epoch,
                    replay_failed: false,
                }
            }
        }
    }

    fn try_reconsider(
        &self,
        engine: &E,
        gid_attr: Attr,
        base: &E::Snapshot,
        speculative_mapping: &IdMapping,
        send_epoch: u64,
    ) -> anyhow::Result<Self> {
        let mut db = base.clone();
        let mut id_mapping = IdMapping::default();
        let mut visible = engine.id_mapping(base);
        visible.merge(speculative_mapping);
        let mut blocks = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            match block {
                SharedBlock::Pair(item) => {
                    let applied = engine
                        .apply(&db, std::slice::from_ref(&item.local))
                        .map_err(anyhow::Error::from)?;
                    id_mapping.merge(&applied.id_mapping);
                    visible.merge(&applied.id_mapping);
                    let novelty = applied.novelty.filtered(|lid| visible.contains(lid));
                    blocks.push(SharedBlock::Pair(InstructionsPair {
                        shared: item.shared.clone(),
                        local: item.local.clone(),
                        effects: applied.effects,
                        emitted: item.emitted.clone(),
                        novelty,
                    }));
                    db = applied.snapshot;
                }
                SharedBlock::Reconsiderable(inner) => {
                    let (block, outcome) = inner.rerun(engine, gid_attr, &db, visible.clone())?;
                    id_mapping.merge(&outcome.id_mapping);
                    visible.merge(&outcome.id_mapping);
                    db = outcome.db;
                    blocks.push(SharedBlock::Reconsiderable(block));
                }
            }
        }
        let shared: Vec<SharedInstruction> = blocks
            .iter()
            .flat_map(|b| b.shared_instructions().cloned().collect::<Vec<_>>())
            .collect();
        let transaction = match (&self.transaction, shared.is_empty()) {
            (Some(tx), _) => Some(tx.with_instructions(shared)),
            (None, true) => None,
            (None, false) => {
                // No clock is reachable here, so a transaction slot cannot
                // be minted for content that only now became shared.
                warn!("reconsideration produced shared content for a local-only entry; dropping it");
                None
            }
        };
        Ok(RebaseLogEntry {
            blocks,
            id_mapping,
            db_before: base.clone(),
            db_after: db,
            transaction,
            send_epoch,
            replay_failed: false,
        })
    }

    fn degraded_replay(&self, base: &E::Snapshot) -> Self {
        RebaseLogEntry {
            blocks: self.blocks.clone(),
            id_mapping: IdMapping::default(),
            db_before: base.clone(),
            db_after: base.clone(),
            transaction: self.transaction.clone(),
            send_epoch: self.send_epoch,
            replay_failed: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Attr, Value};
    use crate::instruction::{encode, EncodeContext, Instruction};
    use crate::store::MemStore;

    const GID_ATTR: Attr = Attr(0);

    fn pair_entry(
        store: &MemStore,
        base: &crate::store::MemSnapshot,
        instructions: Vec<Instruction>,
    ) -> RebaseLogEntry<MemStore> {
        let mut db = base.clone();
        let mut id_mapping = IdMapping::default();
        let mut blocks = Vec::new();
        for local in instructions {
            let applied = store.apply(&db, std::slice::from_ref(&local)).unwrap();
            id_mapping.merge(&applied.id_mapping);
            let mut mapping = store.id_mapping(base);
            mapping.merge(&id_mapping);
            let shared = encode(
                &EncodeContext {
                    gid_attr: GID_ATTR,
                    mapping: &mapping,
                },
                &local,
            );
            let novelty = applied.novelty.filtered(|lid| mapping.contains(lid));
            blocks.push(SharedBlock::Pair(InstructionsPair {
                shared,
                local,
                effects: applied.effects,
                emitted: Effects::default(),
                novelty,
            }));
            db = applied.snapshot;
        }
        RebaseLogEntry {
            blocks,
            id_mapping,
            db_before: base.clone(),
            db_after: db,
            transaction: None,
            send_epoch: 0,
            replay_failed: false,
        }
    }

    #[test]
    fn replay_on_own_basis_is_identity() {
        let store = MemStore::new(GID_ATTR);
        let base = store.empty();
        let e = store.new_lid();
        let entry = pair_entry(
            &store,
            &base,
            vec![Instruction::Assert {
                entity: e,
                attr: Attr(1),
                value: Value::U64(1),
            }],
        );
        let replayed = entry.replay(&store, &base).unwrap();
        assert_eq!(replayed.db_after, entry.db_after);
        // No recomputation: the snapshot version is the exact same one.
        assert_eq!(replayed.db_after.version(), entry.db_after.version());
    }

    #[test]
    fn replay_against_moved_base_recomputes() {
        let store = MemStore::new(GID_ATTR);
        let base = store.empty();
        let e = store.new_lid();
        let other = store.new_lid();
        let entry = pair_entry(
            &store,
            &base,
            vec![Instruction::Assert {
                entity: e,
                attr: Attr(1),
                value: Value::U64(1),
            }],
        );
        // The base moves: someone else committed a change.
        let moved = store
            .apply(
                &base,
                &[Instruction::Assert {
                    entity: other,
                    attr: Attr(2),
                    value: Value::Bool(true),
                }],
            )
            .unwrap()
            .snapshot;
        let replayed = entry.replay(&store, &moved).unwrap();
        assert_eq!(replayed.db_before, moved);
        assert!(replayed.db_after.contains(e));
        assert!(replayed.db_after.contains(other));
        assert!(!replayed.replay_failed);
    }

    #[test]
    fn replay_reports_soft_conflict() {
        let store = MemStore::new(GID_ATTR);
        let target = store.new_lid();
        let base = store
            .apply(
                &store.empty(),
                &[Instruction::Assert {
                    entity: target,
                    attr: Attr(1),
                    value: Value::U64(0),
                }],
            )
            .unwrap()
            .snapshot;
        let e = store.new_lid();
        let entry = pair_entry(
            &store,
            &base,
            vec![Instruction::Assert {
                entity: e,
                attr: Attr(2),
                value: Value::Ref(target),
            }],
        );
        // The referenced entity is retracted from under the entry.
        let moved = store
            .apply(&base, &[Instruction::RetractEntity { entity: target }])
            .unwrap()
            .snapshot;
        let err = entry.replay(&store, &moved).unwrap_err();
        assert!(err.reason.contains("missing entity"));
    }

    #[test]
    fn reconsider_of_pair_blocks_behaves_like_replay() {
        let store = MemStore::new(GID_ATTR);
        let base = store.empty();
        let e = store.new_lid();
        let entry = pair_entry(
            &store,
            &base,
            vec![Instruction::Assert {
                entity: e,
                attr: Attr(1),
                value: Value::U64(9),
            }],
        );
        let other = store.new_lid();
        let moved = store
            .apply(
                &base,
                &[Instruction::Assert {
                    entity: other,
                    attr: Attr(3),
                    value: Value::Bool(false),
                }],
            )
            .unwrap()
            .snapshot;
        let entry =
            entry.reconsider(&store, GID_ATTR, &moved, &IdMapping::default(), 3);
        assert_eq!(entry.send_epoch, 3);
        assert!(entry.db_after.contains(e));
        assert!(!entry.replay_failed);
    }

    #[test]
    fn failed_reconsideration_drops_the_entry_effect() {
        let store = MemStore::new(GID_ATTR);
        let target = store.new_lid();
        let base = store
            .apply(
                &store.empty(),
                &[Instruction::Assert {
                    entity: target,
                    attr: Attr(1),
                    value: Value::U64(0),
                }],
            )
            .unwrap()
            .snapshot;
        let e = store.new_lid();
        let entry = pair_entry(
            &store,
            &base,
            vec![Instruction::Assert {
                entity: e,
                attr: Attr(2),
                value: Value::Ref(target),
            }],
        );
        let moved = store
            .apply(&base, &[Instruction::RetractEntity { entity: target }])
            .unwrap()
            .snapshot;
        // Reconsidering pair blocks re-applies them, so the same conflict
        // now counts as a reconsideration failure: the effect is dropped.
        let entry = entry.reconsider(&store, GID_ATTR, &moved, &IdMapping::default(), 1);
        assert!(entry.blocks.is_empty());
        assert_eq!(entry.db_after, moved);
        assert!(!entry.replay_failed);
        assert!(entry.novelty().is_empty());
    }

    #[test]
    fn lid_lookup_roundtrip_after_replay_collects_mapping() {
        let store = MemStore::new(GID_ATTR);
        let base = store.empty();
        let e = store.new_lid();
        let gid = crate::data::Gid::random(&mut rand::thread_rng());
        let entry = pair_entry(
            &store,
            &base,
            vec![
                Instruction::Assert {
                    entity: e,
                    attr: GID_ATTR,
                    value: Value::Gid(gid),
                },
                Instruction::Assert {
                    entity: e,
                    attr: Attr(1),
                    value: Value::Text("x".into()),
                },
            ],
        );
        assert_eq!(entry.id_mapping.gid(e), Some(gid));
        let other = store.new_lid();
        let moved = store
            .apply(
                &base,
                &[Instruction::Assert {
                    entity: other,
                    attr: Attr(9),
                    value: Value::U64(1),
                }],
            )
            .unwrap()
            .snapshot;
        let replayed = entry.replay(&store, &moved).unwrap();
        assert_eq!(replayed.id_mapping.gid(e), Some(gid));
        // The shared novelty tracks the replicated entity.
        assert!(!replayed.novelty().is_empty());
    }
}
