//! The record of one conceptual change unit.
//!
//! A change is either already finalized, so that replaying it is a pure
//! re-application of its local instruction, or it was derived from
//! identity lookups that may resolve differently against a different base,
//! in which case replaying it means re-running its [`Recipe`].

use std::fmt;

use anyhow::Context as _;

use crate::data::{Attr, Effects, Gid, IdMapping, Lid, Novelty};
use crate::engine::SnapshotEngine;
use crate::instruction::{encode, EncodeContext, Instruction, SharedInstruction};
use crate::memo::Memoizer;

/// A finalized unit of change: one local instruction, its shared encoding
/// (if the instruction touches the replicated domain), and the
/// replicated-domain facts and effects it produced.
#[derive(Debug, Clone)]
pub struct InstructionsPair {
    /// The transmissible encoding, `None` for private-domain instructions.
    pub shared: Option<SharedInstruction>,
    /// The local instruction; replay re-applies exactly this.
    pub local: Instruction,
    /// Side effects of applying the instruction.
    pub effects: Effects,
    /// Payloads attached by the recipe via [`RecipeCx::emit`].
    ///
    /// Kept apart from `effects` so a replay, which recomputes the engine
    /// effects from scratch, can carry the emitted payloads forward
    /// unchanged.
    pub emitted: Effects,
    /// Replicated-domain facts produced by the instruction.
    pub novelty: Novelty,
}

/// The body of a reconsiderable change.
///
/// A pure function of the base snapshot and the identifier mappings made
/// visible through its [`RecipeCx`]; it must not capture mutable state.
/// Re-running a recipe with the same context must produce the same
/// instructions.
pub trait Recipe<E: SnapshotEngine>: fmt::Debug + Send + Sync {
    /// Derive the change against the context's base snapshot.
    fn run(&self, cx: &mut RecipeCx<'_, E>) -> anyhow::Result<()>;

    /// Clone into a fresh box.
    fn clone_box(&self) -> Box<dyn Recipe<E>>;
}

impl<E: SnapshotEngine> Clone for Box<dyn Recipe<E>> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// A change unit whose content may resolve differently against a different
/// base: replaying it requires re-running its recipe.
#[derive(Debug, Clone)]
pub struct ReconsiderableBlock<E: SnapshotEngine> {
    /// The finalized units the last run produced.
    pub items: Vec<InstructionsPair>,
    /// Memoized local identities, stable across reruns.
    pub eid_memo: Memoizer<String, Lid>,
    /// Memoized global identities, stable across reruns.
    pub uid_memo: Memoizer<String, Gid>,
    /// Payloads emitted after the last instruction, or by a recipe that
    /// applied no instruction at all.
    pub trailing: Effects,
    /// The change derivation itself.
    pub recipe: Box<dyn Recipe<E>>,
}

impl<E: SnapshotEngine> ReconsiderableBlock<E> {
    /// Re-run the recipe against `base` with `mapping` visible, producing a
    /// successor block plus the run's outputs.
    pub fn rerun(
        &self,
        engine: &E,
        gid_attr: Attr,
        base: &E::Snapshot,
        mapping: IdMapping,
    ) -> anyhow::Result<(ReconsiderableBlock<E>, RecipeOutcome<E>)> {
        let mut eid_memo = self.eid_memo.clone();
        let mut uid_memo = self.uid_memo.clone();
        eid_memo.next_epoch();
        uid_memo.next_epoch();
        let mut cx = RecipeCx {
            engine,
            gid_attr,
            db: base.clone(),
            mapping,
            new_mapping: IdMapping::default(),
            eid_memo: &mut eid_memo,
            uid_memo: &mut uid_memo,
            items: Vec::new(),
            pending: Effects::default(),
            novelty: Novelty::default(),
            effects: Effects::default(),
        };
        self.recipe
            .run(&mut cx)
            .context("change recipe failed during reconsideration")?;
        let outcome = RecipeOutcome {
            db: cx.db,
            id_mapping: cx.new_mapping,
            novelty: cx.novelty,
            effects: cx.effects,
        };
        let block = ReconsiderableBlock {
            items: cx.items,
            // Whatever the recipe emitted without a following apply.
            trailing: cx.pending,
            eid_memo,
            uid_memo,
            recipe: self.recipe.clone(),
        };
        Ok((block, outcome))
    }
}

/// What running a recipe produced, besides the block itself.
#[derive(Debug, Clone)]
pub struct RecipeOutcome<E: SnapshotEngine> {
    /// The snapshot after all of the recipe's instructions.
    pub db: E::Snapshot,
    /// Bindings created by this run.
    pub id_mapping: IdMapping,
    /// All facts produced, private domain included.
    pub novelty: Novelty,
    /// All effects produced.
    pub effects: Effects,
}

/// Execution context handed to a [`Recipe`].
///
/// Tracks the evolving snapshot as instructions apply, accumulates the
/// finalized [`InstructionsPair`]s, and exposes memoized identity minting
/// so a rerun resolves the same keys to the same identifiers.
pub struct RecipeCx<'a, E: SnapshotEngine> {
    engine: &'a E,
    gid_attr: Attr,
    db: E::Snapshot,
    mapping: IdMapping,
    new_mapping: IdMapping,
    eid_memo: &'a mut Memoizer<String, Lid>,
    uid_memo: &'a mut Memoizer<String, Gid>,
    items: Vec<InstructionsPair>,
    pending: Effects,
    novelty: Novelty,
    effects: Effects,
}

impl<'a, E: SnapshotEngine> fmt::Debug for RecipeCx<'a, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecipeCx")
            .field("db", &self.db)
            .field("items", &self.items.len())
            .finish_non_exhaustive()
    }
}

impl<'a, E: SnapshotEngine> RecipeCx<'a, E> {
    /// The snapshot as of the last applied instruction.
    pub fn db(&self) -> &E::Snapshot {
        &self.db
    }

    /// The identifier bindings visible to this run.
    pub fn mapping(&self) -> &IdMapping {
        &self.mapping
    }

    /// The GID-defining attribute.
    pub fn gid_attr(&self) -> Attr {
        self.gid_attr
    }

    /// A private entity for `key`, stable across reruns.
    pub fn entity(&mut self, key: &str) -> anyhow::Result<Lid> {
        let engine = self.engine;
        Ok(self.eid_memo.memo(true, key.to_owned(), || engine.new_lid())?)
    }

    /// A replicated entity for `key`, stable across reruns.
    ///
    /// Mints the local and global ids on first use and anchors the entity
    /// with its GID-defining assert; a rerun reuses both ids.
    pub fn replicated_entity(&mut self, key: &str) -> anyhow::Result<Lid> {
        let engine = self.engine;
        let lid = self.eid_memo.memo(true, key.to_owned(), || engine.new_lid())?;
        let gid = self
            .uid_memo
            .memo(true, key.to_owned(), || Gid::random(&mut rand::thread_rng()))?;
        if self.mapping.gid(lid) != Some(gid) {
            self.apply(Instruction::Assert {
                entity: lid,
                attr: self.gid_attr,
                value: crate::data::Value::Gid(gid),
            })?;
        }
        Ok(lid)
    }

    /// Look up the entity bound to an existing global id, if visible.
    pub fn resolve(&self, gid: &Gid) -> Option<Lid> {
        self.mapping.lid(gid)
    }

    /// Apply one instruction, recording its finalized pair.
    pub fn apply(&mut self, instruction: Instruction) -> anyhow::Result<()> {
        let applied = self
            .engine
            .apply(&self.db, std::slice::from_ref(&instruction))?;
        self.mapping.merge(&applied.id_mapping);
        self.new_mapping.merge(&applied.id_mapping);
        let shared = encode(
            &EncodeContext {
                gid_attr: self.gid_attr,
                mapping: &self.mapping,
            },
            &instruction,
        );
        let mapping = &self.mapping;
        let shared_novelty = applied.novelty.filtered(|lid| mapping.contains(lid));
        self.items.push(InstructionsPair {
            shared,
            local: instruction,
            effects: applied.effects.clone(),
            emitted: std::mem::take(&mut self.pending),
            novelty: shared_novelty,
        });
        self.novelty.merge(applied.novelty);
        self.effects.merge(applied.effects);
        self.db = applied.snapshot;
        Ok(())
    }

    /// Emit a side effect to be delivered when this change is confirmed.
    ///
    /// The payload attaches to the last applied instruction, or is held
    /// for the next one when nothing has been applied yet, so that the
    /// confirmation path delivers exactly what the commit reported.
    pub fn emit(&mut self, payload: bytes::Bytes) {
        match self.items.last_mut() {
            Some(last) => last.emitted.push(payload.clone()),
            None => self.pending.push(payload.clone()),
        }
        self.effects.push(payload);
    }
}

/// The record of one conceptual change unit.
#[derive(Debug, Clone)]
pub enum SharedBlock<E: SnapshotEngine> {
    /// Finalized: replay is a pure re-application of the local instruction.
    Pair(InstructionsPair),
    /// Replayable only by re-running the recipe.
    Reconsiderable(ReconsiderableBlock<E>),
}

impl<E: SnapshotEngine> SharedBlock<E> {
    /// The finalized units of this block, in application order.
    pub fn items(&self) -> &[InstructionsPair] {
        match self {
            SharedBlock::Pair(pair) => std::slice::from_ref(pair),
            SharedBlock::Reconsiderable(block) => &block.items,
        }
    }

    /// Aggregate replicated-domain novelty.
    pub fn novelty(&self) -> Novelty {
        let mut out = Novelty::default();
        for item in self.items() {
            out.merge(item.novelty.clone());
        }
        out
    }

    /// Aggregate effects, emitted payloads included.
    pub fn effects(&self) -> Effects {
        let mut out = Effects::default();
        for item in self.items() {
            out.merge(item.effects.clone());
            out.merge(item.emitted.clone());
        }
        if let SharedBlock::Reconsiderable(block) = self {
            out.merge(block.trailing.clone());
        }
        out
    }

    /// The shared instructions of this block, in application order.
    pub fn shared_instructions(&self) -> impl Iterator<Item = &SharedInstruction> {
        self.items().iter().filter_map(|item| item.shared.as_ref())
    }
}

/// Build a fresh reconsiderable block by running `recipe` for the first
/// time against `base`.
pub fn run_recipe<E: SnapshotEngine>(
    engine: &E,
    gid_attr: Attr,
    base: &E::Snapshot,
    mapping: IdMapping,
    recipe: Box<dyn Recipe<E>>,
) -> anyhow::Result<(ReconsiderableBlock<E>, RecipeOutcome<E>)> {
    let seed = ReconsiderableBlock {
        items: Vec::new(),
        eid_memo: Memoizer::new(),
        uid_memo: Memoizer::new(),
        trailing: Effects::default(),
        recipe,
    };
    seed.rerun(engine, gid_attr, base, mapping)
}
