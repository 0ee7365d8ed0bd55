//! In-memory snapshot engine.
//!
//! Snapshots share their maps through [`Arc`] and compare by a
//! store-unique version number, so cloning a snapshot and checking whether
//! a rebase moved the base are both cheap.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::anyhow;

use crate::data::{Attr, Datom, Domain, Effects, Gid, IdMapping, Lid, LidAlloc, Novelty, Value};
use crate::engine::{Applied, ApplyError, SnapshotEngine};
use crate::instruction::Instruction;

/// An immutable view of the in-memory database.
#[derive(Debug, Clone)]
pub struct MemSnapshot {
    version: u64,
    datoms: Arc<BTreeMap<(Lid, Attr), Value>>,
    gids: Arc<BTreeMap<Gid, Lid>>,
}

impl PartialEq for MemSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
    }
}

impl Eq for MemSnapshot {}

impl MemSnapshot {
    /// The store-unique version of this snapshot.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The value stored under `attr` on `entity`, if any.
    pub fn get(&self, entity: Lid, attr: Attr) -> Option<&Value> {
        self.datoms.get(&(entity, attr))
    }

    /// Whether `entity` has any datoms.
    pub fn contains(&self, entity: Lid) -> bool {
        self.datoms
            .range((entity, Attr(0))..=(entity, Attr(u32::MAX)))
            .next()
            .is_some()
    }

    /// The local entity bound to `gid`, if present.
    pub fn entity_for(&self, gid: &Gid) -> Option<Lid> {
        self.gids.get(gid).copied()
    }

    /// Number of datoms in this snapshot.
    pub fn len(&self) -> usize {
        self.datoms.len()
    }

    /// Whether the snapshot holds no datoms.
    pub fn is_empty(&self) -> bool {
        self.datoms.is_empty()
    }
}

/// In-memory implementation of [`SnapshotEngine`].
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    gid_attr: Attr,
    alloc: LidAlloc,
    versions: Arc<AtomicU64>,
}

impl MemStore {
    /// Create a store whose GID-defining attribute is `gid_attr`.
    pub fn new(gid_attr: Attr) -> Self {
        MemStore {
            gid_attr,
            alloc: LidAlloc::default(),
            versions: Arc::new(AtomicU64::new(1)),
        }
    }

    /// The GID-defining attribute of this store.
    pub fn gid_attr(&self) -> Attr {
        self.gid_attr
    }

    /// An empty snapshot.
    pub fn empty(&self) -> MemSnapshot {
        MemSnapshot {
            version: self.next_version(),
            datoms: Arc::new(BTreeMap::new()),
            gids: Arc::new(BTreeMap::new()),
        }
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::Relaxed)
    }
}

impl SnapshotEngine for MemStore {
    type Snapshot = MemSnapshot;

    fn apply(
        &self,
        base: &MemSnapshot,
        instructions: &[Instruction],
    ) -> Result<Applied<MemSnapshot>, ApplyError> {
        if instructions.is_empty() {
            return Ok(Applied {
                snapshot: base.clone(),
                novelty: Novelty::default(),
                effects: Effects::default(),
                id_mapping: IdMapping::default(),
            });
        }
        let mut datoms = (*base.datoms).clone();
        let mut gids = (*base.gids).clone();
        let mut novelty = Novelty::default();
        let mut id_mapping = IdMapping::default();

        for instruction in instructions {
            match instruction {
                Instruction::Assert {
                    entity,
                    attr,
                    value,
                } => {
                    if let Value::Ref(target) = value {
                        let exists = datoms
                            .range((*target, Attr(0))..=(*target, Attr(u32::MAX)))
                            .next()
                            .is_some();
                        if !exists {
                            return Err(ApplyError::AssumptionsViolated(format!(
                                "assert references missing entity {target}"
                            )));
                        }
                    }
                    if let Some(prev) = datoms.insert((*entity, *attr), value.clone()) {
                        if prev != *value {
                            novelty.push(Datom::retracted(*entity, *attr, prev));
                        }
                    }
                    novelty.push(Datom::added(*entity, *attr, value.clone()));
                    if *attr == self.gid_attr {
                        if let Value::Gid(gid) = value {
                            gids.insert(*gid, *entity);
                            id_mapping.insert(*entity, *gid);
                        } else {
                            return Err(ApplyError::Other(anyhow!(
                                "non-gid value under the gid attribute on {entity}"
                            )));
                        }
                    }
                }
                Instruction::Retract { entity, attr } => {
                    let Some(prev) = datoms.remove(&(*entity, *attr)) else {
                        return Err(ApplyError::AssumptionsViolated(format!(
                            "retract of missing datom ({entity}, {attr})"
                        )));
                    };
                    if *attr == self.gid_attr {
                        if let Value::Gid(gid) = &prev {
                            gids.remove(gid);
                        }
                    }
                    novelty.push(Datom::retracted(*entity, *attr, prev));
                }
                Instruction::RetractEntity { entity } => {
                    let range: Vec<(Lid, Attr)> = datoms
                        .range((*entity, Attr(0))..=(*entity, Attr(u32::MAX)))
                        .map(|(k, _)| *k)
                        .collect();
                    if range.is_empty() {
                        return Err(ApplyError::AssumptionsViolated(format!(
                            "retract of missing entity {entity}"
                        )));
                    }
                    for key in range {
                        if let Some(prev) = datoms.remove(&key) {
                            if key.1 == self.gid_attr {
                                if let Value::Gid(gid) = &prev {
                                    gids.remove(gid);
                                }
                            }
                            novelty.push(Datom::retracted(key.0, key.1, prev));
                        }
                    }
                }
            }
        }

        Ok(Applied {
            snapshot: MemSnapshot {
                version: self.next_version(),
                datoms: Arc::new(datoms),
                gids: Arc::new(gids),
            },
            novelty,
            effects: Effects::default(),
            id_mapping,
        })
    }

    fn select_domain(&self, base: &MemSnapshot, domain: Domain) -> MemSnapshot {
        let replicated: std::collections::BTreeSet<Lid> = base.gids.values().copied().collect();
        let keep = |entity: &Lid| match domain {
            Domain::Replicated => replicated.contains(entity),
            Domain::Private => !replicated.contains(entity),
        };
        let datoms: BTreeMap<(Lid, Attr), Value> = base
            .datoms
            .iter()
            .filter(|((entity, _), _)| keep(entity))
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        let gids = match domain {
            Domain::Replicated => (*base.gids).clone(),
            Domain::Private => BTreeMap::new(),
        };
        MemSnapshot {
            version: self.next_version(),
            datoms: Arc::new(datoms),
            gids: Arc::new(gids),
        }
    }

    fn id_mapping(&self, base: &MemSnapshot) -> IdMapping {
        let mut mapping = IdMapping::default();
        for (gid, lid) in base.gids.iter() {
            mapping.insert(*lid, *gid);
        }
        mapping
    }

    fn lid_alloc(&self) -> LidAlloc {
        self.alloc.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GID_ATTR: Attr = Attr(0);

    fn store() -> MemStore {
        MemStore::new(GID_ATTR)
    }

    #[test]
    fn assert_creates_entity_and_novelty() {
        let store = store();
        let base = store.empty();
        let e = store.new_lid();
        let applied = store
            .apply(
                &base,
                &[Instruction::Assert {
                    entity: e,
                    attr: Attr(1),
                    value: Value::U64(7),
                }],
            )
            .unwrap();
        assert_eq!(applied.snapshot.get(e, Attr(1)), Some(&Value::U64(7)));
        assert_eq!(applied.novelty.len(), 1);
        assert!(applied.id_mapping.is_empty());
        // The base is untouched.
        assert!(!base.contains(e));
    }

    #[test]
    fn gid_assert_produces_id_mapping() {
        let store = store();
        let base = store.empty();
        let e = store.new_lid();
        let gid = Gid::random(&mut rand::thread_rng());
        let applied = store
            .apply(
                &base,
                &[Instruction::Assert {
                    entity: e,
                    attr: GID_ATTR,
                    value: Value::Gid(gid),
                }],
            )
            .unwrap();
        assert_eq!(applied.id_mapping.gid(e), Some(gid));
        assert_eq!(applied.snapshot.entity_for(&gid), Some(e));
        assert_eq!(store.id_mapping(&applied.snapshot).lid(&gid), Some(e));
    }

    #[test]
    fn dangling_ref_is_a_soft_conflict() {
        let store = store();
        let base = store.empty();
        let e = store.new_lid();
        let missing = store.new_lid();
        let err = store
            .apply(
                &base,
                &[Instruction::Assert {
                    entity: e,
                    attr: Attr(1),
                    value: Value::Ref(missing),
                }],
            )
            .unwrap_err();
        assert!(err.is_soft());
    }

    #[test]
    fn retract_of_missing_datom_is_a_soft_conflict() {
        let store = store();
        let base = store.empty();
        let e = store.new_lid();
        let err = store
            .apply(
                &base,
                &[Instruction::Retract {
                    entity: e,
                    attr: Attr(1),
                }],
            )
            .unwrap_err();
        assert!(err.is_soft());
    }

    #[test]
    fn retract_entity_removes_all_datoms_and_gid_binding() {
        let store = store();
        let base = store.empty();
        let e = store.new_lid();
        let gid = Gid::random(&mut rand::thread_rng());
        let applied = store
            .apply(
                &base,
                &[
                    Instruction::Assert {
                        entity: e,
                        attr: GID_ATTR,
                        value: Value::Gid(gid),
                    },
                    Instruction::Assert {
                        entity: e,
                        attr: Attr(1),
                        value: Value::U64(1),
                    },
                ],
            )
            .unwrap();
        let applied = store
            .apply(&applied.snapshot, &[Instruction::RetractEntity { entity: e }])
            .unwrap();
        assert!(!applied.snapshot.contains(e));
        assert_eq!(applied.snapshot.entity_for(&gid), None);
        assert_eq!(applied.novelty.len(), 2);
        assert!(applied.novelty.iter().all(|d| !d.added));
    }

    #[test]
    fn overwrite_retracts_the_previous_value() {
        let store = store();
        let base = store.empty();
        let e = store.new_lid();
        let applied = store
            .apply(
                &base,
                &[Instruction::Assert {
                    entity: e,
                    attr: Attr(1),
                    value: Value::U64(1),
                }],
            )
            .unwrap();
        let applied = store
            .apply(
                &applied.snapshot,
                &[Instruction::Assert {
                    entity: e,
                    attr: Attr(1),
                    value: Value::U64(2),
                }],
            )
            .unwrap();
        let datoms: Vec<_> = applied.novelty.iter().collect();
        assert_eq!(datoms.len(), 2);
        assert!(!datoms[0].added);
        assert!(datoms[1].added);
    }

    #[test]
    fn select_domain_splits_by_gid_presence() {
        let store = store();
        let base = store.empty();
        let shared = store.new_lid();
        let private = store.new_lid();
        let gid = Gid::random(&mut rand::thread_rng());
        let applied = store
            .apply(
                &base,
                &[
                    Instruction::Assert {
                        entity: shared,
                        attr: GID_ATTR,
                        value: Value::Gid(gid),
                    },
                    Instruction::Assert {
                        entity: private,
                        attr: Attr(1),
                        value: Value::Bool(true),
                    },
                ],
            )
            .unwrap();
        let replicated = store.select_domain(&applied.snapshot, Domain::Replicated);
        assert!(replicated.contains(shared));
        assert!(!replicated.contains(private));
        let local = store.select_domain(&applied.snapshot, Domain::Private);
        assert!(!local.contains(shared));
        assert!(local.contains(private));
    }

    #[test]
    fn empty_apply_returns_the_same_snapshot() {
        let store = store();
        let base = store.empty();
        let applied = store.apply(&base, &[]).unwrap();
        assert_eq!(applied.snapshot, base);
    }

    #[test]
    fn snapshots_compare_by_version() {
        let store = store();
        let a = store.empty();
        let b = store.empty();
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }
}
