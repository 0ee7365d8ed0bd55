//! Local mutations and their transmissible encoding.
//!
//! An [`Instruction`] addresses entities by [`Lid`] and is meaningful only
//! inside this process. A [`SharedInstruction`] is the same mutation
//! addressed by [`Gid`], safe to put in a [`Transaction`]. Encoding and
//! decoding translate between the two using an identifier mapping; only
//! replicated-domain mutations have a shared form.
//!
//! [`Transaction`]: crate::transaction::Transaction

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::{Attr, Gid, IdMapping, Lid, LidAlloc, Value};

/// A local, LID-addressed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// Assert a fact about an entity, creating the entity if needed.
    Assert {
        /// Target entity.
        entity: Lid,
        /// Attribute to assert.
        attr: Attr,
        /// Value to assert.
        value: Value,
    },
    /// Retract the fact stored under `attr` on `entity`.
    Retract {
        /// Target entity.
        entity: Lid,
        /// Attribute to retract.
        attr: Attr,
    },
    /// Retract every fact about `entity`.
    RetractEntity {
        /// Target entity.
        entity: Lid,
    },
}

impl Instruction {
    /// The entity this instruction targets.
    pub fn entity(&self) -> Lid {
        match self {
            Instruction::Assert { entity, .. }
            | Instruction::Retract { entity, .. }
            | Instruction::RetractEntity { entity } => *entity,
        }
    }
}

/// A shared datom value, with references resolved to global ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharedValue {
    /// Boolean flag.
    Bool(bool),
    /// Unsigned integer.
    U64(u64),
    /// UTF-8 text.
    Text(String),
    /// Opaque bytes.
    Bytes(bytes::Bytes),
    /// Reference to another replicated entity.
    Ref(Gid),
    /// A global id value, as carried by the GID-defining attribute.
    Gid(Gid),
}

/// A GID-addressed, transmissible mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharedInstruction {
    /// Assert a fact about a replicated entity.
    Assert {
        /// Target entity.
        entity: Gid,
        /// Attribute to assert.
        attr: Attr,
        /// Value to assert.
        value: SharedValue,
    },
    /// Retract the fact stored under `attr`.
    Retract {
        /// Target entity.
        entity: Gid,
        /// Attribute to retract.
        attr: Attr,
    },
    /// Retract every fact about the entity.
    RetractEntity {
        /// Target entity.
        entity: Gid,
    },
}

/// Context for [`encode`]: the GID-defining attribute and the active
/// identifier mapping.
#[derive(Debug, Clone)]
pub struct EncodeContext<'a> {
    /// The attribute whose presence makes an entity replicated.
    pub gid_attr: Attr,
    /// Bindings visible to this encoding pass.
    pub mapping: &'a IdMapping,
}

/// Context for [`decode`].
///
/// Owns a working copy of the mapping so that bindings minted while
/// decoding one transaction are visible to its later instructions.
#[derive(Debug)]
pub struct DecodeContext {
    /// The attribute whose presence makes an entity replicated.
    pub gid_attr: Attr,
    /// Bindings visible to this decoding pass, extended as lids are minted.
    pub mapping: IdMapping,
    alloc: LidAlloc,
}

impl DecodeContext {
    /// Create a decode context seeded with the committed mapping.
    pub fn new(gid_attr: Attr, mapping: IdMapping, alloc: LidAlloc) -> Self {
        DecodeContext {
            gid_attr,
            mapping,
            alloc,
        }
    }

    /// Resolve `gid` to a local id, minting one if the entity is unknown.
    ///
    /// Returns the lid and whether it was freshly minted.
    fn resolve(&mut self, gid: Gid) -> (Lid, bool) {
        if let Some(lid) = self.mapping.lid(&gid) {
            return (lid, false);
        }
        let lid = self.alloc.next();
        self.mapping.insert(lid, gid);
        (lid, true)
    }
}

/// Encode a local instruction into its shared form.
///
/// Returns `None` when the instruction touches only the private domain:
/// either the entity has no global binding, or the value references an
/// entity without one.
pub fn encode(cx: &EncodeContext<'_>, instruction: &Instruction) -> Option<SharedInstruction> {
    let entity = match cx.mapping.gid(instruction.entity()) {
        Some(gid) => gid,
        None => {
            debug!(?instruction, "skipping private-domain instruction");
            return None;
        }
    };
    match instruction {
        Instruction::Assert { attr, value, .. } => {
            let value = match value {
                Value::Bool(b) => SharedValue::Bool(*b),
                Value::U64(n) => SharedValue::U64(*n),
                Value::Text(s) => SharedValue::Text(s.clone()),
                Value::Bytes(b) => SharedValue::Bytes(b.clone()),
                Value::Gid(g) => SharedValue::Gid(*g),
                Value::Ref(lid) => match cx.mapping.gid(*lid) {
                    Some(gid) => SharedValue::Ref(gid),
                    None => {
                        // A replicated entity pointing at a private one
                        // cannot be expressed on the wire.
                        debug!(%lid, "skipping assert referencing a private entity");
                        return None;
                    }
                },
            };
            Some(SharedInstruction::Assert {
                entity,
                attr: *attr,
                value,
            })
        }
        Instruction::Retract { attr, .. } => Some(SharedInstruction::Retract {
            entity,
            attr: *attr,
        }),
        Instruction::RetractEntity { .. } => Some(SharedInstruction::RetractEntity { entity }),
    }
}

/// Decode a shared instruction into one or more local instructions.
///
/// Unknown global ids are given freshly minted lids; for each of those the
/// decoded sequence starts with the GID-defining assert that anchors the
/// new entity, so applying the result recreates the binding. Deterministic
/// given the same context and input.
pub fn decode(cx: &mut DecodeContext, shared: &SharedInstruction) -> Vec<Instruction> {
    let mut out = Vec::with_capacity(1);
    let anchor = |cx: &mut DecodeContext, gid: Gid, out: &mut Vec<Instruction>| -> Lid {
        let (lid, fresh) = cx.resolve(gid);
        if fresh {
            out.push(Instruction::Assert {
                entity: lid,
                attr: cx.gid_attr,
                value: Value::Gid(gid),
            });
        }
        lid
    };
    match shared {
        SharedInstruction::Assert {
            entity,
            attr,
            value,
        } => {
            let entity = anchor(cx, *entity, &mut out);
            let value = match value {
                SharedValue::Bool(b) => Value::Bool(*b),
                SharedValue::U64(n) => Value::U64(*n),
                SharedValue::Text(s) => Value::Text(s.clone()),
                SharedValue::Bytes(b) => Value::Bytes(b.clone()),
                SharedValue::Gid(g) => Value::Gid(*g),
                SharedValue::Ref(gid) => Value::Ref(anchor(cx, *gid, &mut out)),
            };
            // The gid-defining assert is already emitted by `anchor`; avoid
            // duplicating it when the instruction itself is the anchor.
            if !(*attr == cx.gid_attr
                && out
                    .last()
                    .is_some_and(|i| matches!(i, Instruction::Assert { entity: e, attr: a, .. } if *e == entity && *a == cx.gid_attr)))
            {
                out.push(Instruction::Assert {
                    entity,
                    attr: *attr,
                    value,
                });
            }
        }
        SharedInstruction::Retract { entity, attr } => {
            let entity = anchor(cx, *entity, &mut out);
            out.push(Instruction::Retract {
                entity,
                attr: *attr,
            });
        }
        SharedInstruction::RetractEntity { entity } => {
            let entity = anchor(cx, *entity, &mut out);
            out.push(Instruction::RetractEntity { entity });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const GID_ATTR: Attr = Attr(0);

    fn mapping_with(bindings: &[(u64, Gid)]) -> IdMapping {
        let mut mapping = IdMapping::default();
        for (lid, gid) in bindings {
            mapping.insert(Lid::from(*lid), *gid);
        }
        mapping
    }

    #[test]
    fn private_instruction_has_no_shared_form() {
        let mapping = IdMapping::default();
        let cx = EncodeContext {
            gid_attr: GID_ATTR,
            mapping: &mapping,
        };
        let instr = Instruction::Assert {
            entity: Lid::from(1),
            attr: Attr(5),
            value: Value::U64(3),
        };
        assert_eq!(encode(&cx, &instr), None);
    }

    #[test]
    fn replicated_assert_encodes() {
        let mut rng = rand::thread_rng();
        let gid = Gid::random(&mut rng);
        let mapping = mapping_with(&[(1, gid)]);
        let cx = EncodeContext {
            gid_attr: GID_ATTR,
            mapping: &mapping,
        };
        let instr = Instruction::Assert {
            entity: Lid::from(1),
            attr: Attr(5),
            value: Value::Text("hi".into()),
        };
        assert_eq!(
            encode(&cx, &instr),
            Some(SharedInstruction::Assert {
                entity: gid,
                attr: Attr(5),
                value: SharedValue::Text("hi".into()),
            })
        );
    }

    #[test]
    fn ref_to_private_entity_is_not_encodable() {
        let mut rng = rand::thread_rng();
        let gid = Gid::random(&mut rng);
        let mapping = mapping_with(&[(1, gid)]);
        let cx = EncodeContext {
            gid_attr: GID_ATTR,
            mapping: &mapping,
        };
        let instr = Instruction::Assert {
            entity: Lid::from(1),
            attr: Attr(5),
            value: Value::Ref(Lid::from(99)),
        };
        assert_eq!(encode(&cx, &instr), None);
    }

    #[test]
    fn decode_of_unknown_gid_expands_to_anchor_plus_body() {
        let mut rng = rand::thread_rng();
        let gid = Gid::random(&mut rng);
        let mut cx = DecodeContext::new(GID_ATTR, IdMapping::default(), LidAlloc::starting_at(50));
        let shared = SharedInstruction::Assert {
            entity: gid,
            attr: Attr(5),
            value: SharedValue::U64(1),
        };
        let decoded = decode(&mut cx, &shared);
        assert_eq!(decoded.len(), 2);
        assert_eq!(
            decoded[0],
            Instruction::Assert {
                entity: Lid::from(50),
                attr: GID_ATTR,
                value: Value::Gid(gid),
            }
        );
        assert_eq!(
            decoded[1],
            Instruction::Assert {
                entity: Lid::from(50),
                attr: Attr(5),
                value: Value::U64(1),
            }
        );
        // The binding is now part of the context.
        assert_eq!(cx.mapping.lid(&gid), Some(Lid::from(50)));
    }

    #[test]
    fn decode_of_known_gid_is_a_single_instruction() {
        let mut rng = rand::thread_rng();
        let gid = Gid::random(&mut rng);
        let mut cx =
            DecodeContext::new(GID_ATTR, mapping_with(&[(7, gid)]), LidAlloc::starting_at(50));
        let shared = SharedInstruction::Retract {
            entity: gid,
            attr: Attr(5),
        };
        let decoded = decode(&mut cx, &shared);
        assert_eq!(
            decoded,
            vec![Instruction::Retract {
                entity: Lid::from(7),
                attr: Attr(5),
            }]
        );
    }

    #[test]
    fn decode_anchor_is_not_duplicated_for_gid_asserts() {
        let mut rng = rand::thread_rng();
        let gid = Gid::random(&mut rng);
        let mut cx = DecodeContext::new(GID_ATTR, IdMapping::default(), LidAlloc::starting_at(10));
        let shared = SharedInstruction::Assert {
            entity: gid,
            attr: GID_ATTR,
            value: SharedValue::Gid(gid),
        };
        let decoded = decode(&mut cx, &shared);
        assert_eq!(decoded.len(), 1);
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            any::<u64>().prop_map(Value::U64),
            "[a-z]{0,12}".prop_map(Value::Text),
            Just(Value::Ref(Lid::from(2))),
            any::<[u8; 16]>().prop_map(|b| Value::Gid(Gid::from_bytes(b))),
        ]
    }

    proptest! {
        /// Encoding then decoding a replicated-domain instruction against
        /// the same mapping yields the original instruction back.
        #[test]
        fn roundtrip_with_known_entities(
            attr in 1u32..100,
            seed in any::<[u8; 16]>(),
            seed2 in any::<[u8; 16]>(),
            value in arb_value(),
        ) {
            let gid = Gid::from_bytes(seed);
            let ref_gid = Gid::from_bytes(seed2);
            prop_assume!(gid != ref_gid);
            let mapping = mapping_with(&[(1, gid), (2, ref_gid)]);
            let instr = Instruction::Assert {
                entity: Lid::from(1),
                attr: Attr(attr),
                value,
            };
            let cx = EncodeContext { gid_attr: GID_ATTR, mapping: &mapping };
            let shared = encode(&cx, &instr).unwrap();
            let mut dcx = DecodeContext::new(GID_ATTR, mapping.clone(), LidAlloc::starting_at(100));
            let decoded = decode(&mut dcx, &shared);
            prop_assert_eq!(decoded, vec![instr]);
        }
    }
}
