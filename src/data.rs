//! Core data model: entities, datoms, novelty, and identifier mappings.

use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Display},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Process-local handle for an entity.
///
/// Cheap to copy and compare, but meaningless outside the process that
/// minted it. Use [`Gid`] for anything that crosses the wire.
#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lid(u64);

impl Lid {
    /// The numeric value of this local id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Debug for Lid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lid({})", self.0)
    }
}

impl Display for Lid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l{}", self.0)
    }
}

impl From<u64> for Lid {
    fn from(value: u64) -> Self {
        Lid(value)
    }
}

/// Allocator for fresh [`Lid`]s.
///
/// Shared between the engine and the codec so that decoding a remote
/// transaction can mint local handles for entities it has never seen.
#[derive(Debug, Clone, Default)]
pub struct LidAlloc(Arc<AtomicU64>);

impl LidAlloc {
    /// Create an allocator that starts handing out ids at `next`.
    pub fn starting_at(next: u64) -> Self {
        LidAlloc(Arc::new(AtomicU64::new(next)))
    }

    /// Mint a fresh local id.
    pub fn next(&self) -> Lid {
        Lid(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Globally stable identifier for a replicated entity.
///
/// Assigned once, random, and portable across replicas.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Gid([u8; 16]);

impl Gid {
    /// Generate a fresh random global id.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill(&mut bytes);
        Gid(bytes)
    }

    /// Construct from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Gid(bytes)
    }

    /// The raw bytes of this id.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gid({}…)", &hex::encode(self.0)[..8])
    }
}

impl Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Attribute identity.
///
/// The datom schema itself lives in an external registry; this crate only
/// needs attributes to be comparable, and needs to be told which one is the
/// GID-defining attribute.
#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Attr(pub u32);

impl Debug for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Attr({})", self.0)
    }
}

impl Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a{}", self.0)
    }
}

/// A datom value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    /// Boolean flag.
    Bool(bool),
    /// Unsigned integer.
    U64(u64),
    /// UTF-8 text.
    Text(String),
    /// Opaque bytes.
    Bytes(Bytes),
    /// Reference to another local entity.
    Ref(Lid),
    /// A global id, as stored under the GID-defining attribute.
    Gid(Gid),
}

/// One fact: entity, attribute, value, and whether it was added or retracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datom {
    /// The entity this fact is about.
    pub entity: Lid,
    /// The attribute.
    pub attr: Attr,
    /// The value.
    pub value: Value,
    /// `true` for an assertion, `false` for a retraction.
    pub added: bool,
}

impl Datom {
    /// An assertion datom.
    pub fn added(entity: Lid, attr: Attr, value: Value) -> Self {
        Datom {
            entity,
            attr,
            value,
            added: true,
        }
    }

    /// A retraction datom.
    pub fn retracted(entity: Lid, attr: Attr, value: Value) -> Self {
        Datom {
            entity,
            attr,
            value,
            added: false,
        }
    }
}

/// The ordered set of facts produced by one change.
///
/// Composable with [`Novelty::merge`]; [`Novelty::default`] is the identity
/// element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Novelty(Vec<Datom>);

impl Novelty {
    /// Append a datom.
    pub fn push(&mut self, datom: Datom) {
        self.0.push(datom);
    }

    /// Append all datoms of `other`, preserving order.
    pub fn merge(&mut self, other: Novelty) {
        self.0.extend(other.0);
    }

    /// Whether this change produced no facts.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of datoms.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over the datoms in production order.
    pub fn iter(&self) -> std::slice::Iter<'_, Datom> {
        self.0.iter()
    }

    /// Keep only the datoms whose entity satisfies `keep`.
    pub fn filtered(&self, mut keep: impl FnMut(Lid) -> bool) -> Novelty {
        Novelty(self.0.iter().filter(|d| keep(d.entity)).cloned().collect())
    }
}

impl IntoIterator for Novelty {
    type Item = Datom;
    type IntoIter = std::vec::IntoIter<Datom>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<Datom> for Novelty {
    fn from_iter<T: IntoIterator<Item = Datom>>(iter: T) -> Self {
        Novelty(iter.into_iter().collect())
    }
}

/// Opaque side effects produced by applying a change.
///
/// The engine treats these as payloads to be delivered exactly once, in
/// order, when the change they belong to is confirmed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Effects(Vec<Bytes>);

impl Effects {
    /// Append one effect payload.
    pub fn push(&mut self, effect: Bytes) {
        self.0.push(effect);
    }

    /// Append all effects of `other`, preserving order.
    pub fn merge(&mut self, other: Effects) {
        self.0.extend(other.0);
    }

    /// Whether there are no effects.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of effect payloads.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over the payloads in production order.
    pub fn iter(&self) -> std::slice::Iter<'_, Bytes> {
        self.0.iter()
    }
}

impl FromIterator<Bytes> for Effects {
    fn from_iter<T: IntoIterator<Item = Bytes>>(iter: T) -> Self {
        Effects(iter.into_iter().collect())
    }
}

/// Synchronization scope of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Domain {
    /// Visible to the sequencer and other replicas.
    Replicated,
    /// Local to this process, never transmitted.
    Private,
}

/// Map from local to global identifiers.
///
/// Produced as a side effect of applying a change whenever a replicated
/// entity receives its GID-defining attribute; cumulative within a log
/// entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    forward: BTreeMap<Lid, Gid>,
    reverse: BTreeMap<Gid, Lid>,
}

impl IdMapping {
    /// Record a binding.
    pub fn insert(&mut self, lid: Lid, gid: Gid) {
        if let Some(old) = self.forward.insert(lid, gid) {
            if old != gid {
                self.reverse.remove(&old);
            }
        }
        self.reverse.insert(gid, lid);
    }

    /// The global id bound to `lid`, if any.
    pub fn gid(&self, lid: Lid) -> Option<Gid> {
        self.forward.get(&lid).copied()
    }

    /// The local id bound to `gid`, if any.
    pub fn lid(&self, gid: &Gid) -> Option<Lid> {
        self.reverse.get(gid).copied()
    }

    /// Whether `lid` has a global binding.
    pub fn contains(&self, lid: Lid) -> bool {
        self.forward.contains_key(&lid)
    }

    /// Merge all bindings of `other` into this mapping.
    pub fn merge(&mut self, other: &IdMapping) {
        for (l, g) in other.iter() {
            self.insert(*l, *g);
        }
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Iterate over the bindings.
    pub fn iter(&self) -> std::collections::btree_map::Iter<'_, Lid, Gid> {
        self.forward.iter()
    }
}
