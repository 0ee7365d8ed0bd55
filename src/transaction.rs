//! Transaction framing: the unit sent to and received from the sequencer.

use std::fmt::{self, Debug, Display};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::instruction::SharedInstruction;

/// Identity of one replica.
#[derive(
    Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ReplicaId([u8; 16]);

impl ReplicaId {
    /// Generate a fresh random replica id.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill(&mut bytes);
        ReplicaId(bytes)
    }

    /// Construct from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        ReplicaId(bytes)
    }

    /// The raw bytes of this id.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Shortened hex form for log output.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaId({}…)", self.fmt_short())
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Identity of one transaction.
///
/// Freshly randomized every time the transaction's content changes, so the
/// sequencer can tell a re-derived transaction from a re-send of the same
/// content.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId([u8; 16]);

impl TransactionId {
    /// Generate a fresh random transaction id.
    pub fn random() -> Self {
        TransactionId(rand::thread_rng().gen())
    }

    /// Construct from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        TransactionId(bytes)
    }

    /// The raw bytes of this id.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Shortened hex form for log output.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({}…)", self.fmt_short())
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A unit of replicated change, addressed entirely by global ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// The encoded mutations, in application order.
    pub instructions: Vec<SharedInstruction>,
    /// The replica that created this transaction.
    pub origin: ReplicaId,
    /// The origin's logical clock tick at send time.
    pub index: u64,
    /// Content identity; changes whenever `instructions` change.
    pub id: TransactionId,
}

impl Transaction {
    /// Frame `instructions` as a new transaction with a fresh id.
    pub fn new(instructions: Vec<SharedInstruction>, origin: ReplicaId, index: u64) -> Self {
        Transaction {
            instructions,
            origin,
            index,
            id: TransactionId::random(),
        }
    }

    /// Replace the content, randomizing the id.
    ///
    /// Keeps origin and index: the transaction still occupies the same
    /// logical slot in its origin's sequence.
    pub fn with_instructions(&self, instructions: Vec<SharedInstruction>) -> Self {
        Transaction {
            instructions,
            origin: self.origin,
            index: self.index,
            id: TransactionId::random(),
        }
    }

    /// Serialize for the wire.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(postcard::to_stdvec(self)?)
    }

    /// Deserialize from the wire.
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Sequencer acknowledgement for one of our own transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAck {
    /// The acknowledged transaction.
    pub tx: TransactionId,
    /// Whether the sequencer rejected the transaction.
    pub failed: bool,
}

impl TransactionAck {
    /// Serialize for the wire.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(postcard::to_stdvec(self)?)
    }

    /// Deserialize from the wire.
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}
