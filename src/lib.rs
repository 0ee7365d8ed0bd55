//! Client-side reconciliation for a replicated, transactional, in-memory
//! database.
//!
//! A replica applies changes optimistically against its local snapshot,
//! sends their replicated portion to a central sequencer, and keeps every
//! unconfirmed change in a [rebase log](log::RebaseLog). Remote
//! transactions arrive in confirmed order and move the committed base; the
//! log then recomputes all pending local changes on top of the new base,
//! cheaply by [replay](entry::RebaseLogEntry::replay) where their
//! assumptions still hold and by re-running their
//! [recipe](block::Recipe) where they do not. Acknowledgements from the
//! sequencer retire entries from the front of the log, strictly in order,
//! releasing their [effects](data::Effects) exactly once.
//!
//! The [`actor::SessionHandle`] wraps the whole state machine in an actor
//! thread, exposing an async interface for the connection layer.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod actor;
pub mod block;
pub mod clock;
pub mod data;
pub mod engine;
pub mod entry;
pub mod instruction;
pub mod log;
pub mod memo;
pub mod store;
pub mod transaction;

pub use self::actor::{Event, SessionConfig, SessionHandle};
pub use self::data::{Attr, Datom, Effects, Gid, IdMapping, Lid, Novelty, Value};
pub use self::engine::{Applied, ApplyError, SnapshotEngine};
pub use self::log::{AckOutcome, OutOfSync, RebaseLog};
pub use self::transaction::{ReplicaId, Transaction, TransactionAck, TransactionId};
