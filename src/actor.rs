//! This contains an actor spawned on a separate thread which owns a
//! replica's rebase log and processes commits, confirmations, and
//! acknowledgements sequentially.

use std::{sync::Arc, thread::JoinHandle};

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tracing::{debug, error, error_span, trace, warn};

use crate::block::Recipe;
use crate::clock::LogicalClock;
use crate::data::{Attr, Effects, Novelty};
use crate::engine::SnapshotEngine;
use crate::entry::RebaseLogEntry;
use crate::log::{AckOutcome, RebaseLog};
use crate::transaction::{ReplicaId, Transaction, TransactionAck, TransactionId};

/// Notification emitted to session subscribers.
#[derive(Debug, Clone)]
pub enum Event {
    /// A local change was applied optimistically; it is not confirmed yet.
    LocalChange {
        /// All facts the change produced, private domain included.
        novelty: Novelty,
    },
    /// A confirmed transaction from another replica was applied.
    RemoteChange {
        /// The transaction that was applied.
        transaction: TransactionId,
        /// Facts produced by applying it.
        novelty: Novelty,
    },
    /// One of our own transactions was confirmed by the sequencer.
    Confirmed {
        /// The confirmed transaction.
        transaction: TransactionId,
        /// Replicated-domain facts of the retired entries.
        novelty: Novelty,
        /// Effects of the retired entries, due for delivery now.
        effects: Effects,
    },
    /// Local and remote state diverged irrecoverably; the session stopped.
    Desynced {
        /// Human-readable cause.
        reason: String,
    },
}

/// What a commit produced.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// The framed transaction sent to the sequencer, `None` when the change
    /// stayed in the private domain.
    pub transaction: Option<TransactionId>,
    /// All facts the change produced.
    pub novelty: Novelty,
    /// Effects the change produced; delivered via [`Event::Confirmed`] once
    /// the sequencer confirms.
    pub effects: Effects,
}

#[derive(Debug, strum::Display)]
enum Action<E: SnapshotEngine> {
    Commit {
        recipe: Box<dyn Recipe<E>>,
        reply: oneshot::Sender<Result<CommitOutcome>>,
    },
    Confirmed {
        transaction: Transaction,
        reply: oneshot::Sender<Result<()>>,
    },
    Ack {
        ack: TransactionAck,
        reply: oneshot::Sender<Result<AckOutcome>>,
    },
    Subscribe {
        sender: flume::Sender<Event>,
        reply: oneshot::Sender<()>,
    },
    Head {
        reply: oneshot::Sender<E::Snapshot>,
    },
    Committed {
        reply: oneshot::Sender<E::Snapshot>,
    },
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Static configuration of one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// This replica's identity.
    pub origin: ReplicaId,
    /// The GID-defining attribute of the underlying store.
    pub gid_attr: Attr,
    /// Starting value for the transaction index counter, for resuming a
    /// persisted session.
    pub clock_start: u64,
}

impl SessionConfig {
    /// Configuration for a fresh session.
    pub fn new(origin: ReplicaId, gid_attr: Attr) -> Self {
        SessionConfig {
            origin,
            gid_attr,
            clock_start: 0,
        }
    }
}

/// The [`SessionHandle`] controls an actor thread which owns the rebase
/// log of one replica.
///
/// The handle exposes async methods which all send messages into the actor
/// thread, returning results via a return channel. The actor thread itself
/// is a regular [`std::thread`] which processes incoming messages
/// sequentially, so log transitions never interleave.
///
/// The handle is cheaply cloneable. Once the last clone is dropped, the
/// actor thread is joined. To prevent that drop from blocking, call
/// [`SessionHandle::shutdown`] and await its result first.
#[derive(Debug, Clone)]
pub struct SessionHandle<E: SnapshotEngine> {
    tx: flume::Sender<Action<E>>,
    join_handle: Arc<Option<JoinHandle<()>>>,
}

impl<E: SnapshotEngine> SessionHandle<E> {
    /// Spawn a session actor and return a handle.
    ///
    /// `base` is the committed snapshot the log starts from; transactions
    /// that must reach the sequencer are pushed into `outbound`.
    pub fn spawn(
        engine: E,
        base: E::Snapshot,
        config: SessionConfig,
        outbound: flume::Sender<Transaction>,
    ) -> SessionHandle<E> {
        const ACTION_CAP: usize = 1024;
        let (action_tx, action_rx) = flume::bounded(ACTION_CAP);
        let origin = config.origin;
        let mut clock = LogicalClock::new();
        clock.register(origin, config.clock_start);
        let actor = Actor {
            engine,
            gid_attr: config.gid_attr,
            origin,
            log: RebaseLog::new(base),
            clock,
            outbound,
            subscribers: Vec::new(),
            action_rx,
            desynced: false,
        };
        let join_handle = std::thread::Builder::new()
            .name("session-actor".to_string())
            .spawn(move || {
                let span = error_span!("session", me = %origin.fmt_short());
                let _enter = span.enter();

                if let Err(err) = actor.run() {
                    error!("session actor closed with error: {err:?}");
                }
            })
            .expect("failed to spawn thread");
        let join_handle = Arc::new(Some(join_handle));
        SessionHandle {
            tx: action_tx,
            join_handle,
        }
    }

    /// Apply a change optimistically and queue it for confirmation.
    pub async fn commit(&self, recipe: Box<dyn Recipe<E>>) -> Result<CommitOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::Commit { recipe, reply }).await?;
        rx.await?
    }

    /// Feed a transaction confirmed by the sequencer.
    ///
    /// Confirmations of this replica's own transactions are ignored here;
    /// they are handled through [`SessionHandle::ack`].
    pub async fn confirmed(&self, transaction: Transaction) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::Confirmed { transaction, reply }).await?;
        rx.await?
    }

    /// Feed an acknowledgement for one of this replica's transactions.
    pub async fn ack(&self, ack: TransactionAck) -> Result<AckOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::Ack { ack, reply }).await?;
        rx.await?
    }

    /// Subscribe to session events.
    pub async fn subscribe(&self, sender: flume::Sender<Event>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::Subscribe { sender, reply }).await?;
        Ok(rx.await?)
    }

    /// The snapshot including every pending local change.
    pub async fn head(&self) -> Result<E::Snapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::Head { reply }).await?;
        Ok(rx.await?)
    }

    /// The confirmed snapshot, without pending local changes.
    pub async fn committed(&self) -> Result<E::Snapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::Committed { reply }).await?;
        Ok(rx.await?)
    }

    /// Stop the actor after it finishes the queued messages.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::Shutdown { reply: Some(reply) }).await.ok();
        Ok(rx.await?)
    }

    async fn send(&self, action: Action<E>) -> Result<()> {
        self.tx
            .send_async(action)
            .await
            .context("sending to session actor failed")?;
        Ok(())
    }
}

impl<E: SnapshotEngine> Drop for SessionHandle<E> {
    fn drop(&mut self) {
        // this means we're dropping the last reference
        if let Some(handle) = Arc::get_mut(&mut self.join_handle) {
            self.tx.send(Action::Shutdown { reply: None }).ok();
            let handle = handle.take().expect("this can only run once");
            if let Err(err) = handle.join() {
                warn!(?err, "failed to join session actor");
            }
        }
    }
}

struct Actor<E: SnapshotEngine> {
    engine: E,
    gid_attr: Attr,
    origin: ReplicaId,
    log: RebaseLog<E>,
    clock: LogicalClock,
    outbound: flume::Sender<Transaction>,
    subscribers: Vec<flume::Sender<Event>>,
    action_rx: flume::Receiver<Action<E>>,
    desynced: bool,
}

impl<E: SnapshotEngine> Actor<E> {
    fn run(mut self) -> Result<()> {
        while let Ok(action) = self.action_rx.recv() {
            trace!(%action, "tick");
            match action {
                Action::Shutdown { reply } => {
                    if let Some(reply) = reply {
                        reply.send(()).ok();
                    }
                    break;
                }
                action => {
                    if self.on_action(action).is_err() {
                        warn!("failed to send reply: receiver dropped");
                    }
                    if self.desynced {
                        break;
                    }
                }
            }
        }
        debug!("shutdown");
        Ok(())
    }

    fn on_action(&mut self, action: Action<E>) -> Result<(), SendReplyError> {
        match action {
            Action::Shutdown { .. } => {
                unreachable!("Shutdown action should be handled in run()")
            }
            Action::Commit { recipe, reply } => {
                let res = self.commit(recipe);
                send_reply(reply, res)
            }
            Action::Confirmed { transaction, reply } => {
                let res = self.confirmed(transaction);
                send_reply(reply, res)
            }
            Action::Ack { ack, reply } => {
                let res = self.ack(ack);
                send_reply(reply, res)
            }
            Action::Subscribe { sender, reply } => {
                self.subscribers.push(sender);
                send_reply(reply, ())
            }
            Action::Head { reply } => send_reply(reply, self.log.head().clone()),
            Action::Committed { reply } => send_reply(reply, self.log.committed().clone()),
        }
    }

    fn commit(&mut self, recipe: Box<dyn Recipe<E>>) -> Result<CommitOutcome> {
        let mut mapping = self.engine.id_mapping(self.log.committed());
        mapping.merge(&self.log.speculative_mapping());
        for entry in self.log.rebasing().entries() {
            mapping.merge(&entry.id_mapping);
        }
        let base = self.log.head().clone();
        let (entry, novelty, effects) = RebaseLogEntry::from_recipe(
            &self.engine,
            self.gid_attr,
            &base,
            mapping,
            recipe,
            self.log.send_epoch(),
            |shared| {
                let index = self.clock.tick(self.origin)?;
                Ok(Transaction::new(shared, self.origin, index))
            },
        )?;
        let transaction = entry.transaction.clone();
        self.log.append(entry);
        debug_assert!(self.log.is_continuous());
        if let Some(tx) = &transaction {
            self.outbound
                .send(tx.clone())
                .context("outbound channel closed")?;
        }
        self.emit(Event::LocalChange {
            novelty: novelty.clone(),
        });
        Ok(CommitOutcome {
            transaction: transaction.map(|tx| tx.id),
            novelty,
            effects,
        })
    }

    fn confirmed(&mut self, transaction: Transaction) -> Result<()> {
        if transaction.origin == self.origin {
            // Our own transactions are settled by acknowledgements.
            trace!(tx = %transaction.id, "ignoring own confirmation");
            return Ok(());
        }
        let applied = match self
            .log
            .consume_tx(&self.engine, self.gid_attr, &transaction)
        {
            Ok(applied) => applied,
            Err(err) => {
                error!(tx = %transaction.id, "failed to apply confirmed transaction: {err:#}");
                self.desync(format!("confirmed transaction failed to apply: {err}"));
                return Err(err.into());
            }
        };
        let resend = self.log.drain_rebase(&self.engine, self.gid_attr);
        debug_assert!(self.log.is_continuous());
        for tx in resend {
            self.outbound
                .send(tx)
                .context("outbound channel closed")?;
        }
        self.emit(Event::RemoteChange {
            transaction: transaction.id,
            novelty: applied.novelty,
        });
        Ok(())
    }

    fn ack(&mut self, ack: TransactionAck) -> Result<AckOutcome> {
        match self.log.ack(&self.engine, ack.tx, ack.failed) {
            Ok(outcome) => {
                self.emit(Event::Confirmed {
                    transaction: ack.tx,
                    novelty: outcome.novelty.clone(),
                    effects: outcome.effects.clone(),
                });
                Ok(outcome)
            }
            Err(err) => {
                error!(tx = %ack.tx, "acknowledgement cannot be reconciled: {err}");
                self.desync(format!("unreconcilable acknowledgement: {err}"));
                Err(err.into())
            }
        }
    }

    fn desync(&mut self, reason: String) {
        self.emit(Event::Desynced { reason });
        self.desynced = true;
    }

    fn emit(&mut self, event: Event) {
        self.subscribers
            .retain(|sender| sender.send(event.clone()).is_ok());
    }
}

#[derive(Debug)]
struct SendReplyError;

fn send_reply<T>(sender: oneshot::Sender<T>, value: T) -> Result<(), SendReplyError> {
    sender.send(value).map_err(|_| SendReplyError)
}
