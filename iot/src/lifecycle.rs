//! Actor identity, termination watching and reply addressing
//!
//! Every actor runs as a tokio task draining a bounded mailbox. An actor is
//! considered terminated once its mailbox receiver is gone, which is what
//! [`Watchable::terminated`] waits for. [`DeathWatch`] turns those
//! terminations into messages in the watcher's own mailbox.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// Identity of one spawned actor
///
/// Handles compare and hash by this id, so two handles are equal exactly
/// when they address the same actor instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(Uuid);

impl ActorId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ActorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A handle whose actor can be observed for termination
pub trait Watchable {
    /// Identity of the addressed actor
    fn actor_id(&self) -> ActorId;

    /// Resolves once the actor has stopped and its mailbox is closed
    fn terminated(&self) -> impl Future<Output = ()> + Send + 'static;

    /// Whether the actor has already stopped
    fn is_terminated(&self) -> bool;
}

/// Implements [`Watchable`] for a handle with `id: ActorId` and `tx: mpsc::Sender<_>` fields
macro_rules! impl_watchable {
    ($handle:ty) => {
        impl $crate::lifecycle::Watchable for $handle {
            fn actor_id(&self) -> $crate::lifecycle::ActorId {
                self.id
            }

            fn terminated(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
                let tx = self.tx.clone();
                async move { tx.closed().await }
            }

            fn is_terminated(&self) -> bool {
                self.tx.is_closed()
            }
        }

        impl PartialEq for $handle {
            fn eq(&self, other: &Self) -> bool {
                self.id == other.id
            }
        }

        impl Eq for $handle {}

        impl std::hash::Hash for $handle {
            fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                self.id.hash(state);
            }
        }
    };
}

pub(crate) use impl_watchable;

/// Observes a set of actors and posts an event for each one that terminates
///
/// Holds only a weak sender to the watcher's mailbox, so an actor watching
/// its children does not keep itself alive. Dropping the `DeathWatch` stops
/// all observation.
pub struct DeathWatch<E> {
    events: mpsc::WeakSender<E>,
    watchers: HashMap<ActorId, JoinHandle<()>>,
}

impl<E: Send + 'static> DeathWatch<E> {
    /// Create a watch that delivers termination events into `events`
    pub fn new(events: mpsc::WeakSender<E>) -> Self {
        Self {
            events,
            watchers: HashMap::new(),
        }
    }

    /// Start observing `target`; `event` is posted once it terminates
    ///
    /// Watching an already watched actor replaces the previous observer.
    pub fn watch<W: Watchable>(&mut self, target: &W, event: E) {
        let actor_id = target.actor_id();
        debug!(%actor_id, "DeathWatch::watch: called");
        let terminated = target.terminated();
        let events = self.events.clone();

        let observer = tokio::spawn(async move {
            terminated.await;
            debug!(%actor_id, "DeathWatch: actor terminated");
            if let Some(events) = events.upgrade() {
                let _ = events.send(event).await;
            }
        });

        if let Some(previous) = self.watchers.insert(actor_id, observer) {
            previous.abort();
        }
    }

    /// Stop observing one actor
    pub fn unwatch(&mut self, actor_id: ActorId) {
        debug!(%actor_id, "DeathWatch::unwatch: called");
        if let Some(observer) = self.watchers.remove(&actor_id) {
            observer.abort();
        }
    }

    /// Number of actors currently observed
    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }
}

impl<E> Drop for DeathWatch<E> {
    fn drop(&mut self) {
        for (_, observer) in self.watchers.drain() {
            observer.abort();
        }
    }
}

/// Where an actor delivers its answer to a request
#[derive(Debug)]
pub enum ReplyTo<T> {
    /// A single caller awaiting this one answer
    Caller(oneshot::Sender<T>),

    /// Another actor's mailbox
    Mailbox(mpsc::Sender<T>),
}

impl<T: Send + 'static> ReplyTo<T> {
    /// Deliver the answer without waiting, returning false if the recipient is gone
    pub fn send(self, msg: T) -> bool {
        match self {
            Self::Caller(tx) => tx.send(msg).is_ok(),
            Self::Mailbox(tx) => post(&tx, msg).is_ok(),
        }
    }
}

/// Enqueue `msg` without waiting for mailbox space
///
/// A full mailbox receives the message from a background task so the sending
/// actor keeps draining its own mailbox. Only a closed mailbox hands the
/// message back. Messages that take the background path may overtake each
/// other.
pub(crate) fn post<T: Send + 'static>(tx: &mpsc::Sender<T>, msg: T) -> Result<(), T> {
    match tx.try_send(msg) {
        Ok(()) => Ok(()),
        Err(TrySendError::Closed(msg)) => Err(msg),
        Err(TrySendError::Full(msg)) => {
            debug!("post: mailbox full, delivering in background");
            let tx = tx.clone();
            tokio::spawn(async move {
                if tx.send(msg).await.is_err() {
                    debug!("post: mailbox closed before delivery");
                }
            });
            Ok(())
        }
    }
}
