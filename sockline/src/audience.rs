//! Publish/subscribe with callback and channel listeners.
//!
//! Listeners are snapshotted under the lock and invoked outside it, so a
//! listener may subscribe, unsubscribe or emit again without deadlocking.

use crate::sync::Mutex;
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle returned by a subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl ListenerId {
  fn next() -> Self {
    Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
  }
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

enum Listener<E> {
  Callback(Callback<E>),
  Channel(Sender<E>),
}

impl<E> Clone for Listener<E> {
  fn clone(&self) -> Self {
    match self {
      Self::Callback(f) => Self::Callback(f.clone()),
      Self::Channel(tx) => Self::Channel(tx.clone()),
    }
  }
}

/// A list of listeners for one kind of event.
pub struct Audience<E> {
  listeners: Mutex<Vec<(ListenerId, Listener<E>)>>,
}

impl<E> Default for Audience<E> {
  fn default() -> Self {
    Self { listeners: Mutex::new(Vec::new()) }
  }
}

impl<E: Clone> Audience<E> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers a callback. It runs on whichever thread emits.
  pub fn subscribe<F>(&self, f: F) -> ListenerId
  where
    F: Fn(&E) + Send + Sync + 'static,
  {
    let id = ListenerId::next();
    self.listeners.lock().push((id, Listener::Callback(Arc::new(f))));
    id
  }

  /// Registers a channel. The listener is dropped once the receiving side
  /// hangs up.
  pub fn subscribe_channel(&self, tx: Sender<E>) -> ListenerId {
    let id = ListenerId::next();
    self.listeners.lock().push((id, Listener::Channel(tx)));
    id
  }

  /// Returns `true` if `id` was subscribed.
  pub fn unsubscribe(&self, id: ListenerId) -> bool {
    let mut listeners = self.listeners.lock();
    let before = listeners.len();
    listeners.retain(|(other, _)| *other != id);
    listeners.len() != before
  }

  pub fn len(&self) -> usize {
    self.listeners.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Delivers `event` to every listener in subscription order.
  pub fn notify(&self, event: &E) {
    let snapshot = self.listeners.lock().clone();
    let mut dead = Vec::new();

    for (id, listener) in snapshot {
      match listener {
        Listener::Callback(f) => f(event),
        Listener::Channel(tx) => {
          if tx.send(event.clone()).is_err() {
            dead.push(id);
          }
        }
      }
    }

    if !dead.is_empty() {
      self.listeners.lock().retain(|(id, _)| !dead.contains(id));
    }
  }
}
