//! Observable state container.
//!
//! Every store keeps its whole state in one immutable snapshot. Mutations
//! build the next snapshot from a copy and swap it in; listeners are called
//! once per committed mutation with the previous and the current snapshot.
//! Unchanged parts keep their `Arc`s, so consumers can memoize on pointer
//! equality.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::oneshot;

use crate::lock::lock;

/// Anything that can identify a cached resource.
pub trait Payload: Clone + Serialize + Send + Sync + 'static {}
impl<P: Clone + Serialize + Send + Sync + 'static> Payload for P {}

/// Cached data. Equality decides whether a fetch result replaces the old value.
pub trait Data: Clone + PartialEq + Send + Sync + 'static {}
impl<T: Clone + PartialEq + Send + Sync + 'static> Data for T {}

/// Normalized error kept in state.
pub trait StoredError: Clone + Send + Sync + 'static {}
impl<E: Clone + Send + Sync + 'static> StoredError for E {}

type Listener<S> = Arc<dyn Fn(&S, &S) + Send + Sync>;

struct StoreInner<S> {
  state: Mutex<Arc<S>>,
  listeners: Mutex<Vec<(u64, Listener<S>)>>,
  next_listener_id: AtomicU64,
}

pub struct Store<S> {
  inner: Arc<StoreInner<S>>,
}

impl<S> Clone for Store<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S: Clone + Send + Sync + 'static> Store<S> {
  pub fn new(initial: S) -> Self {
    Self {
      inner: Arc::new(StoreInner {
        state: Mutex::new(Arc::new(initial)),
        listeners: Mutex::new(Vec::new()),
        next_listener_id: AtomicU64::new(0),
      }),
    }
  }

  /// Current snapshot.
  pub fn state(&self) -> Arc<S> {
    Arc::clone(&lock(&self.inner.state, "store.state"))
  }

  /// Register a listener called with `(previous, current)` after every commit.
  ///
  /// The listener stays registered until the returned [`Subscription`] is dropped.
  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(&S, &S) + Send + Sync + 'static,
  {
    let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
    lock(&self.inner.listeners, "store.subscribe").push((id, Arc::new(listener)));

    let weak: Weak<StoreInner<S>> = Arc::downgrade(&self.inner);
    Subscription {
      unsubscribe: Some(Box::new(move || {
        if let Some(inner) = weak.upgrade() {
          lock(&inner.listeners, "store.unsubscribe").retain(|(other, _)| *other != id);
        }
      })),
    }
  }

  pub fn listener_count(&self) -> usize {
    lock(&self.inner.listeners, "store.listener_count").len()
  }

  /// Apply `recipe` to a copy of the state. The copy is committed and
  /// listeners are notified only when the recipe reports a change.
  pub fn update(&self, recipe: impl FnOnce(&mut S) -> bool) -> bool {
    let (previous, current) = {
      let mut guard = lock(&self.inner.state, "store.update");
      let mut next = S::clone(&guard);
      if !recipe(&mut next) {
        return false;
      }
      let next = Arc::new(next);
      let previous = std::mem::replace(&mut *guard, Arc::clone(&next));
      (previous, next)
    };

    self.notify(&previous, &current);
    true
  }

  /// Replace the whole state and notify.
  pub fn set_state(&self, state: S) {
    let current = Arc::new(state);
    let previous = {
      let mut guard = lock(&self.inner.state, "store.set_state");
      std::mem::replace(&mut *guard, Arc::clone(&current))
    };
    self.notify(&previous, &current);
  }

  /// Subscribe, run `kick`, then resolve with the first value `pick` extracts
  /// from a commit. `None` if the store went away first.
  pub(crate) async fn wait_for<R, F>(&self, pick: F, kick: impl FnOnce()) -> Option<R>
  where
    R: Send + 'static,
    F: Fn(&S, &S) -> Option<R> + Send + Sync + 'static,
  {
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    let _subscription = self.subscribe(move |previous, current| {
      let Some(value) = pick(previous, current) else {
        return;
      };
      if let Some(tx) = lock(&tx, "store.wait_for").take() {
        let _ = tx.send(value);
      }
    });

    kick();
    rx.await.ok()
  }

  fn notify(&self, previous: &S, current: &S) {
    // Listeners may subscribe or unsubscribe while being called.
    let listeners: Vec<Listener<S>> = lock(&self.inner.listeners, "store.notify")
      .iter()
      .map(|(_, listener)| Arc::clone(listener))
      .collect();

    for listener in listeners {
      listener(previous, current);
    }
  }
}

/// Keeps a listener registered; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
  unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
  /// Combine several subscriptions into one handle.
  pub fn merge(subscriptions: Vec<Subscription>) -> Subscription {
    Subscription {
      unsubscribe: Some(Box::new(move || drop(subscriptions))),
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(unsubscribe) = self.unsubscribe.take() {
      unsubscribe();
    }
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("active", &self.unsubscribe.is_some())
      .finish()
  }
}
