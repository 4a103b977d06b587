//! Active consumers of cached resources.
//!
//! A resource with at least one on-screen [`Consumer`] is *active*:
//! invalidations refetch it right away. Inactive resources only record the
//! pending refetch priority, which the next consumer to become active
//! consumes with a single fetch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Weak};

use crate::cache_key::CacheKey;
use crate::lock::lock;

/// Store side of a consumer: where pending refetches are consumed.
pub(crate) trait RefetchTarget: Send + Sync {
  fn consumers(&self) -> &ConsumerRegistry;

  /// Clear the pending refetch of `key` (if any) and schedule it.
  fn consume_pending(&self, key: &CacheKey);
}

/// On-screen consumer counts per resource key.
#[derive(Debug, Default)]
pub(crate) struct ConsumerRegistry {
  on_screen: Mutex<HashMap<CacheKey, usize>>,
}

impl ConsumerRegistry {
  pub(crate) fn is_active(&self, key: &CacheKey) -> bool {
    lock(&self.on_screen, "consumers.is_active")
      .get(key)
      .is_some_and(|count| *count > 0)
  }

  fn activate(&self, key: &CacheKey) {
    *lock(&self.on_screen, "consumers.activate")
      .entry(key.clone())
      .or_default() += 1;
  }

  fn deactivate(&self, key: &CacheKey) {
    let mut on_screen = lock(&self.on_screen, "consumers.deactivate");
    if let Some(count) = on_screen.get_mut(key) {
      *count = count.saturating_sub(1);
      if *count == 0 {
        on_screen.remove(key);
      }
    }
  }
}

/// Handle held by whatever renders a resource (a view, a hook, a poller).
///
/// Dropping it detaches the consumer.
pub struct Consumer {
  key: CacheKey,
  target: Weak<dyn RefetchTarget>,
  off_screen: AtomicBool,
}

impl Consumer {
  pub(crate) fn attach(target: Weak<dyn RefetchTarget>, key: CacheKey) -> Self {
    if let Some(store) = target.upgrade() {
      store.consumers().activate(&key);
      store.consume_pending(&key);
    }
    Self {
      key,
      target,
      off_screen: AtomicBool::new(false),
    }
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn is_off_screen(&self) -> bool {
    self.off_screen.load(Ordering::SeqCst)
  }

  /// While off-screen this consumer does not make its resource active, so
  /// invalidations are only recorded. Coming back on-screen replays at most
  /// one catch-up fetch for everything recorded meanwhile.
  pub fn set_off_screen(&self, off_screen: bool) {
    if self.off_screen.swap(off_screen, Ordering::SeqCst) == off_screen {
      return;
    }
    let Some(store) = self.target.upgrade() else {
      return;
    };
    if off_screen {
      store.consumers().deactivate(&self.key);
    } else {
      store.consumers().activate(&self.key);
      store.consume_pending(&self.key);
    }
  }
}

impl Drop for Consumer {
  fn drop(&mut self) {
    if self.is_off_screen() {
      return;
    }
    if let Some(store) = self.target.upgrade() {
      store.consumers().deactivate(&self.key);
    }
  }
}

impl std::fmt::Debug for Consumer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Consumer")
      .field("key", &self.key)
      .field("off_screen", &self.is_off_screen())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[derive(Default)]
  struct Target {
    consumers: ConsumerRegistry,
    consumed: Mutex<Vec<CacheKey>>,
  }

  impl RefetchTarget for Target {
    fn consumers(&self) -> &ConsumerRegistry {
      &self.consumers
    }

    fn consume_pending(&self, key: &CacheKey) {
      self.consumed.lock().unwrap().push(key.clone());
    }
  }

  fn target() -> (Arc<Target>, Weak<dyn RefetchTarget>) {
    let target = Arc::new(Target::default());
    let weak = Arc::downgrade(&target) as Weak<dyn RefetchTarget>;
    (target, weak)
  }

  #[test]
  fn test_attach_activates_and_consumes() {
    let (target, weak) = target();
    let key = CacheKey::of("users||1");

    let consumer = Consumer::attach(weak, key.clone());
    assert!(target.consumers.is_active(&key));
    assert_eq!(*target.consumed.lock().unwrap(), vec![key.clone()]);

    drop(consumer);
    assert!(!target.consumers.is_active(&key));
  }

  #[test]
  fn test_off_screen_consumer_is_inactive_until_back() {
    let (target, weak) = target();
    let key = CacheKey::of("users||1");

    let consumer = Consumer::attach(weak, key.clone());
    consumer.set_off_screen(true);
    consumer.set_off_screen(true);
    assert!(!target.consumers.is_active(&key));

    consumer.set_off_screen(false);
    assert!(target.consumers.is_active(&key));
    assert_eq!(target.consumed.lock().unwrap().len(), 2);

    consumer.set_off_screen(true);
    drop(consumer);
    assert!(!target.consumers.is_active(&key));
  }

  #[test]
  fn test_counts_are_per_key() {
    let (target, weak) = target();
    let a = CacheKey::of("a");
    let b = CacheKey::of("b");

    let first = Consumer::attach(weak.clone(), a.clone());
    let second = Consumer::attach(weak, a.clone());
    drop(first);

    assert!(target.consumers.is_active(&a));
    assert!(!target.consumers.is_active(&b));
    drop(second);
    assert!(!target.consumers.is_active(&a));
  }
}
