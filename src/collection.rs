//! Many independently keyed resources.
//!
//! Each item is addressed by a payload; its [`CacheKey`] selects the slot in
//! state and the [`FetchOrchestrator`] that serializes its fetches.
//! Orchestrators are created on first use and live as long as the store.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use color_eyre::{Report, Result};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde::Serialize;
use tracing::debug;

use crate::cache_key::CacheKey;
use crate::config::SyncConfig;
use crate::consumer::{Consumer, ConsumerRegistry, RefetchTarget};
use crate::document::Awaited;
use crate::error::{default_normalizer, ErrorNormalizer, FetchError};
use crate::matcher::{ItemMatcher, ResolvedItemMatcher};
use crate::orchestrator::{
  AbortSignal, FetchAttempt, FetchOrchestrator, OrchestratorConfig, OrchestratorRegistry,
};
use crate::priority::{merge_pending, FetchPriority, ScheduleResult};
use crate::status::Status;
use crate::store::{Data, Payload, Store, StoredError, Subscription};

type ItemFetchFn<P, T> = Arc<dyn Fn(P, AbortSignal) -> BoxFuture<'static, Result<T>> + Send + Sync>;
type InitialItemsFn<P, T> = Box<dyn FnOnce() -> Vec<(P, T)> + Send>;

/// One cached item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionItem<P, T, E = FetchError> {
  pub payload: P,
  pub status: Status,
  pub data: Option<Arc<T>>,
  pub error: Option<E>,
  pub was_loaded: bool,
  pub refetch_on_mount: Option<FetchPriority>,
}

impl<P, T, E> CollectionItem<P, T, E> {
  fn empty(payload: P) -> Self {
    Self {
      payload,
      status: Status::Idle,
      data: None,
      error: None,
      was_loaded: false,
      refetch_on_mount: None,
    }
  }

  fn loaded(payload: P, data: T) -> Self {
    Self {
      payload,
      status: Status::Success,
      data: Some(Arc::new(data)),
      error: None,
      was_loaded: true,
      refetch_on_mount: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionState<P, T, E = FetchError> {
  pub items: HashMap<CacheKey, Arc<CollectionItem<P, T, E>>>,
}

impl<P, T, E> Default for CollectionState<P, T, E> {
  fn default() -> Self {
    Self {
      items: HashMap::new(),
    }
  }
}

impl<P: Serialize, T, E> CollectionState<P, T, E> {
  pub fn get(&self, payload: &P) -> Option<&Arc<CollectionItem<P, T, E>>> {
    self.items.get(&CacheKey::of(payload))
  }
}

/// Construction options for a [`CollectionStore`].
pub struct CollectionOptions<P, T, E = FetchError> {
  label: String,
  fetch_fn: ItemFetchFn<P, T>,
  error_normalizer: ErrorNormalizer<E>,
  orchestrator: OrchestratorConfig,
  initial_data: Option<InitialItemsFn<P, T>>,
  disable_initial_data_invalidation: bool,
  default_invalidation_priority: FetchPriority,
}

impl<P: Send + 'static, T: Send + 'static> CollectionOptions<P, T, FetchError> {
  pub fn new<F, Fut>(fetch_fn: F) -> Self
  where
    F: Fn(P, AbortSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let defaults = SyncConfig::default();
    Self {
      label: "collection".to_string(),
      fetch_fn: Arc::new(move |payload, signal| fetch_fn(payload, signal).boxed()),
      error_normalizer: default_normalizer(),
      orchestrator: OrchestratorConfig::from_config(&defaults),
      initial_data: None,
      disable_initial_data_invalidation: defaults.disable_initial_data_invalidation,
      default_invalidation_priority: defaults.default_invalidation_priority,
    }
  }
}

impl<P, T, E> CollectionOptions<P, T, E> {
  pub fn with_label(mut self, label: impl Into<String>) -> Self {
    self.label = label.into();
    self
  }

  pub fn with_error_normalizer<E2, F>(self, normalizer: F) -> CollectionOptions<P, T, E2>
  where
    F: Fn(&Report) -> E2 + Send + Sync + 'static,
  {
    CollectionOptions {
      label: self.label,
      fetch_fn: self.fetch_fn,
      error_normalizer: Arc::new(normalizer),
      orchestrator: self.orchestrator,
      initial_data: self.initial_data,
      disable_initial_data_invalidation: self.disable_initial_data_invalidation,
      default_invalidation_priority: self.default_invalidation_priority,
    }
  }

  pub fn with_config(mut self, config: &SyncConfig) -> Self {
    self.orchestrator = OrchestratorConfig::from_config(config);
    self.disable_initial_data_invalidation = config.disable_initial_data_invalidation;
    self.default_invalidation_priority = config.default_invalidation_priority;
    self
  }

  pub fn with_low_priority_throttle(mut self, throttle: Duration) -> Self {
    self.orchestrator.low_priority_throttle = throttle;
    self
  }

  pub fn with_realtime_throttle<F>(mut self, throttle: F) -> Self
  where
    F: Fn(Duration) -> Duration + Send + Sync + 'static,
  {
    self.orchestrator.realtime_throttle = Arc::new(throttle);
    self
  }

  pub fn with_initial_data<F>(mut self, initial_data: F) -> Self
  where
    F: FnOnce() -> Vec<(P, T)> + Send + 'static,
  {
    self.initial_data = Some(Box::new(initial_data));
    self
  }

  pub fn disable_initial_data_invalidation(mut self) -> Self {
    self.disable_initial_data_invalidation = true;
    self
  }

  pub fn with_default_invalidation_priority(mut self, priority: FetchPriority) -> Self {
    self.default_invalidation_priority = priority;
    self
  }
}

struct CollectionInner<P, T, E> {
  label: String,
  this: Weak<Self>,
  store: Store<CollectionState<P, T, E>>,
  orchestrators: OrchestratorRegistry<()>,
  orchestrator_config: OrchestratorConfig,
  fetch_fn: ItemFetchFn<P, T>,
  normalize_error: ErrorNormalizer<E>,
  default_invalidation_priority: FetchPriority,
  consumers: ConsumerRegistry,
}

impl<P, T, E> CollectionInner<P, T, E>
where
  P: Payload,
  T: Data,
  E: StoredError,
{
  fn orchestrator(&self, key: &CacheKey, payload: &P) -> FetchOrchestrator {
    self.orchestrators.get_or_create(key, || {
      let weak = self.this.clone();
      let key = key.clone();
      let payload = payload.clone();
      let label = format!("{}#{}", self.label, key.fingerprint());
      FetchOrchestrator::new(label, self.orchestrator_config.clone(), move |attempt| {
        match weak.upgrade() {
          Some(inner) => inner.run_attempt(&key, &payload, attempt),
          None => future::ready(()).boxed(),
        }
      })
    })
  }

  fn run_attempt(
    self: Arc<Self>,
    key: &CacheKey,
    payload: &P,
    attempt: FetchAttempt<()>,
  ) -> BoxFuture<'static, ()> {
    self.store.update(|state| {
      let item = state
        .items
        .entry(key.clone())
        .or_insert_with(|| Arc::new(CollectionItem::empty(payload.clone())));
      let item = Arc::make_mut(item);
      item.status = item.status.on_fetch_start();
      item.refetch_on_mount = None;
      true
    });

    let fetch = (self.fetch_fn)(payload.clone(), attempt.abort.clone());
    let key = key.clone();
    async move {
      let result = fetch.await;
      if attempt.should_abort() {
        debug!(resource = %key.fingerprint(), "Discarding result of aborted fetch");
        return;
      }
      self.commit(&key, result);
    }
    .boxed()
  }

  fn commit(&self, key: &CacheKey, result: Result<T>) {
    let outcome = result.map_err(|report| {
      debug!(resource = %key.fingerprint(), error = %report, "Item fetch failed");
      (self.normalize_error)(&report)
    });

    self.store.update(|state| {
      let Some(item) = state.items.get_mut(key) else {
        return false;
      };
      let item = Arc::make_mut(item);
      match outcome {
        Ok(data) => {
          item.status = Status::Success;
          item.error = None;
          item.was_loaded = true;
          if item.data.as_deref() != Some(&data) {
            item.data = Some(Arc::new(data));
          }
        }
        Err(error) => {
          item.status = Status::Error;
          item.error = Some(error);
        }
      }
      true
    });
  }
}

impl<P, T, E> RefetchTarget for CollectionInner<P, T, E>
where
  P: Payload,
  T: Data,
  E: StoredError,
{
  fn consumers(&self) -> &ConsumerRegistry {
    &self.consumers
  }

  // The attempt clears the pending priority when it starts.
  fn consume_pending(&self, key: &CacheKey) {
    let pending = self.store.state().items.get(key).and_then(|item| {
      item
        .refetch_on_mount
        .map(|priority| (priority, item.payload.clone()))
    });
    if let Some((priority, payload)) = pending {
      self.orchestrator(key, &payload).schedule_refetch(priority, ());
    }
  }
}

/// Keys of existing items selected by `matcher`.
pub(crate) fn matching_keys<'a, P: 'a, T: 'a, V>(
  items: &'a HashMap<CacheKey, V>,
  matcher: &ResolvedItemMatcher<'_, P, T>,
  view: impl Fn(&'a CacheKey, &'a V) -> (&'a P, Option<&'a T>),
) -> Vec<CacheKey> {
  match matcher.explicit_keys() {
    Some(keys) => keys
      .iter()
      .filter(|key| items.contains_key(*key))
      .cloned()
      .collect(),
    None => items
      .iter()
      .filter(|(key, value)| {
        let (payload, data) = view(key, value);
        matcher.matches(key, payload, data)
      })
      .map(|(key, _)| key.clone())
      .collect(),
  }
}

/// A cache of independently fetched items.
pub struct CollectionStore<P, T, E = FetchError> {
  inner: Arc<CollectionInner<P, T, E>>,
}

impl<P, T, E> Clone for CollectionStore<P, T, E> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<P, T, E> CollectionStore<P, T, E>
where
  P: Payload,
  T: Data,
  E: StoredError,
{
  pub fn new(options: CollectionOptions<P, T, E>) -> Self {
    let CollectionOptions {
      label,
      fetch_fn,
      error_normalizer,
      orchestrator,
      initial_data,
      disable_initial_data_invalidation,
      default_invalidation_priority,
    } = options;

    let mut initial = CollectionState::default();
    for (payload, data) in initial_data.map(|hydrate| hydrate()).unwrap_or_default() {
      let mut item = CollectionItem::loaded(payload.clone(), data);
      if !disable_initial_data_invalidation {
        item.refetch_on_mount = Some(FetchPriority::LowPriority);
      }
      initial.items.insert(CacheKey::of(&payload), Arc::new(item));
    }

    let inner = Arc::new_cyclic(|this| CollectionInner {
      label,
      this: this.clone(),
      store: Store::new(initial),
      orchestrators: OrchestratorRegistry::new(),
      orchestrator_config: orchestrator,
      fetch_fn,
      normalize_error: error_normalizer,
      default_invalidation_priority,
      consumers: ConsumerRegistry::default(),
    });

    Self { inner }
  }

  pub fn state(&self) -> Arc<CollectionState<P, T, E>> {
    self.inner.store.state()
  }

  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(&CollectionState<P, T, E>, &CollectionState<P, T, E>) + Send + Sync + 'static,
  {
    self.inner.store.subscribe(listener)
  }

  pub fn get_item_state(&self, payload: &P) -> Option<Arc<CollectionItem<P, T, E>>> {
    self.state().get(payload).cloned()
  }

  pub fn schedule_fetch(&self, priority: FetchPriority, payload: P) -> ScheduleResult {
    let key = CacheKey::of(&payload);
    self.ensure_slot(&key, &payload);
    self.inner.orchestrator(&key, &payload).schedule_fetch(priority, ())
  }

  pub fn schedule_fetch_with_hint(
    &self,
    priority: FetchPriority,
    payload: P,
    estimated: Duration,
  ) -> ScheduleResult {
    let key = CacheKey::of(&payload);
    self.ensure_slot(&key, &payload);
    self
      .inner
      .orchestrator(&key, &payload)
      .schedule_fetch_with_hint(priority, (), estimated)
  }

  fn ensure_slot(&self, key: &CacheKey, payload: &P) {
    self.inner.store.update(|state| {
      if state.items.contains_key(key) {
        return false;
      }
      state
        .items
        .insert(key.clone(), Arc::new(CollectionItem::empty(payload.clone())));
      true
    });
  }

  /// Mark matching items stale. Active items refetch right away, the rest
  /// when a consumer attaches.
  pub fn invalidate_item(&self, matcher: ItemMatcher<P, T>, priority: Option<FetchPriority>) {
    let priority = priority.unwrap_or(self.inner.default_invalidation_priority);
    let resolved = matcher.resolve();
    let mut touched = Vec::new();

    self.inner.store.update(|state| {
      touched = matching_keys(&state.items, &resolved, |_, item| {
        (&item.payload, item.data.as_deref())
      });
      let mut changed = false;
      for key in &touched {
        let Some(item) = state.items.get_mut(key) else {
          continue;
        };
        let merged = merge_pending(item.refetch_on_mount, priority);
        if item.refetch_on_mount != Some(merged) {
          Arc::make_mut(item).refetch_on_mount = Some(merged);
          changed = true;
        }
      }
      changed
    });

    debug!(store = %self.inner.label, count = touched.len(), %priority, "Items invalidated");
    for key in touched {
      if self.inner.consumers.is_active(&key) {
        self.inner.consume_pending(&key);
      }
    }
  }

  /// Apply `recipe` to every matching item that holds data, in one commit.
  /// Returns how many items matched.
  pub fn update_item_state<F>(&self, matcher: ItemMatcher<P, T>, mut recipe: F) -> usize
  where
    F: FnMut(&mut T, &P),
  {
    let resolved = matcher.resolve();
    let mut matched = 0;

    self.inner.store.update(|state| {
      let keys = matching_keys(&state.items, &resolved, |_, item| {
        (&item.payload, item.data.as_deref())
      });
      let mut changed = false;
      for key in keys {
        let Some(item) = state.items.get_mut(&key) else {
          continue;
        };
        let Some(current) = item.data.as_deref() else {
          continue;
        };
        matched += 1;
        let mut draft = current.clone();
        recipe(&mut draft, &item.payload);
        if draft != *current {
          Arc::make_mut(item).data = Some(Arc::new(draft));
          changed = true;
        }
      }
      changed
    });

    matched
  }

  /// [`update_item_state`](Self::update_item_state), calling
  /// `if_nothing_was_updated` when no item matched.
  pub fn update_item_state_or<F, G>(
    &self,
    matcher: ItemMatcher<P, T>,
    recipe: F,
    if_nothing_was_updated: G,
  ) -> usize
  where
    F: FnMut(&mut T, &P),
    G: FnOnce(),
  {
    let matched = self.update_item_state(matcher, recipe);
    if matched == 0 {
      if_nothing_was_updated();
    }
    matched
  }

  /// Insert or replace an item as if it had just been fetched. A running
  /// fetch of the item keeps its status.
  pub fn add_item_to_state(&self, payload: P, data: T) {
    let key = CacheKey::of(&payload);
    self.inner.store.update(|state| {
      match state.items.get_mut(&key) {
        Some(item) => {
          let status = if item.status.is_fetching() {
            item.status
          } else {
            Status::Success
          };
          if item.data.as_deref() == Some(&data) && item.status == status && item.error.is_none() {
            return false;
          }
          let item = Arc::make_mut(item);
          item.status = status;
          item.error = None;
          item.was_loaded = true;
          item.data = Some(Arc::new(data));
        }
        None => {
          state.items.insert(key, Arc::new(CollectionItem::loaded(payload, data)));
        }
      }
      true
    });
  }

  /// Soft delete: the slot stays with `Deleted` status and no data.
  pub fn delete_item_state(&self, payload: &P) {
    let key = CacheKey::of(payload);
    self.inner.store.update(|state| {
      let Some(item) = state.items.get_mut(&key) else {
        return false;
      };
      let item = Arc::make_mut(item);
      item.status = Status::Deleted;
      item.data = None;
      item.error = None;
      true
    });
  }

  pub fn start_mutation(&self, payload: &P) {
    let key = CacheKey::of(payload);
    self.inner.orchestrator(&key, payload).start_mutation();
  }

  pub fn end_mutation(&self, payload: &P) {
    let key = CacheKey::of(payload);
    self.inner.orchestrator(&key, payload).end_mutation();
  }

  /// Schedule a high priority fetch of one item and wait for it to settle.
  pub async fn await_item_fetch(&self, payload: P) -> Awaited<T, E> {
    let key = CacheKey::of(&payload);
    let watched = key.clone();
    let settled = self
      .inner
      .store
      .wait_for(
        move |previous: &CollectionState<P, T, E>, current: &CollectionState<P, T, E>| {
          let was_fetching = previous
            .items
            .get(&watched)
            .is_some_and(|item| item.status.is_fetching());
          let item = current.items.get(&watched)?;
          (was_fetching && item.status.is_settled()).then(|| Awaited {
            data: item.data.clone(),
            error: item.error.clone(),
          })
        },
        || {
          self.schedule_fetch(FetchPriority::HighPriority, payload);
        },
      )
      .await;

    settled.unwrap_or_else(|| {
      let item = self.state().items.get(&key).cloned();
      Awaited {
        data: item.as_ref().and_then(|item| item.data.clone()),
        error: item.and_then(|item| item.error.clone()),
      }
    })
  }

  /// Attach an on-screen consumer for one item.
  pub fn consumer(&self, payload: &P) -> Consumer {
    let target: Weak<CollectionInner<P, T, E>> = self.inner.this.clone();
    Consumer::attach(target, CacheKey::of(payload))
  }

  pub fn has_pending_fetch(&self, payload: &P) -> bool {
    self
      .inner
      .orchestrators
      .get(&CacheKey::of(payload))
      .is_some_and(|orchestrator| orchestrator.has_pending_fetch())
  }

  pub fn mutation_is_in_progress(&self, payload: &P) -> bool {
    self
      .inner
      .orchestrators
      .get(&CacheKey::of(payload))
      .is_some_and(|orchestrator| orchestrator.mutation_is_in_progress())
  }

  /// Resolves once no item has a fetch in flight or queued.
  pub async fn wait_for_no_pending_requests(&self) {
    self.inner.orchestrators.wait_for_no_pending_requests().await
  }
}
