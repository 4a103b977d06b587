//! Paginated list queries over a normalized item cache.
//!
//! A [`ListQueryStore`] keeps item data once per item key and lets any number
//! of list queries reference items by key. Items and queries each get their
//! own orchestrators. Invalidating an item can reach the queries that may
//! list it (and queries synced with those) through the caller's sync
//! predicates; optimistic rules keep query membership in step with local
//! item writes.

mod optimistic;
mod partial;
mod state;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use color_eyre::{Report, Result};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use tracing::{debug, warn};

use crate::cache_key::CacheKey;
use crate::collection::matching_keys;
use crate::config::SyncConfig;
use crate::consumer::{Consumer, ConsumerRegistry, RefetchTarget};
use crate::document::Awaited;
use crate::error::{default_normalizer, ErrorNormalizer, FetchError};
use crate::lock::lock;
use crate::matcher::{ItemMatcher, QueryMatcher};
use crate::orchestrator::{
  AbortSignal, FetchAttempt, FetchOrchestrator, OrchestratorConfig, OrchestratorRegistry,
};
use crate::priority::{FetchPriority, ScheduleResult};
use crate::status::Status;
use crate::store::{Data, Payload, Store, StoredError, Subscription};

use optimistic::apply_rules;
use partial::{Fetched, ItemFetch, PartialFetch};
use state::QueryFetch;

pub use optimistic::{AppendTo, OptimisticRule};
pub use partial::FieldCoverage;
pub use state::{
  InitialListData, ItemQueryState, ListPage, ListQueryState, ListRequest, LoadMoreResult, QueryState,
};

type ListFetchFn<Q, I, T> =
  Arc<dyn Fn(ListRequest<Q>, AbortSignal) -> BoxFuture<'static, Result<ListPage<I, T>>> + Send + Sync>;
type ItemFetchFn<I, T> = Arc<dyn Fn(I, AbortSignal) -> BoxFuture<'static, Result<T>> + Send + Sync>;
type InitialListFn<Q, I, T> = Box<dyn FnOnce() -> InitialListData<Q, I, T> + Send>;
type ItemQuerySync<I, Q> = Arc<dyn Fn(&I, &Q) -> bool + Send + Sync>;
type QuerySync<Q> = Arc<dyn Fn(&Q, &Q) -> bool + Send + Sync>;

/// Outcome of an awaited list query fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct AwaitedList<I, T, E = FetchError> {
  pub items: Vec<(I, Arc<T>)>,
  pub has_more: bool,
  pub error: Option<E>,
}

/// Construction options for a [`ListQueryStore`].
pub struct ListQueryOptions<Q, I, T, E = FetchError> {
  label: String,
  fetch_list_fn: ListFetchFn<Q, I, T>,
  fetch_item_fn: ItemFetchFn<I, T>,
  partial: Option<PartialFetch<I, T>>,
  error_normalizer: ErrorNormalizer<E>,
  orchestrator: OrchestratorConfig,
  initial_data: Option<InitialListFn<Q, I, T>>,
  disable_initial_data_invalidation: bool,
  default_invalidation_priority: FetchPriority,
  default_query_size: usize,
  sync_item_and_query: Option<ItemQuerySync<I, Q>>,
  sync_queries: Option<QuerySync<Q>>,
  optimistic_rules: Vec<OptimisticRule<Q, T>>,
}

impl<Q, I, T> ListQueryOptions<Q, I, T, FetchError>
where
  Q: Send + 'static,
  I: Send + 'static,
  T: Send + 'static,
{
  pub fn new<L, LFut, F, FFut>(fetch_list_fn: L, fetch_item_fn: F) -> Self
  where
    L: Fn(ListRequest<Q>, AbortSignal) -> LFut + Send + Sync + 'static,
    LFut: Future<Output = Result<ListPage<I, T>>> + Send + 'static,
    F: Fn(I, AbortSignal) -> FFut + Send + Sync + 'static,
    FFut: Future<Output = Result<T>> + Send + 'static,
  {
    let defaults = SyncConfig::default();
    Self {
      label: "list".to_string(),
      fetch_list_fn: Arc::new(move |request, signal| fetch_list_fn(request, signal).boxed()),
      fetch_item_fn: Arc::new(move |payload, signal| fetch_item_fn(payload, signal).boxed()),
      partial: None,
      error_normalizer: default_normalizer(),
      orchestrator: OrchestratorConfig::from_config(&defaults),
      initial_data: None,
      disable_initial_data_invalidation: defaults.disable_initial_data_invalidation,
      default_invalidation_priority: defaults.default_invalidation_priority,
      default_query_size: defaults.default_query_size,
      sync_item_and_query: None,
      sync_queries: None,
      optimistic_rules: Vec::new(),
    }
  }
}

impl<Q, I, T, E> ListQueryOptions<Q, I, T, E> {
  pub fn with_label(mut self, label: impl Into<String>) -> Self {
    self.label = label.into();
    self
  }

  pub fn with_error_normalizer<E2, F>(self, normalizer: F) -> ListQueryOptions<Q, I, T, E2>
  where
    F: Fn(&Report) -> E2 + Send + Sync + 'static,
  {
    ListQueryOptions {
      label: self.label,
      fetch_list_fn: self.fetch_list_fn,
      fetch_item_fn: self.fetch_item_fn,
      partial: self.partial,
      error_normalizer: Arc::new(normalizer),
      orchestrator: self.orchestrator,
      initial_data: self.initial_data,
      disable_initial_data_invalidation: self.disable_initial_data_invalidation,
      default_invalidation_priority: self.default_invalidation_priority,
      default_query_size: self.default_query_size,
      sync_item_and_query: self.sync_item_and_query,
      sync_queries: self.sync_queries,
      optimistic_rules: self.optimistic_rules,
    }
  }

  pub fn with_config(mut self, config: &SyncConfig) -> Self {
    self.orchestrator = OrchestratorConfig::from_config(config);
    self.disable_initial_data_invalidation = config.disable_initial_data_invalidation;
    self.default_invalidation_priority = config.default_invalidation_priority;
    self.default_query_size = config.default_query_size;
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

  pub fn with_default_query_size(mut self, size: usize) -> Self {
    self.default_query_size = size.max(1);
    self
  }

  pub fn with_default_invalidation_priority(mut self, priority: FetchPriority) -> Self {
    self.default_invalidation_priority = priority;
    self
  }

  pub fn with_initial_data<F>(mut self, initial_data: F) -> Self
  where
    F: FnOnce() -> InitialListData<Q, I, T> + Send + 'static,
  {
    self.initial_data = Some(Box::new(initial_data));
    self
  }

  pub fn disable_initial_data_invalidation(mut self) -> Self {
    self.disable_initial_data_invalidation = true;
    self
  }

  /// `sync(item, query)` holds when `query` may list `item`. Item
  /// invalidations and item mutations then reach those queries too.
  pub fn sync_item_and_query<F>(mut self, sync: F) -> Self
  where
    F: Fn(&I, &Q) -> bool + Send + Sync + 'static,
  {
    self.sync_item_and_query = Some(Arc::new(sync));
    self
  }

  /// `sync(a, b)` holds when invalidating query `a` must also invalidate `b`.
  pub fn sync_queries<F>(mut self, sync: F) -> Self
  where
    F: Fn(&Q, &Q) -> bool + Send + Sync + 'static,
  {
    self.sync_queries = Some(Arc::new(sync));
    self
  }

  pub fn with_optimistic_rule(mut self, rule: OptimisticRule<Q, T>) -> Self {
    self.optimistic_rules.push(rule);
    self
  }
}

/// Consumer target for items.
struct ItemSide<Q, I, T, E> {
  store: Weak<ListInner<Q, I, T, E>>,
  consumers: ConsumerRegistry,
}

/// Consumer target for queries.
struct QuerySide<Q, I, T, E> {
  store: Weak<ListInner<Q, I, T, E>>,
  consumers: ConsumerRegistry,
}

impl<Q: Payload, I: Payload, T: Data, E: StoredError> RefetchTarget for ItemSide<Q, I, T, E> {
  fn consumers(&self) -> &ConsumerRegistry {
    &self.consumers
  }

  fn consume_pending(&self, key: &CacheKey) {
    if let Some(inner) = self.store.upgrade() {
      inner.consume_item(key);
    }
  }
}

impl<Q: Payload, I: Payload, T: Data, E: StoredError> RefetchTarget for QuerySide<Q, I, T, E> {
  fn consumers(&self) -> &ConsumerRegistry {
    &self.consumers
  }

  fn consume_pending(&self, key: &CacheKey) {
    if let Some(inner) = self.store.upgrade() {
      inner.consume_query(key);
    }
  }
}

struct ListInner<Q, I, T, E> {
  label: String,
  this: Weak<Self>,
  store: Store<ListQueryState<Q, I, T, E>>,
  query_orchestrators: OrchestratorRegistry<QueryFetch>,
  item_orchestrators: OrchestratorRegistry<ItemFetch>,
  orchestrator_config: OrchestratorConfig,
  fetch_list_fn: ListFetchFn<Q, I, T>,
  fetch_item_fn: ItemFetchFn<I, T>,
  partial: Option<PartialFetch<I, T>>,
  normalize_error: ErrorNormalizer<E>,
  default_invalidation_priority: FetchPriority,
  default_query_size: usize,
  sync_item_and_query: Option<ItemQuerySync<I, Q>>,
  sync_queries: Option<QuerySync<Q>>,
  optimistic_rules: Vec<OptimisticRule<Q, T>>,
  /// Per item, the query sets mutated alongside each open item mutation
  mutation_sync: Mutex<HashMap<CacheKey, Vec<Vec<CacheKey>>>>,
  item_side: Arc<ItemSide<Q, I, T, E>>,
  query_side: Arc<QuerySide<Q, I, T, E>>,
}

fn dedup_keys(keys: impl IntoIterator<Item = CacheKey>) -> Vec<CacheKey> {
  let mut seen = HashSet::new();
  keys.into_iter().filter(|key| seen.insert(key.clone())).collect()
}

impl<Q, I, T, E> ListInner<Q, I, T, E>
where
  Q: Payload,
  I: Payload,
  T: Data,
  E: StoredError,
{
  fn query_orchestrator(&self, key: &CacheKey, payload: &Q) -> FetchOrchestrator<QueryFetch> {
    self.query_orchestrators.get_or_create(key, || {
      let weak = self.this.clone();
      let key = key.clone();
      let payload = payload.clone();
      let label = format!("{}:query#{}", self.label, key.fingerprint());
      FetchOrchestrator::new(label, self.orchestrator_config.clone(), move |attempt| {
        match weak.upgrade() {
          Some(inner) => inner.run_query_attempt(&key, &payload, attempt),
          None => future::ready(()).boxed(),
        }
      })
    })
  }

  fn item_orchestrator(&self, key: &CacheKey, payload: &I) -> FetchOrchestrator<ItemFetch> {
    self.item_orchestrators.get_or_create(key, || {
      let weak = self.this.clone();
      let key = key.clone();
      let payload = payload.clone();
      let label = format!("{}:item#{}", self.label, key.fingerprint());
      FetchOrchestrator::new(label, self.orchestrator_config.clone(), move |attempt| {
        match weak.upgrade() {
          Some(inner) => inner.run_item_attempt(&key, &payload, attempt),
          None => future::ready(()).boxed(),
        }
      })
    })
  }

  fn run_query_attempt(
    self: Arc<Self>,
    key: &CacheKey,
    payload: &Q,
    attempt: FetchAttempt<QueryFetch>,
  ) -> BoxFuture<'static, ()> {
    let mut request = ListRequest {
      payload: payload.clone(),
      offset: 0,
      size: self.default_query_size,
    };

    self.store.update(|state| {
      let query = state
        .queries
        .entry(key.clone())
        .or_insert_with(|| Arc::new(QueryState::empty(payload.clone(), self.default_query_size)));
      let query = Arc::make_mut(query);
      match attempt.kind {
        QueryFetch::Refresh { size } => {
          query.refetch_on_mount = None;
          if let Some(size) = size {
            query.size = size;
          }
          query.status = query.status.on_fetch_start();
          request.size = query.size.max(query.items.len());
        }
        QueryFetch::LoadMore { size } => {
          query.status = query
            .status
            .on_load_more_start()
            .unwrap_or(Status::LoadingMore);
          request.offset = query.items.len();
          request.size = size.unwrap_or(query.size);
        }
      }
      true
    });

    let fetch = (self.fetch_list_fn)(request, attempt.abort.clone());
    let key = key.clone();
    async move {
      let result = fetch.await;
      if attempt.should_abort() {
        debug!(query = %key.fingerprint(), "Discarding result of aborted list fetch");
        return;
      }
      self.commit_query(&key, attempt.kind, result);
    }
    .boxed()
  }

  fn commit_query(&self, key: &CacheKey, kind: QueryFetch, result: Result<ListPage<I, T>>) {
    let outcome = result.map_err(|report| {
      debug!(query = %key.fingerprint(), error = %report, "List fetch failed");
      (self.normalize_error)(&report)
    });

    self.store.update(|state| {
      if !state.queries.contains_key(key) {
        return false;
      }

      match outcome {
        Ok(page) => {
          let mut fetched = Vec::with_capacity(page.items.len());
          for (payload, data) in page.items {
            let item_key = CacheKey::of(&payload);
            state.put_item(&item_key, &payload, data, &FieldCoverage::All);
            fetched.push(item_key);
          }

          let Some(query) = state.queries.get_mut(key) else {
            return true;
          };
          let query = Arc::make_mut(query);
          match kind {
            QueryFetch::Refresh { .. } => query.items = dedup_keys(fetched),
            QueryFetch::LoadMore { .. } => {
              let mut seen: HashSet<CacheKey> = query.items.iter().cloned().collect();
              query
                .items
                .extend(fetched.into_iter().filter(|item_key| seen.insert(item_key.clone())));
            }
          }
          query.has_more = page.has_more;
          query.status = Status::Success;
          query.error = None;
          query.was_loaded = true;
        }
        Err(error) => {
          if let Some(query) = state.queries.get_mut(key) {
            let query = Arc::make_mut(query);
            query.status = Status::Error;
            query.error = Some(error);
          }
        }
      }
      true
    });
  }

  fn run_item_attempt(
    self: Arc<Self>,
    key: &CacheKey,
    payload: &I,
    attempt: FetchAttempt<ItemFetch>,
  ) -> BoxFuture<'static, ()> {
    self.store.update(|state| {
      let item = state.ensure_item(key, payload);
      item.status = item.status.on_fetch_start();
      // Only a whole-record fetch answers an invalidation.
      if attempt.kind.fields.is_none() {
        item.refetch_on_mount = None;
      }
      true
    });

    let signal = attempt.abort.clone();
    let fetch: BoxFuture<'static, Result<Fetched<T>>> = match (&attempt.kind.fields, &self.partial) {
      (Some(fields), Some(partial)) => {
        let fields = fields.clone();
        let fetch = (partial.fetch)(payload.clone(), fields.clone(), signal);
        async move { fetch.await.map(|data| Fetched::Fields(data, fields)) }.boxed()
      }
      _ => {
        let fetch = (self.fetch_item_fn)(payload.clone(), signal);
        async move { fetch.await.map(Fetched::Full) }.boxed()
      }
    };

    let key = key.clone();
    async move {
      let result = fetch.await;
      if attempt.should_abort() {
        debug!(item = %key.fingerprint(), "Discarding result of aborted item fetch");
        return;
      }
      self.commit_item(&key, result);
    }
    .boxed()
  }

  fn commit_item(&self, key: &CacheKey, result: Result<Fetched<T>>) {
    let outcome = result.map_err(|report| {
      debug!(item = %key.fingerprint(), error = %report, "Item fetch failed");
      (self.normalize_error)(&report)
    });

    self.store.update(|state| {
      let current_fields = match state.item_queries.get(key) {
        Some(item) => item.fields.clone(),
        None => return false,
      };

      let (status, error, fields) = match outcome {
        Ok(Fetched::Full(data)) => {
          state.store_data(key, data);
          (Status::Success, None, FieldCoverage::All)
        }
        Ok(Fetched::Fields(data, fetched)) => {
          let existing = state.items.get(key).and_then(|data| data.as_deref());
          let merged = match (existing, &self.partial) {
            (Some(existing), Some(partial)) => (partial.merge)(existing, data),
            _ => data,
          };
          state.store_data(key, merged);
          let fields = current_fields.union(&FieldCoverage::Fields(fetched));
          (Status::Success, None, fields)
        }
        Err(error) => (Status::Error, Some(error), current_fields),
      };

      if let Some(item) = state.item_queries.get_mut(key) {
        let item = Arc::make_mut(item);
        if status == Status::Success {
          item.was_loaded = true;
        }
        item.status = status;
        item.error = error;
        item.fields = fields;
      }
      true
    });
  }

  // Attempts clear the pending priority when they start.
  fn consume_item(&self, key: &CacheKey) {
    let pending = self.store.state().item_queries.get(key).and_then(|item| {
      item
        .refetch_on_mount
        .map(|priority| (priority, item.payload.clone()))
    });
    if let Some((priority, payload)) = pending {
      self
        .item_orchestrator(key, &payload)
        .schedule_refetch(priority, ItemFetch::whole());
    }
  }

  fn consume_query(&self, key: &CacheKey) {
    let pending = self.store.state().queries.get(key).and_then(|query| {
      query
        .refetch_on_mount
        .map(|priority| (priority, query.payload.clone()))
    });
    if let Some((priority, payload)) = pending {
      self
        .query_orchestrator(key, &payload)
        .schedule_refetch(priority, QueryFetch::Refresh { size: None });
    }
  }

  /// Existing queries that may list any of `items`.
  fn queries_synced_with_items(&self, state: &ListQueryState<Q, I, T, E>, items: &[&I]) -> Vec<CacheKey> {
    let Some(sync) = &self.sync_item_and_query else {
      return Vec::new();
    };
    state
      .queries
      .iter()
      .filter(|(_, query)| items.iter().any(|item| sync(*item, &query.payload)))
      .map(|(key, _)| key.clone())
      .collect()
  }

  /// `seeds` plus every query reachable from them through `sync_queries`.
  fn with_synced_queries(&self, state: &ListQueryState<Q, I, T, E>, seeds: Vec<CacheKey>) -> Vec<CacheKey> {
    let seeds = dedup_keys(seeds);
    let Some(sync) = &self.sync_queries else {
      return seeds;
    };

    let mut selected: HashSet<CacheKey> = seeds.iter().cloned().collect();
    let mut frontier = seeds.clone();
    let mut result = seeds;
    while let Some(key) = frontier.pop() {
      let Some(source) = state.queries.get(&key) else {
        continue;
      };
      for (other_key, other) in &state.queries {
        if selected.contains(other_key) || !sync(&source.payload, &other.payload) {
          continue;
        }
        selected.insert(other_key.clone());
        frontier.push(other_key.clone());
        result.push(other_key.clone());
      }
    }
    result
  }

  /// Mark entities stale and refetch the active ones.
  fn invalidate_keys(&self, items: &[CacheKey], queries: &[CacheKey], priority: FetchPriority) {
    self
      .store
      .update(|state| state.mark_pending(items, queries, priority));
    self.flush_pending(items, queries);
  }

  fn flush_pending(&self, items: &[CacheKey], queries: &[CacheKey]) {
    for key in items {
      if self.item_side.consumers.is_active(key) {
        self.consume_item(key);
      }
    }
    for key in queries {
      if self.query_side.consumers.is_active(key) {
        self.consume_query(key);
      }
    }
  }
}

/// A normalized cache of items and the paginated queries that list them.
pub struct ListQueryStore<Q, I, T, E = FetchError> {
  inner: Arc<ListInner<Q, I, T, E>>,
}

impl<Q, I, T, E> Clone for ListQueryStore<Q, I, T, E> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<Q, I, T, E> ListQueryStore<Q, I, T, E>
where
  Q: Payload,
  I: Payload,
  T: Data,
  E: StoredError,
{
  pub fn new(options: ListQueryOptions<Q, I, T, E>) -> Self {
    let ListQueryOptions {
      label,
      fetch_list_fn,
      fetch_item_fn,
      partial,
      error_normalizer,
      orchestrator,
      initial_data,
      disable_initial_data_invalidation,
      default_invalidation_priority,
      default_query_size,
      sync_item_and_query,
      sync_queries,
      optimistic_rules,
    } = options;

    let mut initial = ListQueryState::default();
    if let Some(hydrate) = initial_data {
      let InitialListData { items, queries } = hydrate();
      let mut hydrated_items = Vec::new();
      let mut hydrated_queries = Vec::new();

      for (payload, page) in queries {
        let mut keys = Vec::with_capacity(page.items.len());
        for (item, data) in page.items {
          let item_key = CacheKey::of(&item);
          initial.put_item(&item_key, &item, data, &FieldCoverage::All);
          keys.push(item_key);
        }
        let keys = dedup_keys(keys);
        let query_key = CacheKey::of(&payload);
        let mut query = QueryState::empty(payload, default_query_size.max(keys.len()));
        query.status = Status::Success;
        query.was_loaded = true;
        query.has_more = page.has_more;
        query.items = keys;
        initial.queries.insert(query_key.clone(), Arc::new(query));
        hydrated_queries.push(query_key);
      }
      for (item, data) in items {
        let item_key = CacheKey::of(&item);
        initial.put_item(&item_key, &item, data, &FieldCoverage::All);
        hydrated_items.push(item_key);
      }

      if !disable_initial_data_invalidation {
        initial.mark_pending(&hydrated_items, &hydrated_queries, FetchPriority::LowPriority);
      }
    }

    let inner = Arc::new_cyclic(|this: &Weak<ListInner<Q, I, T, E>>| ListInner {
      label,
      this: this.clone(),
      store: Store::new(initial),
      query_orchestrators: OrchestratorRegistry::new(),
      item_orchestrators: OrchestratorRegistry::new(),
      orchestrator_config: orchestrator,
      fetch_list_fn,
      fetch_item_fn,
      partial,
      normalize_error: error_normalizer,
      default_invalidation_priority,
      default_query_size,
      sync_item_and_query,
      sync_queries,
      optimistic_rules,
      mutation_sync: Mutex::new(HashMap::new()),
      item_side: Arc::new(ItemSide {
        store: this.clone(),
        consumers: ConsumerRegistry::default(),
      }),
      query_side: Arc::new(QuerySide {
        store: this.clone(),
        consumers: ConsumerRegistry::default(),
      }),
    });

    Self { inner }
  }

  pub fn state(&self) -> Arc<ListQueryState<Q, I, T, E>> {
    self.inner.store.state()
  }

  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(&ListQueryState<Q, I, T, E>, &ListQueryState<Q, I, T, E>) + Send + Sync + 'static,
  {
    self.inner.store.subscribe(listener)
  }

  /// Fetch (or refresh) a list query. `size` sets the page size of the query;
  /// a refresh always covers at least the items already loaded.
  pub fn schedule_list_query_fetch(
    &self,
    priority: FetchPriority,
    payload: Q,
    size: Option<usize>,
  ) -> ScheduleResult {
    let key = CacheKey::of(&payload);
    let default_size = self.inner.default_query_size;
    self.inner.store.update(|state| {
      if state.queries.contains_key(&key) {
        return false;
      }
      let query = QueryState::empty(payload.clone(), size.unwrap_or(default_size).max(1));
      state.queries.insert(key.clone(), Arc::new(query));
      true
    });

    self
      .inner
      .query_orchestrator(&key, &payload)
      .schedule_fetch(priority, QueryFetch::Refresh { size })
  }

  pub fn schedule_item_fetch(&self, priority: FetchPriority, payload: I) -> ScheduleResult {
    let key = CacheKey::of(&payload);
    self.inner.store.update(|state| {
      if state.item_queries.contains_key(&key) {
        return false;
      }
      state.ensure_item(&key, &payload);
      true
    });

    self
      .inner
      .item_orchestrator(&key, &payload)
      .schedule_fetch(priority, ItemFetch::whole())
  }

  /// Append the next page of a loaded query.
  pub fn load_more(&self, payload: &Q, size: Option<usize>) -> LoadMoreResult {
    let key = CacheKey::of(payload);
    let Some(query) = self.state().queries.get(&key).cloned() else {
      return LoadMoreResult::Skipped;
    };
    if !query.has_more || query.status.on_load_more_start().is_none() {
      return LoadMoreResult::Skipped;
    }

    match self
      .inner
      .query_orchestrator(&key, payload)
      .try_start(FetchPriority::HighPriority, QueryFetch::LoadMore { size })
    {
      ScheduleResult::Started => LoadMoreResult::Started,
      _ => LoadMoreResult::Skipped,
    }
  }

  /// Mark matching items stale, plus the queries synced with them.
  pub fn invalidate_item(&self, matcher: ItemMatcher<I, T>, priority: Option<FetchPriority>) {
    let priority = priority.unwrap_or(self.inner.default_invalidation_priority);
    let resolved = matcher.resolve();
    let state = self.state();

    let items = matching_keys(&state.item_queries, &resolved, |key, item| {
      (
        &item.payload,
        state.items.get(key).and_then(|data| data.as_deref()),
      )
    });
    let payloads: Vec<&I> = items
      .iter()
      .filter_map(|key| state.item_queries.get(key))
      .map(|item| &item.payload)
      .collect();
    let direct = self.inner.queries_synced_with_items(&state, &payloads);
    let queries = self.inner.with_synced_queries(&state, direct);

    debug!(
      store = %self.inner.label,
      items = items.len(),
      queries = queries.len(),
      %priority,
      "Items invalidated"
    );
    self.inner.invalidate_keys(&items, &queries, priority);
  }

  /// Mark matching queries stale, plus the queries synced with them.
  pub fn invalidate_query(&self, matcher: QueryMatcher<Q>, priority: Option<FetchPriority>) {
    let priority = priority.unwrap_or(self.inner.default_invalidation_priority);
    let queries = self.matching_queries(&matcher);
    debug!(store = %self.inner.label, queries = queries.len(), %priority, "Queries invalidated");
    self.inner.invalidate_keys(&[], &queries, priority);
  }

  /// [`invalidate_query`](Self::invalidate_query) plus every item those
  /// queries currently list.
  pub fn invalidate_query_and_items(&self, matcher: QueryMatcher<Q>, priority: Option<FetchPriority>) {
    let priority = priority.unwrap_or(self.inner.default_invalidation_priority);
    let queries = self.matching_queries(&matcher);
    let items = self.state().items_listed_in(&queries);
    self.inner.invalidate_keys(&items, &queries, priority);
  }

  fn matching_queries(&self, matcher: &QueryMatcher<Q>) -> Vec<CacheKey> {
    let state = self.state();
    let seeds = state
      .queries
      .iter()
      .filter(|(key, query)| matcher.matches(key, &query.payload))
      .map(|(key, _)| key.clone())
      .collect();
    self.inner.with_synced_queries(&state, seeds)
  }

  /// Apply `recipe` to every matching item that holds data, in one commit,
  /// then run the optimistic rules for each changed item. Returns how many
  /// items matched.
  pub fn update_item_state<F>(&self, matcher: ItemMatcher<I, T>, mut recipe: F) -> usize
  where
    F: FnMut(&mut T, &I),
  {
    let resolved = matcher.resolve();
    let rules = &self.inner.optimistic_rules;
    let page_size = self.inner.default_query_size;
    let mut matched = 0;
    let mut invalidate = Vec::new();

    self.inner.store.update(|state| {
      let keys = {
        let data = &state.items;
        matching_keys(&state.item_queries, &resolved, |key, item| {
          (&item.payload, data.get(key).and_then(|data| data.as_deref()))
        })
      };

      let mut changed = false;
      for key in keys {
        let Some(Some(current)) = state.items.get(&key) else {
          continue;
        };
        let Some(item) = state.item_queries.get(&key) else {
          continue;
        };
        matched += 1;
        let mut draft = T::clone(current);
        recipe(&mut draft, &item.payload);
        if draft == **current {
          continue;
        }
        state.store_data(&key, draft);
        invalidate.extend(apply_rules(rules, state, &key, page_size));
        changed = true;
      }
      changed
    });

    if !invalidate.is_empty() {
      self
        .inner
        .invalidate_keys(&[], &dedup_keys(invalidate), self.inner.default_invalidation_priority);
    }
    matched
  }

  /// [`update_item_state`](Self::update_item_state), calling
  /// `if_nothing_was_updated` when no item matched.
  pub fn update_item_state_or<F, G>(
    &self,
    matcher: ItemMatcher<I, T>,
    recipe: F,
    if_nothing_was_updated: G,
  ) -> usize
  where
    F: FnMut(&mut T, &I),
    G: FnOnce(),
  {
    let matched = self.update_item_state(matcher, recipe);
    if matched == 0 {
      if_nothing_was_updated();
    }
    matched
  }

  /// Insert or replace an item locally and apply the optimistic rules.
  pub fn add_item_to_state(&self, payload: I, data: T) {
    let key = CacheKey::of(&payload);
    let rules = &self.inner.optimistic_rules;
    let page_size = self.inner.default_query_size;
    let mut invalidate = Vec::new();

    self.inner.store.update(|state| {
      state.put_item(&key, &payload, data, &FieldCoverage::All);
      invalidate = apply_rules(rules, state, &key, page_size);
      true
    });

    if !invalidate.is_empty() {
      self
        .inner
        .invalidate_keys(&[], &invalidate, self.inner.default_invalidation_priority);
    }
  }

  /// Soft delete: the item slot stays with `Deleted` status and no data, and
  /// the item leaves every query list.
  pub fn delete_item_state(&self, payload: &I) {
    let key = CacheKey::of(payload);
    self.inner.store.update(|state| {
      let Some(item) = state.item_queries.get_mut(&key) else {
        return false;
      };
      let item = Arc::make_mut(item);
      item.status = Status::Deleted;
      item.error = None;
      item.fields = FieldCoverage::default();
      state.items.insert(key.clone(), None);
      state.remove_from_queries(&key);
      true
    });
  }

  /// Start a mutation on an item and on every query synced with it.
  pub fn start_item_mutation(&self, payload: &I) {
    let key = CacheKey::of(payload);
    let state = self.state();
    let synced: Vec<(CacheKey, Q)> = self
      .inner
      .queries_synced_with_items(&state, &[payload])
      .into_iter()
      .filter_map(|query_key| {
        let query = state.queries.get(&query_key)?;
        Some((query_key, query.payload.clone()))
      })
      .collect();

    self.inner.item_orchestrator(&key, payload).start_mutation();
    for (query_key, query) in &synced {
      self.inner.query_orchestrator(query_key, query).start_mutation();
    }
    lock(&self.inner.mutation_sync, "list.start_item_mutation")
      .entry(key)
      .or_default()
      .push(synced.into_iter().map(|(query_key, _)| query_key).collect());
  }

  /// End the innermost item mutation and the query mutations it started.
  pub fn end_item_mutation(&self, payload: &I) {
    let key = CacheKey::of(payload);
    let synced = {
      let mut mutation_sync = lock(&self.inner.mutation_sync, "list.end_item_mutation");
      let synced = mutation_sync.get_mut(&key).and_then(Vec::pop);
      if mutation_sync.get(&key).is_some_and(Vec::is_empty) {
        mutation_sync.remove(&key);
      }
      synced
    };

    let Some(synced) = synced else {
      warn!(
        store = %self.inner.label,
        item = %key.fingerprint(),
        "end_item_mutation called without a matching start_item_mutation"
      );
      return;
    };
    for query_key in synced {
      if let Some(orchestrator) = self.inner.query_orchestrators.get(&query_key) {
        orchestrator.end_mutation();
      }
    }
    self.inner.item_orchestrator(&key, payload).end_mutation();
  }

  pub fn start_query_mutation(&self, payload: &Q) {
    let key = CacheKey::of(payload);
    self.inner.query_orchestrator(&key, payload).start_mutation();
  }

  pub fn end_query_mutation(&self, payload: &Q) {
    let key = CacheKey::of(payload);
    self.inner.query_orchestrator(&key, payload).end_mutation();
  }

  pub fn item_mutation_is_in_progress(&self, payload: &I) -> bool {
    self
      .inner
      .item_orchestrators
      .get(&CacheKey::of(payload))
      .is_some_and(|orchestrator| orchestrator.mutation_is_in_progress())
  }

  pub fn get_item_state(&self, payload: &I) -> Option<Arc<ItemQueryState<I, E>>> {
    self.state().item_query(payload).cloned()
  }

  pub fn get_item(&self, payload: &I) -> Option<Arc<T>> {
    self.state().item(payload).cloned()
  }

  pub fn get_query_state(&self, payload: &Q) -> Option<Arc<QueryState<Q, E>>> {
    self.state().query(payload).cloned()
  }

  /// Items of a query in list order.
  pub fn get_query_items(&self, payload: &Q) -> Vec<(I, Arc<T>)> {
    let state = self.state();
    match state.query(payload) {
      Some(query) => state.items_of(query),
      None => Vec::new(),
    }
  }

  /// Payloads of the queries currently listing an item.
  pub fn get_queries_related_to_item(&self, payload: &I) -> Vec<Q> {
    let key = CacheKey::of(payload);
    self
      .state()
      .queries
      .values()
      .filter(|query| query.items.contains(&key))
      .map(|query| query.payload.clone())
      .collect()
  }

  /// Schedule a high priority item fetch and wait for it to settle.
  pub async fn await_item_fetch(&self, payload: I) -> Awaited<T, E> {
    let key = CacheKey::of(&payload);
    let watched = key.clone();
    let settled = self
      .inner
      .store
      .wait_for(
        move |previous: &ListQueryState<Q, I, T, E>, current: &ListQueryState<Q, I, T, E>| {
          let was_fetching = previous
            .item_queries
            .get(&watched)
            .is_some_and(|item| item.status.is_fetching());
          let item = current.item_queries.get(&watched)?;
          (was_fetching && item.status.is_settled()).then(|| Awaited {
            data: current.items.get(&watched).cloned().flatten(),
            error: item.error.clone(),
          })
        },
        || {
          self.schedule_item_fetch(FetchPriority::HighPriority, payload);
        },
      )
      .await;

    settled.unwrap_or_else(|| {
      let state = self.state();
      Awaited {
        data: state.items.get(&key).cloned().flatten(),
        error: state.item_queries.get(&key).and_then(|item| item.error.clone()),
      }
    })
  }

  /// Schedule a high priority list fetch and wait for it to settle.
  pub async fn await_list_query_fetch(&self, payload: Q, size: Option<usize>) -> AwaitedList<I, T, E> {
    let key = CacheKey::of(&payload);
    let watched = key.clone();
    let settled = self
      .inner
      .store
      .wait_for(
        move |previous: &ListQueryState<Q, I, T, E>, current: &ListQueryState<Q, I, T, E>| {
          let was_fetching = previous
            .queries
            .get(&watched)
            .is_some_and(|query| query.status.is_fetching());
          let query = current.queries.get(&watched)?;
          (was_fetching && query.status.is_settled()).then(|| AwaitedList {
            items: current.items_of(query),
            has_more: query.has_more,
            error: query.error.clone(),
          })
        },
        || {
          self.schedule_list_query_fetch(FetchPriority::HighPriority, payload, size);
        },
      )
      .await;

    settled.unwrap_or_else(|| {
      let state = self.state();
      match state.queries.get(&key) {
        Some(query) => AwaitedList {
          items: state.items_of(query),
          has_more: query.has_more,
          error: query.error.clone(),
        },
        None => AwaitedList {
          items: Vec::new(),
          has_more: false,
          error: None,
        },
      }
    })
  }

  /// Attach an on-screen consumer for a list query.
  pub fn query_consumer(&self, payload: &Q) -> Consumer {
    let side: Weak<QuerySide<Q, I, T, E>> = Arc::downgrade(&self.inner.query_side);
    Consumer::attach(side, CacheKey::of(payload))
  }

  /// Attach an on-screen consumer for an item.
  pub fn item_consumer(&self, payload: &I) -> Consumer {
    let side: Weak<ItemSide<Q, I, T, E>> = Arc::downgrade(&self.inner.item_side);
    Consumer::attach(side, CacheKey::of(payload))
  }

  pub fn has_pending_fetch(&self) -> bool {
    self.inner.query_orchestrators.has_pending_fetch() || self.inner.item_orchestrators.has_pending_fetch()
  }

  pub fn has_pending_item_fetch(&self, payload: &I) -> bool {
    self
      .inner
      .item_orchestrators
      .get(&CacheKey::of(payload))
      .is_some_and(|orchestrator| orchestrator.has_pending_fetch())
  }

  pub fn has_pending_query_fetch(&self, payload: &Q) -> bool {
    self
      .inner
      .query_orchestrators
      .get(&CacheKey::of(payload))
      .is_some_and(|orchestrator| orchestrator.has_pending_fetch())
  }

  /// Resolves once no item or query has a fetch in flight or queued.
  pub async fn wait_for_no_pending_requests(&self) {
    while self.has_pending_fetch() {
      self.inner.query_orchestrators.wait_for_no_pending_requests().await;
      self.inner.item_orchestrators.wait_for_no_pending_requests().await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;
  use serde_json::{json, Value};
  use std::sync::atomic::{AtomicUsize, Ordering};

  pub(super) fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
  }

  /// In-memory rows keyed `table||n`. Queries select a table and optionally
  /// a `role` matched against the row's `type`.
  #[derive(Default)]
  pub(super) struct Remote {
    pub(super) rows: Mutex<Vec<(String, Value)>>,
    pub(super) list_requests: Mutex<Vec<ListRequest<Value>>>,
    pub(super) item_requests: Mutex<Vec<String>>,
  }

  impl Remote {
    fn select(&self, query: &Value) -> Vec<(String, Value)> {
      let table = query["table"].as_str().unwrap_or_default();
      let prefix = format!("{table}||");
      self
        .rows
        .lock()
        .unwrap()
        .iter()
        .filter(|(id, row)| {
          id.starts_with(&prefix) && (query.get("role").is_none() || row["type"] == query["role"])
        })
        .cloned()
        .collect()
    }

    pub(super) fn list_calls(&self, query: &Value) -> usize {
      self
        .list_requests
        .lock()
        .unwrap()
        .iter()
        .filter(|request| request.payload == *query)
        .count()
    }

    pub(super) fn item_calls(&self, id: &str) -> usize {
      self
        .item_requests
        .lock()
        .unwrap()
        .iter()
        .filter(|requested| requested.as_str() == id)
        .count()
    }
  }

  pub(super) type Options = ListQueryOptions<Value, String, Value>;
  pub(super) type Users = ListQueryStore<Value, String, Value>;

  pub(super) fn options(remote: &Arc<Remote>) -> Options {
    let lists = remote.clone();
    let items = remote.clone();
    ListQueryOptions::new(
      move |request: ListRequest<Value>, _signal| {
        lists.list_requests.lock().unwrap().push(request.clone());
        let rows = lists.select(&request.payload);
        let has_more = request.offset + request.size < rows.len();
        let page: Vec<(String, Value)> = rows
          .into_iter()
          .skip(request.offset)
          .take(request.size)
          .collect();
        async move {
          tokio::time::sleep(ms(20)).await;
          Ok(ListPage {
            items: page,
            has_more,
          })
        }
      },
      move |id: String, _signal| {
        items.item_requests.lock().unwrap().push(id.clone());
        let row = items
          .rows
          .lock()
          .unwrap()
          .iter()
          .find(|(row_id, _)| *row_id == id)
          .map(|(_, row)| row.clone());
        async move {
          tokio::time::sleep(ms(10)).await;
          row.ok_or_else(|| eyre!("{id} not found"))
        }
      },
    )
  }

  fn users_rows(count: usize) -> Vec<(String, Value)> {
    (1..=count)
      .map(|n| (format!("users||{n}"), json!({"id": n, "type": "user"})))
      .collect()
  }

  fn remote_with(rows: Vec<(String, Value)>) -> Arc<Remote> {
    let remote = Remote::default();
    *remote.rows.lock().unwrap() = rows;
    Arc::new(remote)
  }

  fn same_table(id: &String, query: &Value) -> bool {
    query["table"]
      .as_str()
      .is_some_and(|table| id.starts_with(&format!("{table}||")))
  }

  #[tokio::test(start_paused = true)]
  async fn test_exhausted_query_skips_load_more() {
    let remote = remote_with(users_rows(5));
    let store = Users::new(options(&remote));
    let users = json!({"table": "users"});

    let awaited = store.await_list_query_fetch(users.clone(), Some(5)).await;

    assert_eq!(awaited.items.len(), 5);
    assert!(!awaited.has_more);
    assert_eq!(store.load_more(&users, None), LoadMoreResult::Skipped);
    assert_eq!(store.load_more(&json!({"table": "missing"}), None), LoadMoreResult::Skipped);
  }

  #[tokio::test(start_paused = true)]
  async fn test_load_more_appends_pages() {
    let remote = remote_with(users_rows(7));
    let store = Users::new(options(&remote));
    let users = json!({"table": "users"});

    store.await_list_query_fetch(users.clone(), Some(3)).await;
    assert_eq!(store.load_more(&users, None), LoadMoreResult::Started);
    assert_eq!(store.get_query_state(&users).unwrap().status, Status::LoadingMore);
    assert_eq!(store.get_query_items(&users).len(), 3);
    assert_eq!(store.load_more(&users, None), LoadMoreResult::Skipped);

    store.wait_for_no_pending_requests().await;
    assert_eq!(store.get_query_items(&users).len(), 6);
    assert!(store.get_query_state(&users).unwrap().has_more);

    store.load_more(&users, None);
    store.wait_for_no_pending_requests().await;
    let query = store.get_query_state(&users).unwrap();
    assert_eq!(query.items.len(), 7);
    assert!(!query.has_more);
    assert_eq!(
      store.get_query_items(&users)[6].0,
      "users||7".to_string()
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_refresh_covers_loaded_pages() {
    let remote = remote_with(users_rows(7));
    let store = Users::new(options(&remote));
    let users = json!({"table": "users"});

    store.await_list_query_fetch(users.clone(), Some(3)).await;
    store.load_more(&users, None);
    store.wait_for_no_pending_requests().await;

    store.await_list_query_fetch(users.clone(), None).await;
    let last = remote.list_requests.lock().unwrap().last().cloned().unwrap();
    assert_eq!((last.offset, last.size), (0, 6));
    assert_eq!(store.get_query_items(&users).len(), 6);
  }

  #[tokio::test(start_paused = true)]
  async fn test_item_invalidation_reaches_synced_queries() {
    let mut rows = users_rows(3);
    rows.push(("posts||1".to_string(), json!({"id": 1})));
    let remote = remote_with(rows);
    let store = Users::new(options(&remote).sync_item_and_query(same_table));
    let all_users = json!({"table": "users"});
    let admins = json!({"table": "users", "role": "admin"});
    let posts = json!({"table": "posts"});
    for query in [&all_users, &admins, &posts] {
      store.await_list_query_fetch(query.clone(), None).await;
    }
    tokio::time::sleep(ms(500)).await;

    store.invalidate_item(ItemMatcher::Payload("users||1".to_string()), None);

    let state = store.state();
    assert_eq!(
      state.query(&all_users).unwrap().refetch_on_mount,
      Some(FetchPriority::LowPriority)
    );
    assert_eq!(
      state.query(&admins).unwrap().refetch_on_mount,
      Some(FetchPriority::LowPriority)
    );
    assert_eq!(state.query(&posts).unwrap().refetch_on_mount, None);
    assert_eq!(
      state.item_query(&"users||1".to_string()).unwrap().refetch_on_mount,
      Some(FetchPriority::LowPriority)
    );
    assert_eq!(remote.item_calls("users||1"), 0);

    let _item = store.item_consumer(&"users||1".to_string());
    let _consumers: Vec<Consumer> = [&all_users, &admins, &posts]
      .into_iter()
      .map(|query| store.query_consumer(query))
      .collect();
    store.wait_for_no_pending_requests().await;

    assert_eq!(remote.item_calls("users||1"), 1);
    assert_eq!(remote.list_calls(&all_users), 2);
    assert_eq!(remote.list_calls(&admins), 2);
    assert_eq!(remote.list_calls(&posts), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_query_invalidation_follows_sync_queries() {
    let remote = remote_with(users_rows(2));
    let store = Users::new(options(&remote).sync_queries(|a: &Value, b: &Value| {
      a["table"] == b["table"]
    }));
    let all_users = json!({"table": "users"});
    let admins = json!({"table": "users", "role": "admin"});
    let posts = json!({"table": "posts"});
    for query in [&all_users, &admins, &posts] {
      store.await_list_query_fetch(query.clone(), None).await;
    }

    store.invalidate_query(QueryMatcher::Payload(admins.clone()), Some(FetchPriority::HighPriority));

    let state = store.state();
    assert_eq!(
      state.query(&all_users).unwrap().refetch_on_mount,
      Some(FetchPriority::HighPriority)
    );
    assert_eq!(state.query(&posts).unwrap().refetch_on_mount, None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_query_invalidated_after_fetch_refetches() {
    let remote = remote_with(users_rows(2));
    let store = Users::new(options(&remote));
    let users = json!({"table": "users"});
    let _consumer = store.query_consumer(&users);
    store.await_list_query_fetch(users.clone(), None).await;

    tokio::time::sleep(ms(30)).await;
    store.invalidate_query(QueryMatcher::Payload(users.clone()), None);
    assert!(store.get_query_state(&users).unwrap().refetch_on_mount.is_some());

    store.wait_for_no_pending_requests().await;
    assert_eq!(remote.list_calls(&users), 2);
    assert_eq!(store.get_query_state(&users).unwrap().refetch_on_mount, None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_query_and_items() {
    let remote = remote_with(users_rows(2));
    let store = Users::new(options(&remote));
    let users = json!({"table": "users"});
    store.await_list_query_fetch(users.clone(), None).await;

    store.invalidate_query_and_items(QueryMatcher::Payload(users.clone()), None);

    let state = store.state();
    assert!(state.query(&users).unwrap().refetch_on_mount.is_some());
    for id in ["users||1", "users||2"] {
      assert!(state.item_query(&id.to_string()).unwrap().refetch_on_mount.is_some());
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_optimistic_insert_before_network() {
    let remote = remote_with(vec![(
      "users||1".to_string(),
      json!({"id": 1, "type": "admin"}),
    )]);
    let rule = OptimisticRule::new(QueryMatcher::filter(|q: &Value| q["role"] == "admin"), |item: &Value| {
      item["type"] == "admin"
    });
    let store = Users::new(options(&remote).with_optimistic_rule(rule));
    let admins = json!({"table": "users", "role": "admin"});
    store.await_list_query_fetch(admins.clone(), None).await;
    tokio::time::sleep(ms(500)).await;
    store.schedule_list_query_fetch(FetchPriority::HighPriority, admins.clone(), None);

    store.add_item_to_state("users||2".to_string(), json!({"id": 2, "type": "admin"}));

    let query = store.get_query_state(&admins).unwrap();
    assert_eq!(query.status, Status::Refetching);
    assert_eq!(query.items, vec![CacheKey::of("users||1"), CacheKey::of("users||2")]);
    assert_eq!(remote.item_calls("users||2"), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_update_moves_item_between_queries() {
    let remote = remote_with(vec![
      ("users||1".to_string(), json!({"id": 1, "type": "user"})),
      ("users||2".to_string(), json!({"id": 2, "type": "admin"})),
    ]);
    let admins = json!({"table": "users", "role": "admin"});
    let plain = json!({"table": "users", "role": "user"});
    let store = Users::new(
      options(&remote)
        .with_optimistic_rule(OptimisticRule::new(
          QueryMatcher::Payload(admins.clone()),
          |item: &Value| item["type"] == "admin",
        ))
        .with_optimistic_rule(OptimisticRule::new(
          QueryMatcher::Payload(plain.clone()),
          |item: &Value| item["type"] == "user",
        )),
    );
    store.await_list_query_fetch(admins.clone(), None).await;
    store.await_list_query_fetch(plain.clone(), None).await;

    store.update_item_state(ItemMatcher::Payload("users||1".to_string()), |item, _| {
      item["type"] = json!("admin");
    });

    assert_eq!(store.get_query_state(&admins).unwrap().items.len(), 2);
    assert!(store.get_query_state(&plain).unwrap().items.is_empty());
    assert_eq!(
      store.get_queries_related_to_item(&"users||1".to_string()),
      vec![admins]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_update_many_items_notifies_once() {
    let remote = remote_with(users_rows(4));
    let store = Users::new(options(&remote));
    store.await_list_query_fetch(json!({"table": "users"}), None).await;
    let notifications = Arc::new(AtomicUsize::new(0));
    let notifications_clone = notifications.clone();
    let _sub = store.subscribe(move |_, _| {
      notifications_clone.fetch_add(1, Ordering::SeqCst);
    });

    let matched = store.update_item_state(
      ItemMatcher::filter(|id: &String, _: &Value| id != "users||4"),
      |item, _| item["seen"] = json!(true),
    );

    assert_eq!(matched, 3);
    assert_eq!(notifications.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_delete_then_fetch_goes_through_loading() {
    let remote = remote_with(users_rows(2));
    let store = Users::new(options(&remote));
    let users = json!({"table": "users"});
    store.await_list_query_fetch(users.clone(), None).await;
    let id = "users||1".to_string();

    store.delete_item_state(&id);
    assert_eq!(store.get_item_state(&id).unwrap().status, Status::Deleted);
    assert!(store.get_item(&id).is_none());
    assert_eq!(store.get_query_state(&users).unwrap().items, vec![CacheKey::of("users||2")]);
    assert!(store.state().items.contains_key(&CacheKey::of("users||1")));

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let statuses_clone = statuses.clone();
    let watched = CacheKey::of("users||1");
    let _sub = store.subscribe(move |_, current| {
      statuses_clone
        .lock()
        .unwrap()
        .push(current.item_queries[&watched].status);
    });

    store.schedule_item_fetch(FetchPriority::HighPriority, id.clone());
    store.wait_for_no_pending_requests().await;
    assert_eq!(*statuses.lock().unwrap(), vec![Status::Loading, Status::Success]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_item_mutation_holds_synced_queries() {
    let remote = remote_with(users_rows(2));
    let store = Users::new(options(&remote).sync_item_and_query(same_table));
    let users = json!({"table": "users"});
    let posts = json!({"table": "posts"});
    store.await_list_query_fetch(users.clone(), None).await;
    store.await_list_query_fetch(posts.clone(), None).await;
    let id = "users||1".to_string();

    store.schedule_list_query_fetch(FetchPriority::HighPriority, users.clone(), None);
    store.start_item_mutation(&id);
    assert!(store.item_mutation_is_in_progress(&id));
    tokio::time::sleep(ms(100)).await;

    assert_eq!(remote.list_calls(&users), 2);
    assert_eq!(store.get_query_state(&users).unwrap().items.len(), 2);
    assert_eq!(
      store.schedule_list_query_fetch(FetchPriority::LowPriority, users.clone(), None),
      ScheduleResult::Skipped
    );
    assert_eq!(
      store.schedule_list_query_fetch(FetchPriority::HighPriority, posts.clone(), None),
      ScheduleResult::Started
    );

    store.end_item_mutation(&id);
    store.wait_for_no_pending_requests().await;
    assert!(!store.item_mutation_is_in_progress(&id));
    assert_eq!(remote.list_calls(&users), 3);
    assert_eq!(remote.list_calls(&posts), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_hydrated_data_refetches_on_consumer() {
    let remote = remote_with(users_rows(2));
    let users = json!({"table": "users"});
    let hydrated = users.clone();
    let store = Users::new(options(&remote).with_initial_data(move || InitialListData {
      items: Vec::new(),
      queries: vec![(
        hydrated,
        ListPage {
          items: vec![("users||1".to_string(), json!({"id": 1, "cached": true}))],
          has_more: true,
        },
      )],
    }));

    let query = store.get_query_state(&users).unwrap();
    assert_eq!(query.status, Status::Success);
    assert_eq!(query.refetch_on_mount, Some(FetchPriority::LowPriority));
    assert_eq!(store.get_query_items(&users).len(), 1);

    let _consumer = store.query_consumer(&users);
    store.wait_for_no_pending_requests().await;
    assert_eq!(remote.list_calls(&users), 1);
    assert_eq!(store.get_query_items(&users).len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_list_error_keeps_items() {
    let remote = remote_with(users_rows(2));
    let fail = Arc::new(AtomicUsize::new(0));
    let fail_clone = fail.clone();
    let lists = remote.clone();
    let store: Users = ListQueryStore::new(ListQueryOptions::new(
      move |request: ListRequest<Value>, _signal| {
        let failing = fail_clone.load(Ordering::SeqCst) > 0;
        let rows = lists.select(&request.payload);
        async move {
          if failing {
            return Err(eyre!("backend unavailable"));
          }
          Ok(ListPage {
            items: rows,
            has_more: false,
          })
        }
      },
      |id: String, _signal| async move { Err::<Value, _>(eyre!("{id} not found")) },
    ));
    let users = json!({"table": "users"});

    store.await_list_query_fetch(users.clone(), None).await;
    fail.store(1, Ordering::SeqCst);
    let awaited = store.await_list_query_fetch(users.clone(), None).await;

    assert_eq!(awaited.error, Some(FetchError::new("backend unavailable")));
    assert_eq!(awaited.items.len(), 2);
    assert_eq!(store.get_query_state(&users).unwrap().status, Status::Error);
  }
}
