//! Normalized state of a list-query store.
//!
//! Item data lives once in `items`; `item_queries` tracks the fetch status of
//! each item and `queries` the ordered membership of each list query.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::cache_key::CacheKey;
use crate::error::FetchError;
use crate::orchestrator::FetchKind;
use crate::priority::{merge_pending, FetchPriority};
use crate::status::Status;

use super::partial::FieldCoverage;

/// Fetch status of one item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemQueryState<I, E = FetchError> {
  pub payload: I,
  pub status: Status,
  pub error: Option<E>,
  pub was_loaded: bool,
  pub refetch_on_mount: Option<FetchPriority>,
  /// Fields present in the cached record
  pub fields: FieldCoverage,
}

impl<I, E> ItemQueryState<I, E> {
  pub(crate) fn empty(payload: I) -> Self {
    Self {
      payload,
      status: Status::Idle,
      error: None,
      was_loaded: false,
      refetch_on_mount: None,
      fields: FieldCoverage::default(),
    }
  }
}

/// One list query: its status and the ordered keys of its items.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryState<Q, E = FetchError> {
  pub payload: Q,
  pub status: Status,
  pub error: Option<E>,
  pub was_loaded: bool,
  pub refetch_on_mount: Option<FetchPriority>,
  pub items: Vec<CacheKey>,
  pub has_more: bool,
  /// Page size used for refreshes and page loads
  pub size: usize,
}

impl<Q, E> QueryState<Q, E> {
  pub(crate) fn empty(payload: Q, size: usize) -> Self {
    Self {
      payload,
      status: Status::Idle,
      error: None,
      was_loaded: false,
      refetch_on_mount: None,
      items: Vec::new(),
      has_more: false,
      size,
    }
  }

  /// A query that was never fetched but is known to contain `items`.
  pub(crate) fn synthesized(payload: Q, items: Vec<CacheKey>, size: usize) -> Self {
    Self {
      payload,
      status: Status::Success,
      error: None,
      was_loaded: true,
      refetch_on_mount: Some(FetchPriority::LowPriority),
      items,
      has_more: false,
      size,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQueryState<Q, I, T, E = FetchError> {
  /// Item data; `None` marks a deleted item.
  pub items: HashMap<CacheKey, Option<Arc<T>>>,
  pub item_queries: HashMap<CacheKey, Arc<ItemQueryState<I, E>>>,
  pub queries: HashMap<CacheKey, Arc<QueryState<Q, E>>>,
}

impl<Q, I, T, E> Default for ListQueryState<Q, I, T, E> {
  fn default() -> Self {
    Self {
      items: HashMap::new(),
      item_queries: HashMap::new(),
      queries: HashMap::new(),
    }
  }
}

impl<Q: Serialize, I: Serialize, T, E> ListQueryState<Q, I, T, E> {
  pub fn item(&self, payload: &I) -> Option<&Arc<T>> {
    self.items.get(&CacheKey::of(payload))?.as_ref()
  }

  pub fn item_query(&self, payload: &I) -> Option<&Arc<ItemQueryState<I, E>>> {
    self.item_queries.get(&CacheKey::of(payload))
  }

  pub fn query(&self, payload: &Q) -> Option<&Arc<QueryState<Q, E>>> {
    self.queries.get(&CacheKey::of(payload))
  }
}

impl<Q, I: Clone, T, E> ListQueryState<Q, I, T, E> {
  /// Items of a query in list order. Deleted items are left out.
  pub fn items_of(&self, query: &QueryState<Q, E>) -> Vec<(I, Arc<T>)> {
    query
      .items
      .iter()
      .filter_map(|key| {
        let data = self.items.get(key)?.clone()?;
        let payload = self.item_queries.get(key)?.payload.clone();
        Some((payload, data))
      })
      .collect()
  }
}

impl<Q, I, T, E> ListQueryState<Q, I, T, E>
where
  Q: Clone,
  I: Clone,
  T: Clone + PartialEq,
  E: Clone,
{
  /// The item slot for `key`, created empty if needed.
  pub(crate) fn ensure_item(&mut self, key: &CacheKey, payload: &I) -> &mut ItemQueryState<I, E> {
    self.items.entry(key.clone()).or_insert(None);
    let item = self
      .item_queries
      .entry(key.clone())
      .or_insert_with(|| Arc::new(ItemQueryState::empty(payload.clone())));
    Arc::make_mut(item)
  }

  /// Replace the data of `key`, keeping the old `Arc` when nothing changed.
  pub(crate) fn store_data(&mut self, key: &CacheKey, data: T) {
    let slot = self.items.entry(key.clone()).or_insert(None);
    if slot.as_deref() != Some(&data) {
      *slot = Some(Arc::new(data));
    }
  }

  /// Record data that arrived outside the item's own fetch (a list page, a
  /// local insert). A running item fetch keeps its status.
  pub(crate) fn put_item(&mut self, key: &CacheKey, payload: &I, data: T, fields: &FieldCoverage) {
    self.store_data(key, data);

    let item = self
      .item_queries
      .entry(key.clone())
      .or_insert_with(|| Arc::new(ItemQueryState::empty(payload.clone())));
    let status = if item.status.is_fetching() {
      item.status
    } else {
      Status::Success
    };
    let coverage = item.fields.union(fields);
    if item.status == status && item.was_loaded && item.error.is_none() && item.fields == coverage {
      return;
    }

    let item = Arc::make_mut(item);
    item.status = status;
    item.was_loaded = true;
    item.error = None;
    item.fields = coverage;
  }

  pub(crate) fn remove_from_queries(&mut self, key: &CacheKey) {
    for query in self.queries.values_mut() {
      if query.items.contains(key) {
        Arc::make_mut(query).items.retain(|other| other != key);
      }
    }
  }

  /// Merge `priority` into the pending refetch of the given entities.
  pub(crate) fn mark_pending(
    &mut self,
    items: &[CacheKey],
    queries: &[CacheKey],
    priority: FetchPriority,
  ) -> bool {
    let mut changed = false;
    for key in items {
      if let Some(item) = self.item_queries.get_mut(key) {
        let merged = merge_pending(item.refetch_on_mount, priority);
        if item.refetch_on_mount != Some(merged) {
          Arc::make_mut(item).refetch_on_mount = Some(merged);
          changed = true;
        }
      }
    }
    for key in queries {
      if let Some(query) = self.queries.get_mut(key) {
        let merged = merge_pending(query.refetch_on_mount, priority);
        if query.refetch_on_mount != Some(merged) {
          Arc::make_mut(query).refetch_on_mount = Some(merged);
          changed = true;
        }
      }
    }
    changed
  }

  /// Keys of items currently listed by any of `queries`, deduplicated.
  pub(crate) fn items_listed_in(&self, queries: &[CacheKey]) -> Vec<CacheKey> {
    let mut seen = HashSet::new();
    queries
      .iter()
      .filter_map(|key| self.queries.get(key))
      .flat_map(|query| query.items.iter())
      .filter(|key| seen.insert((*key).clone()))
      .cloned()
      .collect()
  }
}

/// One page of a list query as returned by the list fetcher.
#[derive(Debug, Clone, PartialEq)]
pub struct ListPage<I, T> {
  pub items: Vec<(I, T)>,
  pub has_more: bool,
}

/// What the list fetcher is asked for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListRequest<Q> {
  pub payload: Q,
  pub offset: usize,
  pub size: usize,
}

/// Outcome of [`load_more`](super::ListQueryStore::load_more).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadMoreResult {
  Started,
  /// Unknown or exhausted query, or another fetch is running
  Skipped,
}

/// Kind of list-query fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueryFetch {
  /// Reload from offset 0, covering at least what is already loaded
  Refresh { size: Option<usize> },
  /// Append the page after the loaded items
  LoadMore { size: Option<usize> },
}

impl FetchKind for QueryFetch {
  fn merge(self, newer: Self) -> Self {
    match (self, newer) {
      (QueryFetch::Refresh { size: older }, QueryFetch::Refresh { size }) => QueryFetch::Refresh {
        size: size.or(older),
      },
      (refresh @ QueryFetch::Refresh { .. }, QueryFetch::LoadMore { .. }) => refresh,
      (_, newer) => newer,
    }
  }
}

/// Items and queries known at construction.
pub struct InitialListData<Q, I, T> {
  pub items: Vec<(I, T)>,
  pub queries: Vec<(Q, ListPage<I, T>)>,
}

impl<Q, I, T> Default for InitialListData<Q, I, T> {
  fn default() -> Self {
    Self {
      items: Vec::new(),
      queries: Vec::new(),
    }
  }
}
