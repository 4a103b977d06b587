//! Field-level item fetches.
//!
//! List pages often carry trimmed records. When a partial fetcher is
//! configured, an item can be topped up with just the fields it is missing
//! instead of being refetched whole.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use color_eyre::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache_key::CacheKey;
use crate::orchestrator::{AbortSignal, FetchKind};
use crate::priority::{FetchPriority, ScheduleResult};
use crate::store::{Data, Payload, StoredError};

use super::{ListQueryOptions, ListQueryStore};

type PartialFetchFn<I, T> =
  Arc<dyn Fn(I, BTreeSet<String>, AbortSignal) -> BoxFuture<'static, Result<T>> + Send + Sync>;
type MergeFn<T> = Arc<dyn Fn(&T, T) -> T + Send + Sync>;

/// Which fields of an item record are cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldCoverage {
  All,
  Fields(BTreeSet<String>),
}

impl Default for FieldCoverage {
  fn default() -> Self {
    FieldCoverage::Fields(BTreeSet::new())
  }
}

impl FieldCoverage {
  pub fn covers(&self, field: &str) -> bool {
    match self {
      FieldCoverage::All => true,
      FieldCoverage::Fields(fields) => fields.contains(field),
    }
  }

  /// The subset of `requested` not cached yet.
  pub fn missing(&self, requested: &BTreeSet<String>) -> BTreeSet<String> {
    match self {
      FieldCoverage::All => BTreeSet::new(),
      FieldCoverage::Fields(fields) => requested.difference(fields).cloned().collect(),
    }
  }

  pub fn union(&self, other: &FieldCoverage) -> FieldCoverage {
    match (self, other) {
      (FieldCoverage::Fields(a), FieldCoverage::Fields(b)) => {
        FieldCoverage::Fields(a.union(b).cloned().collect())
      }
      _ => FieldCoverage::All,
    }
  }
}

/// Kind of item fetch attempt: the whole record or a set of fields.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct ItemFetch {
  pub(crate) fields: Option<BTreeSet<String>>,
}

impl ItemFetch {
  pub(crate) fn whole() -> Self {
    Self { fields: None }
  }
}

impl FetchKind for ItemFetch {
  fn merge(self, newer: Self) -> Self {
    match (self.fields, newer.fields) {
      (Some(mut older), Some(newer)) => {
        older.extend(newer);
        ItemFetch {
          fields: Some(older),
        }
      }
      _ => ItemFetch::whole(),
    }
  }
}

/// Result of an item attempt.
pub(crate) enum Fetched<T> {
  Full(T),
  Fields(T, BTreeSet<String>),
}

pub(crate) struct PartialFetch<I, T> {
  pub(crate) fetch: PartialFetchFn<I, T>,
  /// Folds a partial record into the cached one
  pub(crate) merge: MergeFn<T>,
}

impl<Q, I, T, E> ListQueryOptions<Q, I, T, E>
where
  I: Send + 'static,
  T: Send + 'static,
{
  /// Enable field-level fetches. `fetch` returns a record holding at least
  /// the requested fields; `merge(cached, fetched)` folds it into the cache.
  pub fn with_partial_fetch<F, Fut, M>(mut self, fetch: F, merge: M) -> Self
  where
    F: Fn(I, BTreeSet<String>, AbortSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    M: Fn(&T, T) -> T + Send + Sync + 'static,
  {
    self.partial = Some(PartialFetch {
      fetch: Arc::new(move |payload, fields, signal| fetch(payload, fields, signal).boxed()),
      merge: Arc::new(merge),
    });
    self
  }
}

impl<Q, I, T, E> ListQueryStore<Q, I, T, E>
where
  Q: Payload,
  I: Payload,
  T: Data,
  E: StoredError,
{
  /// Fetch only the `fields` an item is missing. Skipped when every field is
  /// cached already. Without a partial fetcher the whole item is fetched.
  pub fn schedule_item_fields_fetch<S>(&self, payload: I, fields: impl IntoIterator<Item = S>) -> ScheduleResult
  where
    S: Into<String>,
  {
    if self.inner.partial.is_none() {
      warn!(store = %self.inner.label, "No partial fetcher configured, fetching the whole item");
      return self.schedule_item_fetch(FetchPriority::HighPriority, payload);
    }

    let requested: BTreeSet<String> = fields.into_iter().map(Into::into).collect();
    let key = CacheKey::of(&payload);
    let gap = {
      let state = self.state();
      let has_data = state.items.get(&key).is_some_and(Option::is_some);
      match state.item_queries.get(&key) {
        Some(item) if has_data => item.fields.missing(&requested),
        _ => requested,
      }
    };
    if gap.is_empty() {
      return ScheduleResult::Skipped;
    }

    debug!(store = %self.inner.label, item = %key.fingerprint(), fields = ?gap, "Fetching missing fields");
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
      .schedule_fetch(FetchPriority::HighPriority, ItemFetch { fields: Some(gap) })
  }

  /// Every field in `fields` is cached for the item.
  pub fn item_has_fields(&self, payload: &I, fields: &[&str]) -> bool {
    let state = self.state();
    let key = CacheKey::of(payload);
    if !state.items.get(&key).is_some_and(Option::is_some) {
      return false;
    }
    state
      .item_queries
      .get(&key)
      .is_some_and(|item| fields.iter().all(|field| item.fields.covers(field)))
  }
}
