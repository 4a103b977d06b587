//! Optimistic list membership.
//!
//! Rules keep query item lists in step with local item writes before the
//! server confirms them: an item that passes `filter_item` is inserted into
//! every matching query (sorted or appended), an item that no longer passes
//! is removed.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::cache_key::CacheKey;
use crate::matcher::QueryMatcher;
use crate::store::{Data, Payload};

use super::state::{ListQueryState, QueryState};

type ItemFilter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;
type ItemOrder<T> = Box<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Where unsorted new items go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppendTo {
  Start,
  #[default]
  End,
}

/// Keeps matching queries' item lists in step with local item writes.
pub struct OptimisticRule<Q, T> {
  queries: QueryMatcher<Q>,
  filter_item: ItemFilter<T>,
  sort: Option<ItemOrder<T>>,
  append_new_to: AppendTo,
  invalidate_queries: bool,
}

impl<Q, T> OptimisticRule<Q, T> {
  pub fn new<F>(queries: QueryMatcher<Q>, filter_item: F) -> Self
  where
    F: Fn(&T) -> bool + Send + Sync + 'static,
  {
    Self {
      queries,
      filter_item: Box::new(filter_item),
      sort: None,
      append_new_to: AppendTo::End,
      invalidate_queries: false,
    }
  }

  /// Keep member lists ordered by `order`; items without data sort last.
  pub fn sort_by<F>(mut self, order: F) -> Self
  where
    F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
  {
    self.sort = Some(Box::new(order));
    self
  }

  pub fn append_new_to(mut self, position: AppendTo) -> Self {
    self.append_new_to = position;
    self
  }

  /// Also invalidate every query whose list this rule changed.
  pub fn invalidate_queries(mut self) -> Self {
    self.invalidate_queries = true;
    self
  }
}

impl<Q: std::fmt::Debug, T> std::fmt::Debug for OptimisticRule<Q, T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OptimisticRule")
      .field("queries", &self.queries)
      .field("sorted", &self.sort.is_some())
      .field("append_new_to", &self.append_new_to)
      .field("invalidate_queries", &self.invalidate_queries)
      .finish()
  }
}

fn sort_keys<T>(keys: &mut [CacheKey], items: &HashMap<CacheKey, Option<Arc<T>>>, order: &ItemOrder<T>) {
  let data = |key: &CacheKey| items.get(key).and_then(|data| data.as_deref());
  keys.sort_by(|a, b| match (data(a), data(b)) {
    (Some(a), Some(b)) => order(a, b),
    (Some(_), None) => Ordering::Less,
    (None, Some(_)) => Ordering::Greater,
    (None, None) => Ordering::Equal,
  });
}

/// Apply `rules` to the item at `key` after its data changed.
///
/// Returns the queries that changed under rules asking for invalidation.
pub(crate) fn apply_rules<Q, I, T, E>(
  rules: &[OptimisticRule<Q, T>],
  state: &mut ListQueryState<Q, I, T, E>,
  key: &CacheKey,
  page_size: usize,
) -> Vec<CacheKey>
where
  Q: Payload,
  I: Clone,
  T: Data,
  E: Clone,
{
  let data = state.items.get(key).cloned().flatten();
  let mut to_invalidate = Vec::new();

  for rule in rules {
    let include = data.as_deref().is_some_and(|data| (rule.filter_item)(data));

    if include {
      for payload in rule.queries.explicit_payloads() {
        let query_key = CacheKey::of(payload);
        if state.queries.contains_key(&query_key) {
          continue;
        }
        debug!(query = %query_key.fingerprint(), "Synthesized query for optimistic item");
        let query = QueryState::synthesized(payload.clone(), vec![key.clone()], page_size);
        state.queries.insert(query_key, Arc::new(query));
      }
    }

    let matched: Vec<CacheKey> = state
      .queries
      .iter()
      .filter(|(query_key, query)| rule.queries.matches(query_key, &query.payload))
      .map(|(query_key, _)| query_key.clone())
      .collect();

    for query_key in matched {
      let Some(query) = state.queries.get(&query_key) else {
        continue;
      };
      let position = query.items.iter().position(|member| member == key);

      let next = match (include, position) {
        (true, None) => {
          let mut items = query.items.clone();
          match rule.append_new_to {
            AppendTo::Start => items.insert(0, key.clone()),
            AppendTo::End => items.push(key.clone()),
          }
          if let Some(order) = &rule.sort {
            sort_keys(&mut items, &state.items, order);
          }
          Some(items)
        }
        (true, Some(_)) => rule.sort.as_ref().and_then(|order| {
          let mut items = query.items.clone();
          sort_keys(&mut items, &state.items, order);
          (items != query.items).then_some(items)
        }),
        (false, Some(index)) => {
          let mut items = query.items.clone();
          items.remove(index);
          Some(items)
        }
        (false, None) => None,
      };

      let Some(items) = next else {
        continue;
      };
      if let Some(query) = state.queries.get_mut(&query_key) {
        Arc::make_mut(query).items = items;
      }
      if rule.invalidate_queries {
        to_invalidate.push(query_key);
      }
    }
  }

  to_invalidate
}
