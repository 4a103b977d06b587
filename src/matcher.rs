//! Selecting cached items and queries.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use crate::cache_key::CacheKey;

type ItemFilter<P, T> = Box<dyn Fn(&P, &T) -> bool + Send + Sync>;
type QueryFilter<Q> = Box<dyn Fn(&Q) -> bool + Send + Sync>;

/// Selects cached items by payload or by a predicate over `(payload, data)`.
///
/// Predicates only see items that currently hold data.
pub enum ItemMatcher<P, T> {
  Payload(P),
  Payloads(Vec<P>),
  Filter(ItemFilter<P, T>),
}

impl<P: Serialize, T> ItemMatcher<P, T> {
  pub fn filter<F>(filter: F) -> Self
  where
    F: Fn(&P, &T) -> bool + Send + Sync + 'static,
  {
    ItemMatcher::Filter(Box::new(filter))
  }

  pub(crate) fn resolve(&self) -> ResolvedItemMatcher<'_, P, T> {
    match self {
      ItemMatcher::Payload(payload) => {
        ResolvedItemMatcher::Keys(HashSet::from([CacheKey::of(payload)]))
      }
      ItemMatcher::Payloads(payloads) => {
        ResolvedItemMatcher::Keys(payloads.iter().map(CacheKey::of).collect())
      }
      ItemMatcher::Filter(filter) => ResolvedItemMatcher::Filter(filter.as_ref()),
    }
  }
}

impl<P: fmt::Debug, T> fmt::Debug for ItemMatcher<P, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ItemMatcher::Payload(payload) => f.debug_tuple("Payload").field(payload).finish(),
      ItemMatcher::Payloads(payloads) => f.debug_tuple("Payloads").field(payloads).finish(),
      ItemMatcher::Filter(_) => f.write_str("Filter(..)"),
    }
  }
}

pub(crate) enum ResolvedItemMatcher<'a, P, T> {
  Keys(HashSet<CacheKey>),
  Filter(&'a (dyn Fn(&P, &T) -> bool + Send + Sync)),
}

impl<P, T> ResolvedItemMatcher<'_, P, T> {
  pub(crate) fn matches(&self, key: &CacheKey, payload: &P, data: Option<&T>) -> bool {
    match self {
      ResolvedItemMatcher::Keys(keys) => keys.contains(key),
      ResolvedItemMatcher::Filter(filter) => data.is_some_and(|data| filter(payload, data)),
    }
  }

  /// Keys that can be matched without looking at any state.
  pub(crate) fn explicit_keys(&self) -> Option<&HashSet<CacheKey>> {
    match self {
      ResolvedItemMatcher::Keys(keys) => Some(keys),
      ResolvedItemMatcher::Filter(_) => None,
    }
  }
}

/// Selects list queries by payload or by a predicate over the payload.
pub enum QueryMatcher<Q> {
  Payload(Q),
  Payloads(Vec<Q>),
  Filter(QueryFilter<Q>),
}

impl<Q: Serialize> QueryMatcher<Q> {
  pub fn filter<F>(filter: F) -> Self
  where
    F: Fn(&Q) -> bool + Send + Sync + 'static,
  {
    QueryMatcher::Filter(Box::new(filter))
  }

  pub(crate) fn matches(&self, key: &CacheKey, payload: &Q) -> bool {
    match self {
      QueryMatcher::Payload(expected) => CacheKey::of(expected) == *key,
      QueryMatcher::Payloads(expected) => expected.iter().any(|q| CacheKey::of(q) == *key),
      QueryMatcher::Filter(filter) => filter(payload),
    }
  }

  /// Payloads named explicitly, which can be synthesized when missing.
  pub(crate) fn explicit_payloads(&self) -> &[Q] {
    match self {
      QueryMatcher::Payload(payload) => std::slice::from_ref(payload),
      QueryMatcher::Payloads(payloads) => payloads,
      QueryMatcher::Filter(_) => &[],
    }
  }
}

impl<Q: fmt::Debug> fmt::Debug for QueryMatcher<Q> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      QueryMatcher::Payload(payload) => f.debug_tuple("Payload").field(payload).finish(),
      QueryMatcher::Payloads(payloads) => f.debug_tuple("Payloads").field(payloads).finish(),
      QueryMatcher::Filter(_) => f.write_str("Filter(..)"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_payload_matcher_uses_cache_keys() {
    let matcher: ItemMatcher<serde_json::Value, u32> = ItemMatcher::Payload(json!({"b": 1, "a": 2}));
    let resolved = matcher.resolve();
    let key = CacheKey::of(&json!({"a": 2, "b": 1}));

    assert!(resolved.matches(&key, &json!({"a": 2, "b": 1}), None));
    assert!(resolved.explicit_keys().is_some());
  }

  #[test]
  fn test_filter_skips_items_without_data() {
    let matcher: ItemMatcher<String, u32> = ItemMatcher::filter(|_, value| *value > 1);
    let resolved = matcher.resolve();
    let key = CacheKey::of("x");

    assert!(resolved.matches(&key, &"x".to_string(), Some(&2)));
    assert!(!resolved.matches(&key, &"x".to_string(), Some(&1)));
    assert!(!resolved.matches(&key, &"x".to_string(), None));
  }

  #[test]
  fn test_query_matcher() {
    let exact = QueryMatcher::Payload(json!({"table": "users"}));
    let key = CacheKey::of(&json!({"table": "users"}));
    assert!(exact.matches(&key, &json!({"table": "users"})));
    assert_eq!(exact.explicit_payloads().len(), 1);

    let filter = QueryMatcher::filter(|q: &serde_json::Value| q["table"] == "users");
    assert!(filter.matches(&key, &json!({"table": "users"})));
    assert!(filter.explicit_payloads().is_empty());
  }
}
