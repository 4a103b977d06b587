//! Resource status lifecycle.
//!
//! ```text
//! idle ──▶ loading ──▶ success | error
//! success | error ──▶ refetching ──▶ success | error
//! success ──▶ deleted ──▶ loading (a new fetch re-enters the cycle)
//! success ──▶ loadingMore ──▶ success | error (list pagination only)
//! ```
//!
//! Data is never cleared by a status change: it stays visible while a
//! refetch or page load runs and next to an error.

use serde::Serialize;

/// The status of one cached resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Status {
  /// Never fetched
  #[default]
  Idle,
  /// First fetch in flight, no data yet
  Loading,
  /// Fetch in flight, previous data still served
  Refetching,
  /// Next page in flight, current pages still served
  LoadingMore,
  Success,
  Error,
  /// Soft-deleted locally; a new fetch may bring it back
  Deleted,
}

impl Status {
  /// A fetch for this resource is pending.
  pub fn is_fetching(self) -> bool {
    matches!(
      self,
      Status::Loading | Status::Refetching | Status::LoadingMore
    )
  }

  pub fn is_loading(self) -> bool {
    matches!(self, Status::Loading)
  }

  pub fn is_success(self) -> bool {
    matches!(self, Status::Success)
  }

  pub fn is_error(self) -> bool {
    matches!(self, Status::Error)
  }

  /// The fetch cycle ended (successfully or not).
  pub fn is_settled(self) -> bool {
    matches!(self, Status::Success | Status::Error)
  }

  /// Status entered when a replacing fetch starts.
  pub fn on_fetch_start(self) -> Status {
    match self {
      Status::Idle | Status::Deleted | Status::Loading => Status::Loading,
      Status::Success | Status::Error | Status::Refetching | Status::LoadingMore => {
        Status::Refetching
      }
    }
  }

  /// Status entered when a page load starts. Only a settled query can load more.
  pub fn on_load_more_start(self) -> Option<Status> {
    match self {
      Status::Success => Some(Status::LoadingMore),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_first_fetch_is_loading() {
    assert_eq!(Status::Idle.on_fetch_start(), Status::Loading);
    assert_eq!(Status::Loading.on_fetch_start(), Status::Loading);
  }

  #[test]
  fn test_settled_refetches() {
    assert_eq!(Status::Success.on_fetch_start(), Status::Refetching);
    assert_eq!(Status::Error.on_fetch_start(), Status::Refetching);
  }

  #[test]
  fn test_deleted_reloads() {
    assert_eq!(Status::Deleted.on_fetch_start(), Status::Loading);
    assert!(!Status::Deleted.is_settled());
  }

  #[test]
  fn test_load_more_requires_success() {
    assert_eq!(
      Status::Success.on_load_more_start(),
      Some(Status::LoadingMore)
    );
    assert_eq!(Status::Refetching.on_load_more_start(), None);
    assert_eq!(Status::Error.on_load_more_start(), None);
  }

  #[test]
  fn test_fetching_states() {
    for status in [Status::Loading, Status::Refetching, Status::LoadingMore] {
      assert!(status.is_fetching());
    }
    for status in [Status::Idle, Status::Success, Status::Error, Status::Deleted] {
      assert!(!status.is_fetching());
    }
  }
}
