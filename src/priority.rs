//! Fetch priorities and the pending-refetch merge.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a fetch is requested. Ranked `HighPriority > RealtimeUpdate > LowPriority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FetchPriority {
  /// Opportunistic refresh (mount, focus, broad invalidation). Throttled.
  LowPriority,
  /// Server-pushed change notification. Throttled by the realtime window.
  RealtimeUpdate,
  /// The caller needs fresh data now.
  HighPriority,
}

impl FetchPriority {
  pub const ALL: [FetchPriority; 3] = [
    FetchPriority::LowPriority,
    FetchPriority::RealtimeUpdate,
    FetchPriority::HighPriority,
  ];

  pub fn rank(self) -> u8 {
    match self {
      FetchPriority::LowPriority => 1,
      FetchPriority::RealtimeUpdate => 2,
      FetchPriority::HighPriority => 3,
    }
  }

  /// The higher ranked of the two.
  pub fn max_rank(self, other: FetchPriority) -> FetchPriority {
    if other.rank() > self.rank() {
      other
    } else {
      self
    }
  }
}

impl PartialOrd for FetchPriority {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for FetchPriority {
  fn cmp(&self, other: &Self) -> Ordering {
    self.rank().cmp(&other.rank())
  }
}

impl fmt::Display for FetchPriority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      FetchPriority::LowPriority => "lowPriority",
      FetchPriority::RealtimeUpdate => "realtimeUpdate",
      FetchPriority::HighPriority => "highPriority",
    })
  }
}

/// Outcome of a scheduling request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleResult {
  /// A fetch attempt began immediately.
  Started,
  /// A follow-up was queued (behind an in-flight fetch, a throttle window or a mutation).
  Scheduled,
  /// A follow-up was queued behind the realtime throttle window.
  RtScheduled,
  /// Nothing new was queued; an existing or queued fetch already covers the request.
  Skipped,
}

impl fmt::Display for ScheduleResult {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      ScheduleResult::Started => "started",
      ScheduleResult::Scheduled => "scheduled",
      ScheduleResult::RtScheduled => "rt-scheduled",
      ScheduleResult::Skipped => "skipped",
    })
  }
}

/// Merge an invalidation into the pending refetch reason.
///
/// The pending value only ever moves up in rank until it is consumed.
pub fn merge_pending(pending: Option<FetchPriority>, incoming: FetchPriority) -> FetchPriority {
  match pending {
    None => incoming,
    Some(current) => current.max_rank(incoming),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_rank_order() {
    assert!(FetchPriority::HighPriority > FetchPriority::RealtimeUpdate);
    assert!(FetchPriority::RealtimeUpdate > FetchPriority::LowPriority);
    assert_eq!(
      FetchPriority::ALL.iter().max(),
      Some(&FetchPriority::HighPriority)
    );
  }

  #[test]
  fn test_merge_never_downgrades() {
    for higher in FetchPriority::ALL {
      for lower in FetchPriority::ALL {
        if lower.rank() > higher.rank() {
          continue;
        }
        let pending = merge_pending(None, higher);
        assert_eq!(merge_pending(Some(pending), lower), higher);
      }
    }
  }

  #[test]
  fn test_merge_upgrades() {
    let pending = merge_pending(None, FetchPriority::LowPriority);
    assert_eq!(
      merge_pending(Some(pending), FetchPriority::RealtimeUpdate),
      FetchPriority::RealtimeUpdate
    );
  }

  #[test]
  fn test_serde_names() {
    assert_eq!(
      serde_json::to_string(&FetchPriority::RealtimeUpdate).unwrap(),
      "\"realtimeUpdate\""
    );
    assert_eq!(
      serde_json::to_string(&ScheduleResult::RtScheduled).unwrap(),
      "\"rt-scheduled\""
    );
    assert_eq!(ScheduleResult::RtScheduled.to_string(), "rt-scheduled");
  }
}
