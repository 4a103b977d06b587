use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lock a store mutex, recovering the guard if a listener or fetch callback
/// panicked while holding it.
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, op: &'static str) -> MutexGuard<'a, T> {
  match mutex.lock() {
    Ok(guard) => guard,
    Err(poisoned) => {
      warn!(
        op,
        result = "poisoned_recovered",
        "Recovered from poisoned store lock"
      );
      poisoned.into_inner()
    }
  }
}
