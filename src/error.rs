//! Fetch failure normalization.
//!
//! Fetch callbacks fail with an [`eyre::Report`](color_eyre::Report). Stores
//! never keep the report itself: it goes through an [`ErrorNormalizer`] and
//! the normalized value is what consumers see in `error`.

use std::fmt;
use std::sync::Arc;

use color_eyre::Report;
use serde::Serialize;

/// Converts a fetch failure into the error shape stored in state.
pub type ErrorNormalizer<E> = Arc<dyn Fn(&Report) -> E + Send + Sync>;

/// Default stored error: the rendered report chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FetchError {
  pub message: String,
}

impl FetchError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }

  pub fn from_report(report: &Report) -> Self {
    Self::new(format!("{report:#}"))
  }
}

impl fmt::Display for FetchError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.message)
  }
}

pub fn default_normalizer() -> ErrorNormalizer<FetchError> {
  Arc::new(FetchError::from_report)
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::{eyre, WrapErr};

  #[test]
  fn test_normalizer_renders_chain() {
    let report = Err::<(), _>(eyre!("404 not found"))
      .wrap_err("Failed to fetch users||7")
      .unwrap_err();

    let normalized = default_normalizer()(&report);
    assert_eq!(normalized.message, "Failed to fetch users||7: 404 not found");
  }
}
