//! Tunables shared by every store, loadable from YAML.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;

use crate::priority::FetchPriority;

/// Computes the realtime wait window from the duration of the last fetch.
pub type RealtimeThrottleFn = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Low priority requests closer than this to the last fetch start are coalesced into it
  pub low_priority_throttle_ms: u64,
  pub realtime_throttle: RealtimeThrottle,
  /// Page size for list queries when the caller passes none
  pub default_query_size: usize,
  /// Hydrated data is trusted as-is instead of being marked for a background refetch
  pub disable_initial_data_invalidation: bool,
  /// Priority used by collection and list invalidations when none is given
  pub default_invalidation_priority: FetchPriority,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      low_priority_throttle_ms: 200,
      realtime_throttle: RealtimeThrottle::default(),
      default_query_size: 20,
      disable_initial_data_invalidation: false,
      default_invalidation_priority: FetchPriority::LowPriority,
    }
  }
}

/// Default `dynamicRealtimeThrottleMs`: `clamp(last_duration * factor, min, max)`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeThrottle {
  pub min_ms: u64,
  pub max_ms: u64,
  pub duration_factor: f64,
}

impl Default for RealtimeThrottle {
  fn default() -> Self {
    Self {
      min_ms: 100,
      max_ms: 2000,
      duration_factor: 2.0,
    }
  }
}

impl RealtimeThrottle {
  pub fn window_for(&self, last_duration: Duration) -> Duration {
    let scaled = last_duration.as_millis() as f64 * self.duration_factor.max(0.0);
    let min = self.min_ms as f64;
    let max = (self.max_ms as f64).max(min);
    Duration::from_millis(scaled.clamp(min, max) as u64)
  }

  pub fn into_fn(self) -> RealtimeThrottleFn {
    Arc::new(move |last| self.window_for(last))
  }
}

impl SyncConfig {
  pub fn low_priority_throttle(&self) -> Duration {
    Duration::from_millis(self.low_priority_throttle_ms)
  }

  /// Load configuration.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./synq.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/synq/config.yaml
  ///
  /// Without any file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("synq.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("synq").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: SyncConfig = serde_yaml::from_str(contents)?;
    if config.default_query_size == 0 {
      return Err(eyre!("default_query_size must be at least 1"));
    }
    Ok(config)
  }
}
