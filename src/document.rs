//! A single remote resource.
//!
//! A [`DocumentStore`] pairs one [`FetchOrchestrator`] with one observable
//! [`DocumentState`]. Fetch results land in `data`; failures go through the
//! error normalizer into `error` while the previous `data` is kept.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use color_eyre::{Report, Result};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde::Serialize;
use tracing::debug;

use crate::cache_key::CacheKey;
use crate::config::SyncConfig;
use crate::consumer::{Consumer, ConsumerRegistry, RefetchTarget};
use crate::error::{default_normalizer, ErrorNormalizer, FetchError};
use crate::orchestrator::{AbortSignal, FetchAttempt, FetchOrchestrator, OrchestratorConfig};
use crate::priority::{merge_pending, FetchPriority, ScheduleResult};
use crate::status::Status;
use crate::store::{Data, Store, StoredError, Subscription};

type DocumentFetchFn<T> = Arc<dyn Fn(AbortSignal) -> BoxFuture<'static, Result<T>> + Send + Sync>;
type InitialDataFn<T> = Box<dyn FnOnce() -> Option<T> + Send>;

/// Snapshot of a document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentState<T, E = FetchError> {
  pub status: Status,
  pub data: Option<Arc<T>>,
  pub error: Option<E>,
  /// Refetch owed to the next active consumer
  pub refetch_on_mount: Option<FetchPriority>,
}

impl<T, E> Default for DocumentState<T, E> {
  fn default() -> Self {
    Self {
      status: Status::Idle,
      data: None,
      error: None,
      refetch_on_mount: None,
    }
  }
}

impl<T, E> DocumentState<T, E> {
  pub fn is_loading(&self) -> bool {
    self.status.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.status.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.status.is_error()
  }
}

/// Outcome of an awaited fetch: the settled data and error side by side.
#[derive(Debug, Clone, PartialEq)]
pub struct Awaited<T, E = FetchError> {
  pub data: Option<Arc<T>>,
  pub error: Option<E>,
}

/// Construction options for a [`DocumentStore`].
pub struct DocumentOptions<T, E = FetchError> {
  label: String,
  fetch_fn: DocumentFetchFn<T>,
  error_normalizer: ErrorNormalizer<E>,
  orchestrator: OrchestratorConfig,
  initial_data: Option<InitialDataFn<T>>,
  disable_initial_data_invalidation: bool,
}

impl<T: Send + 'static> DocumentOptions<T, FetchError> {
  pub fn new<F, Fut>(fetch_fn: F) -> Self
  where
    F: Fn(AbortSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    Self {
      label: "document".to_string(),
      fetch_fn: Arc::new(move |signal| fetch_fn(signal).boxed()),
      error_normalizer: default_normalizer(),
      orchestrator: OrchestratorConfig::default(),
      initial_data: None,
      disable_initial_data_invalidation: false,
    }
  }
}

impl<T, E> DocumentOptions<T, E> {
  /// Name used in logs.
  pub fn with_label(mut self, label: impl Into<String>) -> Self {
    self.label = label.into();
    self
  }

  /// Store errors in a caller-defined shape.
  pub fn with_error_normalizer<E2, F>(self, normalizer: F) -> DocumentOptions<T, E2>
  where
    F: Fn(&Report) -> E2 + Send + Sync + 'static,
  {
    DocumentOptions {
      label: self.label,
      fetch_fn: self.fetch_fn,
      error_normalizer: Arc::new(normalizer),
      orchestrator: self.orchestrator,
      initial_data: self.initial_data,
      disable_initial_data_invalidation: self.disable_initial_data_invalidation,
    }
  }

  pub fn with_config(mut self, config: &SyncConfig) -> Self {
    self.orchestrator = OrchestratorConfig::from_config(config);
    self.disable_initial_data_invalidation = config.disable_initial_data_invalidation;
    self
  }

  pub fn with_low_priority_throttle(mut self, throttle: Duration) -> Self {
    self.orchestrator.low_priority_throttle = throttle;
    self
  }

  /// Replace the realtime window function (`last fetch duration -> wait`).
  pub fn with_realtime_throttle<F>(mut self, throttle: F) -> Self
  where
    F: Fn(Duration) -> Duration + Send + Sync + 'static,
  {
    self.orchestrator.realtime_throttle = Arc::new(throttle);
    self
  }

  /// Hydrate the store at construction. Hydrated data is marked for a low
  /// priority refetch unless [`disable_initial_data_invalidation`] is set.
  ///
  /// [`disable_initial_data_invalidation`]: Self::disable_initial_data_invalidation
  pub fn with_initial_data<F>(mut self, initial_data: F) -> Self
  where
    F: FnOnce() -> Option<T> + Send + 'static,
  {
    self.initial_data = Some(Box::new(initial_data));
    self
  }

  pub fn disable_initial_data_invalidation(mut self) -> Self {
    self.disable_initial_data_invalidation = true;
    self
  }
}

struct DocumentInner<T, E> {
  key: CacheKey,
  store: Store<DocumentState<T, E>>,
  orchestrator: FetchOrchestrator,
  fetch_fn: DocumentFetchFn<T>,
  normalize_error: ErrorNormalizer<E>,
  consumers: ConsumerRegistry,
}

impl<T, E> DocumentInner<T, E>
where
  T: Data,
  E: StoredError,
{
  fn run_attempt(self: &Arc<Self>, attempt: FetchAttempt<()>) -> BoxFuture<'static, ()> {
    self.store.update(|state| {
      state.status = state.status.on_fetch_start();
      state.refetch_on_mount = None;
      true
    });

    let fetch = (self.fetch_fn)(attempt.abort.clone());
    let inner = Arc::clone(self);
    async move {
      let result = fetch.await;
      if attempt.should_abort() {
        debug!(resource = %inner.key, "Discarding result of aborted fetch");
        return;
      }
      inner.commit(result);
    }
    .boxed()
  }

  fn commit(&self, result: Result<T>) {
    match result {
      Ok(data) => {
        self.store.update(|state| {
          state.status = Status::Success;
          state.error = None;
          if state.data.as_deref() != Some(&data) {
            state.data = Some(Arc::new(data));
          }
          true
        });
      }
      Err(report) => {
        debug!(resource = %self.key, error = %report, "Fetch failed");
        let error = (self.normalize_error)(&report);
        self.store.update(|state| {
          state.status = Status::Error;
          state.error = Some(error);
          true
        });
      }
    }
  }
}

impl<T, E> RefetchTarget for DocumentInner<T, E>
where
  T: Data,
  E: StoredError,
{
  fn consumers(&self) -> &ConsumerRegistry {
    &self.consumers
  }

  // The attempt clears the pending priority when it starts.
  fn consume_pending(&self, _key: &CacheKey) {
    if let Some(priority) = self.store.state().refetch_on_mount {
      self.orchestrator.schedule_refetch(priority, ());
    }
  }
}

/// One remote resource with stale-while-revalidate semantics.
pub struct DocumentStore<T, E = FetchError> {
  inner: Arc<DocumentInner<T, E>>,
}

impl<T, E> Clone for DocumentStore<T, E> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T, E> DocumentStore<T, E>
where
  T: Data,
  E: StoredError,
{
  pub fn new(options: DocumentOptions<T, E>) -> Self {
    let DocumentOptions {
      label,
      fetch_fn,
      error_normalizer,
      orchestrator,
      initial_data,
      disable_initial_data_invalidation,
    } = options;

    let initial = match initial_data.and_then(|hydrate| hydrate()) {
      Some(data) => DocumentState {
        status: Status::Success,
        data: Some(Arc::new(data)),
        error: None,
        refetch_on_mount: (!disable_initial_data_invalidation).then_some(FetchPriority::LowPriority),
      },
      None => DocumentState::default(),
    };

    let inner = Arc::new_cyclic(|weak: &Weak<DocumentInner<T, E>>| {
      let weak = weak.clone();
      DocumentInner {
        key: CacheKey::of(&label),
        store: Store::new(initial),
        orchestrator: FetchOrchestrator::new(label, orchestrator, move |attempt| {
          match weak.upgrade() {
            Some(inner) => inner.run_attempt(attempt),
            None => future::ready(()).boxed(),
          }
        }),
        fetch_fn,
        normalize_error: error_normalizer,
        consumers: ConsumerRegistry::default(),
      }
    });

    Self { inner }
  }

  pub fn state(&self) -> Arc<DocumentState<T, E>> {
    self.inner.store.state()
  }

  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(&DocumentState<T, E>, &DocumentState<T, E>) + Send + Sync + 'static,
  {
    self.inner.store.subscribe(listener)
  }

  pub fn schedule_fetch(&self, priority: FetchPriority) -> ScheduleResult {
    self.inner.orchestrator.schedule_fetch(priority, ())
  }

  /// Like [`schedule_fetch`](Self::schedule_fetch) with an estimate of how
  /// long the fetch will take, used for the realtime window.
  pub fn schedule_fetch_with_hint(&self, priority: FetchPriority, estimated: Duration) -> ScheduleResult {
    self
      .inner
      .orchestrator
      .schedule_fetch_with_hint(priority, (), estimated)
  }

  /// Mark the data stale. Active consumers refetch right away; otherwise the
  /// refetch waits for the next consumer. Defaults to `HighPriority`.
  pub fn invalidate_data(&self, priority: Option<FetchPriority>) {
    let priority = priority.unwrap_or(FetchPriority::HighPriority);
    self.inner.store.update(|state| {
      let merged = merge_pending(state.refetch_on_mount, priority);
      let changed = state.refetch_on_mount != Some(merged);
      state.refetch_on_mount = Some(merged);
      changed
    });

    if self.inner.consumers.is_active(&self.inner.key) {
      self.inner.consume_pending(&self.inner.key);
    }
  }

  /// Schedule a high priority fetch and wait for the next settled state.
  pub async fn await_fetch(&self) -> Awaited<T, E> {
    let settled = self
      .inner
      .store
      .wait_for(
        |previous: &DocumentState<T, E>, current: &DocumentState<T, E>| {
          (previous.status.is_fetching() && current.status.is_settled()).then(|| Awaited {
            data: current.data.clone(),
            error: current.error.clone(),
          })
        },
        || {
          self.schedule_fetch(FetchPriority::HighPriority);
        },
      )
      .await;

    settled.unwrap_or_else(|| {
      let state = self.state();
      Awaited {
        data: state.data.clone(),
        error: state.error.clone(),
      }
    })
  }

  pub fn start_mutation(&self) {
    self.inner.orchestrator.start_mutation();
  }

  pub fn end_mutation(&self) {
    self.inner.orchestrator.end_mutation();
  }

  pub fn mutation_is_in_progress(&self) -> bool {
    self.inner.orchestrator.mutation_is_in_progress()
  }

  /// Optimistically edit the loaded data. Returns `false` (and notifies
  /// nobody) when there is no data or the recipe left it unchanged.
  pub fn update_state(&self, recipe: impl FnOnce(&mut T)) -> bool {
    self.inner.store.update(|state| {
      let Some(current) = state.data.as_deref() else {
        return false;
      };
      let mut draft = current.clone();
      recipe(&mut draft);
      if draft == *current {
        return false;
      }
      state.data = Some(Arc::new(draft));
      true
    })
  }

  /// Attach an on-screen consumer, consuming any pending refetch.
  pub fn consumer(&self) -> Consumer {
    let target: Weak<DocumentInner<T, E>> = Arc::downgrade(&self.inner);
    Consumer::attach(target, self.inner.key.clone())
  }

  pub fn has_pending_fetch(&self) -> bool {
    self.inner.orchestrator.has_pending_fetch()
  }

  pub async fn wait_for_no_pending_requests(&self) {
    self.inner.orchestrator.wait_for_no_pending_requests().await
  }
}
