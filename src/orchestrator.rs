//! Per-resource fetch scheduling.
//!
//! A [`FetchOrchestrator`] owns every fetch attempt for one cache key. It
//! guarantees that at most one attempt is outstanding at any time, keeps at
//! most one follow-up queued behind it, and coordinates attempts with the
//! caller's mutation brackets.
//!
//! Decisions are taken synchronously under a short lock; the attempt itself
//! runs on a spawned task. The attempt callback is invoked before
//! `schedule_fetch` returns, so its synchronous prologue (typically flipping
//! the resource to `loading`) is visible to the caller immediately.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::cache_key::CacheKey;
use crate::config::{RealtimeThrottleFn, SyncConfig};
use crate::lock::lock;
use crate::priority::{FetchPriority, ScheduleResult};

/// Extra request data carried by a fetch attempt.
///
/// When a request is folded into an already queued one the two are merged.
pub trait FetchKind: Clone + Send + Sync + 'static {
  /// Combine the queued request (`self`) with a newer one.
  fn merge(self, newer: Self) -> Self {
    newer
  }
}

impl FetchKind for () {}

/// Cooperative cancellation flag handed to fetch callbacks.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
  pub fn new() -> Self {
    Self::default()
  }

  /// The attempt was superseded; its result will be discarded.
  pub fn is_aborted(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }

  pub(crate) fn abort(&self) {
    self.0.store(true, Ordering::SeqCst);
  }
}

/// One fetch attempt as seen by the attempt callback.
#[derive(Debug, Clone)]
pub struct FetchAttempt<K> {
  pub priority: FetchPriority,
  pub kind: K,
  pub abort: AbortSignal,
}

impl<K> FetchAttempt<K> {
  pub fn should_abort(&self) -> bool {
    self.abort.is_aborted()
  }
}

type AttemptFn<K> = Arc<dyn Fn(FetchAttempt<K>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Timing knobs of an orchestrator.
#[derive(Clone)]
pub struct OrchestratorConfig {
  pub low_priority_throttle: Duration,
  pub realtime_throttle: RealtimeThrottleFn,
}

impl OrchestratorConfig {
  pub fn from_config(config: &SyncConfig) -> Self {
    Self {
      low_priority_throttle: config.low_priority_throttle(),
      realtime_throttle: config.realtime_throttle.clone().into_fn(),
    }
  }
}

impl Default for OrchestratorConfig {
  fn default() -> Self {
    Self::from_config(&SyncConfig::default())
  }
}

impl fmt::Debug for OrchestratorConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("OrchestratorConfig")
      .field("low_priority_throttle", &self.low_priority_throttle)
      .finish_non_exhaustive()
  }
}

struct InFlight<K> {
  id: u64,
  priority: FetchPriority,
  kind: K,
  started: Instant,
  abort: AbortSignal,
}

struct Queued<K> {
  priority: FetchPriority,
  kind: K,
}

impl<K: FetchKind> Queued<K> {
  fn absorb(self, priority: FetchPriority, kind: K) -> Self {
    Self {
      priority: self.priority.max_rank(priority),
      kind: self.kind.merge(kind),
    }
  }
}

/// What a low priority request inside the throttle window turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Spacing {
  /// Folded into the attempt that opened the window.
  Coalesce,
  /// Queued to start when the window closes.
  Defer,
}

enum Action<K> {
  Nothing,
  Start(FetchAttempt<K>, u64),
  ArmTimer { delay: Duration, generation: u64 },
}

struct Schedule<K> {
  in_flight: Option<InFlight<K>>,
  queued: Option<Queued<K>>,
  mutations: usize,
  timer_generation: u64,
  last_started: Option<Instant>,
  last_finished: Option<Instant>,
  last_duration: Option<Duration>,
  duration_hint: Option<Duration>,
  next_attempt_id: u64,
}

impl<K: FetchKind> Schedule<K> {
  fn new() -> Self {
    Self {
      in_flight: None,
      queued: None,
      mutations: 0,
      timer_generation: 0,
      last_started: None,
      last_finished: None,
      last_duration: None,
      duration_hint: None,
      next_attempt_id: 0,
    }
  }

  fn is_idle(&self) -> bool {
    self.in_flight.is_none() && self.queued.is_none()
  }

  fn decide(
    &mut self,
    priority: FetchPriority,
    kind: K,
    spacing: Spacing,
    now: Instant,
    config: &OrchestratorConfig,
  ) -> (ScheduleResult, Action<K>) {
    if self.mutations > 0 {
      return match self.queued.take() {
        None => {
          self.queued = Some(Queued { priority, kind });
          (ScheduleResult::Scheduled, Action::Nothing)
        }
        Some(queued) => {
          self.queued = Some(queued.absorb(priority, kind));
          (ScheduleResult::Skipped, Action::Nothing)
        }
      };
    }

    if let Some(queued) = self.queued.take() {
      if priority <= queued.priority {
        self.queued = Some(queued.absorb(priority, kind));
        return (ScheduleResult::Skipped, Action::Nothing);
      }

      self.queued = Some(queued.absorb(priority, kind));
      let result = queued_result(priority);
      if self.in_flight.is_some() {
        self.supersede_in_flight(priority);
        return (result, Action::Nothing);
      }

      // The follow-up was waiting on a timer; the upgrade shortens the wait.
      return match self.release(now, config) {
        start @ Action::Start(..) => (ScheduleResult::Started, start),
        other => (result, other),
      };
    }

    let coalesce = spacing == Spacing::Coalesce;
    let in_flight_started = self.in_flight.as_ref().map(|f| f.started);
    match in_flight_started {
      Some(started) => match priority {
        FetchPriority::LowPriority
          if coalesce && now.saturating_duration_since(started) < config.low_priority_throttle =>
        {
          (ScheduleResult::Skipped, Action::Nothing)
        }
        _ => {
          self.queued = Some(Queued { priority, kind });
          self.supersede_in_flight(priority);
          (queued_result(priority), Action::Nothing)
        }
      },
      None => match priority {
        FetchPriority::LowPriority if self.started_within(now, config.low_priority_throttle) => {
          if coalesce {
            return (ScheduleResult::Skipped, Action::Nothing);
          }
          self.queued = Some(Queued { priority, kind });
          (ScheduleResult::Scheduled, self.release(now, config))
        }
        FetchPriority::RealtimeUpdate => match self.realtime_wait(now, config) {
          Some(delay) => {
            self.queued = Some(Queued { priority, kind });
            (ScheduleResult::RtScheduled, self.arm_timer(delay))
          }
          None => {
            let attempt = self.begin(priority, kind, now);
            (ScheduleResult::Started, attempt)
          }
        },
        _ => {
          let attempt = self.begin(priority, kind, now);
          (ScheduleResult::Started, attempt)
        }
      },
    }
  }

  /// Start the queued follow-up now or arm a timer for when its window opens.
  fn release(&mut self, now: Instant, config: &OrchestratorConfig) -> Action<K> {
    if self.in_flight.is_some() || self.mutations > 0 {
      return Action::Nothing;
    }
    let Some(queued) = self.queued.as_ref() else {
      return Action::Nothing;
    };

    let wait = match queued.priority {
      FetchPriority::HighPriority => Duration::ZERO,
      FetchPriority::LowPriority => self
        .last_started
        .map(|started| (started + config.low_priority_throttle).saturating_duration_since(now))
        .unwrap_or_default(),
      FetchPriority::RealtimeUpdate => self.realtime_wait(now, config).unwrap_or_default(),
    };

    if !wait.is_zero() {
      return self.arm_timer(wait);
    }

    match self.queued.take() {
      Some(queued) => self.begin(queued.priority, queued.kind, now),
      None => Action::Nothing,
    }
  }

  fn begin(&mut self, priority: FetchPriority, kind: K, now: Instant) -> Action<K> {
    let id = self.next_attempt_id;
    self.next_attempt_id += 1;
    // Any armed timer is obsolete once an attempt runs.
    self.timer_generation += 1;
    self.last_started = Some(now);

    let abort = AbortSignal::new();
    self.in_flight = Some(InFlight {
      id,
      priority,
      kind: kind.clone(),
      started: now,
      abort: abort.clone(),
    });

    Action::Start(
      FetchAttempt {
        priority,
        kind,
        abort,
      },
      id,
    )
  }

  fn arm_timer(&mut self, delay: Duration) -> Action<K> {
    self.timer_generation += 1;
    Action::ArmTimer {
      delay,
      generation: self.timer_generation,
    }
  }

  /// Abort the in-flight attempt if `priority` outranks it.
  fn supersede_in_flight(&self, priority: FetchPriority) {
    if let Some(in_flight) = self.in_flight.as_ref().filter(|f| priority > f.priority) {
      trace!(superseded = %in_flight.priority, by = %priority, "Aborting outranked fetch attempt");
      in_flight.abort.abort();
    }
  }

  fn started_within(&self, now: Instant, window: Duration) -> bool {
    self
      .last_started
      .is_some_and(|started| now.saturating_duration_since(started) < window)
  }

  fn realtime_wait(&self, now: Instant, config: &OrchestratorConfig) -> Option<Duration> {
    let finished = self.last_finished?;
    let last_duration = self
      .duration_hint
      .or(self.last_duration)
      .unwrap_or_default();
    let ready_at = finished + (config.realtime_throttle)(last_duration);
    let wait = ready_at.saturating_duration_since(now);
    (!wait.is_zero()).then_some(wait)
  }
}

fn queued_result(priority: FetchPriority) -> ScheduleResult {
  match priority {
    FetchPriority::RealtimeUpdate => ScheduleResult::RtScheduled,
    _ => ScheduleResult::Scheduled,
  }
}

struct Inner<K> {
  label: String,
  config: OrchestratorConfig,
  run: AttemptFn<K>,
  schedule: Mutex<Schedule<K>>,
  settled: Notify,
}

impl<K: FetchKind> Inner<K> {
  fn perform(self: &Arc<Self>, action: Action<K>) {
    match action {
      Action::Nothing => {}
      Action::Start(attempt, id) => {
        trace!(
          resource = %self.label,
          priority = %attempt.priority,
          attempt = id,
          "Fetch attempt started"
        );
        let future = (self.run)(attempt);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
          future.await;
          inner.settle(id);
        });
      }
      Action::ArmTimer { delay, generation } => {
        trace!(resource = %self.label, ?delay, "Follow-up fetch waiting for its window");
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
          tokio::time::sleep(delay).await;
          if let Some(inner) = weak.upgrade() {
            inner.fire_timer(generation);
          }
        });
      }
    }
  }

  fn fire_timer(self: &Arc<Self>, generation: u64) {
    let action = {
      let mut schedule = lock(&self.schedule, "orchestrator.fire_timer");
      if schedule.timer_generation != generation {
        return;
      }
      schedule.release(Instant::now(), &self.config)
    };
    self.perform(action);
  }

  fn settle(self: &Arc<Self>, id: u64) {
    let (action, idle) = {
      let mut schedule = lock(&self.schedule, "orchestrator.settle");
      if schedule.in_flight.as_ref().map(|f| f.id) != Some(id) {
        return;
      }
      let Some(finished) = schedule.in_flight.take() else {
        return;
      };

      let now = Instant::now();
      schedule.last_finished = Some(now);
      if finished.abort.is_aborted() {
        debug!(resource = %self.label, attempt = id, "Aborted fetch attempt settled");
      } else {
        schedule.last_duration = Some(now.saturating_duration_since(finished.started));
        schedule.duration_hint = None;
      }

      let action = schedule.release(now, &self.config);
      (action, schedule.is_idle())
    };

    self.perform(action);
    if idle {
      self.settled.notify_waiters();
    }
  }
}

/// Concurrency controller for one resource.
pub struct FetchOrchestrator<K: FetchKind = ()> {
  inner: Arc<Inner<K>>,
}

impl<K: FetchKind> Clone for FetchOrchestrator<K> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<K: FetchKind> FetchOrchestrator<K> {
  /// Create an orchestrator around `run`, which performs one attempt.
  ///
  /// `run` is called synchronously when an attempt starts; the returned
  /// future is driven on a spawned task, so a tokio runtime must be running.
  pub fn new<F>(label: impl Into<String>, config: OrchestratorConfig, run: F) -> Self
  where
    F: Fn(FetchAttempt<K>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
  {
    Self {
      inner: Arc::new(Inner {
        label: label.into(),
        config,
        run: Arc::new(run),
        schedule: Mutex::new(Schedule::new()),
        settled: Notify::new(),
      }),
    }
  }

  /// Request a fetch. See the module docs for the start/queue/skip rules.
  pub fn schedule_fetch(&self, priority: FetchPriority, kind: K) -> ScheduleResult {
    self.request(priority, kind, Spacing::Coalesce)
  }

  /// Request a fetch because the data went stale.
  ///
  /// Unlike [`schedule_fetch`](Self::schedule_fetch) a low priority request
  /// is never folded into an earlier attempt, which may predate the change.
  /// Inside the throttle window it is queued until the window closes.
  pub fn schedule_refetch(&self, priority: FetchPriority, kind: K) -> ScheduleResult {
    self.request(priority, kind, Spacing::Defer)
  }

  fn request(&self, priority: FetchPriority, kind: K, spacing: Spacing) -> ScheduleResult {
    let (result, action) = {
      let mut schedule = lock(&self.inner.schedule, "orchestrator.schedule_fetch");
      schedule.decide(priority, kind, spacing, Instant::now(), &self.inner.config)
    };
    debug!(resource = %self.inner.label, %priority, %result, "Fetch requested");
    self.inner.perform(action);
    result
  }

  /// Like [`schedule_fetch`](Self::schedule_fetch), but the realtime window
  /// is computed from `estimated_duration` instead of the last measured
  /// duration until the next attempt completes.
  pub fn schedule_fetch_with_hint(
    &self,
    priority: FetchPriority,
    kind: K,
    estimated_duration: Duration,
  ) -> ScheduleResult {
    {
      let mut schedule = lock(&self.inner.schedule, "orchestrator.duration_hint");
      schedule.duration_hint = Some(estimated_duration);
    }
    self.schedule_fetch(priority, kind)
  }

  /// Start an attempt only if nothing is in flight, queued or mutating.
  pub fn try_start(&self, priority: FetchPriority, kind: K) -> ScheduleResult {
    let action = {
      let mut schedule = lock(&self.inner.schedule, "orchestrator.try_start");
      if schedule.mutations > 0 || !schedule.is_idle() {
        return ScheduleResult::Skipped;
      }
      schedule.begin(priority, kind, Instant::now())
    };
    self.inner.perform(action);
    ScheduleResult::Started
  }

  /// Enter a mutation bracket: the in-flight attempt is aborted and
  /// re-queued, and new requests are held until the bracket closes.
  pub fn start_mutation(&self) {
    let mut schedule = lock(&self.inner.schedule, "orchestrator.start_mutation");
    schedule.mutations += 1;
    schedule.timer_generation += 1;

    let requeue = schedule
      .in_flight
      .as_ref()
      .filter(|f| !f.abort.is_aborted())
      .map(|f| {
        f.abort.abort();
        (f.priority, f.kind.clone())
      });
    if let Some((priority, kind)) = requeue {
      debug!(resource = %self.inner.label, "Mutation aborted in-flight fetch");
      schedule.queued = Some(match schedule.queued.take() {
        None => Queued { priority, kind },
        Some(queued) => Queued {
          priority: queued.priority.max_rank(priority),
          kind: kind.merge(queued.kind),
        },
      });
    }
  }

  /// Leave a mutation bracket; the last one releases held requests.
  pub fn end_mutation(&self) {
    let action = {
      let mut schedule = lock(&self.inner.schedule, "orchestrator.end_mutation");
      if schedule.mutations == 0 {
        warn!(resource = %self.inner.label, "end_mutation called without a matching start_mutation");
        return;
      }
      schedule.mutations -= 1;
      if schedule.mutations > 0 {
        return;
      }
      schedule.release(Instant::now(), &self.inner.config)
    };
    self.inner.perform(action);
  }

  /// An attempt is in flight or a follow-up is queued.
  pub fn has_pending_fetch(&self) -> bool {
    !lock(&self.inner.schedule, "orchestrator.has_pending_fetch").is_idle()
  }

  /// An attempt is running right now.
  pub fn is_fetching(&self) -> bool {
    lock(&self.inner.schedule, "orchestrator.is_fetching")
      .in_flight
      .is_some()
  }

  pub fn mutation_is_in_progress(&self) -> bool {
    lock(&self.inner.schedule, "orchestrator.mutation_is_in_progress").mutations > 0
  }

  /// Duration of the last attempt that was not aborted.
  pub fn last_duration(&self) -> Option<Duration> {
    lock(&self.inner.schedule, "orchestrator.last_duration").last_duration
  }

  /// Resolves once nothing is in flight or queued.
  pub async fn wait_for_no_pending_requests(&self) {
    loop {
      let notified = self.inner.settled.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if !self.has_pending_fetch() {
        return;
      }
      notified.await;
    }
  }
}

impl<K: FetchKind> fmt::Debug for FetchOrchestrator<K> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let schedule = lock(&self.inner.schedule, "orchestrator.debug");
    f.debug_struct("FetchOrchestrator")
      .field("resource", &self.inner.label)
      .field("in_flight", &schedule.in_flight.as_ref().map(|i| i.priority))
      .field("queued", &schedule.queued.as_ref().map(|q| q.priority))
      .field("mutations", &schedule.mutations)
      .finish()
  }
}

/// Lazily populated orchestrators of one store, one per cache key.
pub(crate) struct OrchestratorRegistry<K: FetchKind> {
  orchestrators: Mutex<HashMap<CacheKey, FetchOrchestrator<K>>>,
}

impl<K: FetchKind> OrchestratorRegistry<K> {
  pub(crate) fn new() -> Self {
    Self {
      orchestrators: Mutex::new(HashMap::new()),
    }
  }

  pub(crate) fn get_or_create(
    &self,
    key: &CacheKey,
    create: impl FnOnce() -> FetchOrchestrator<K>,
  ) -> FetchOrchestrator<K> {
    lock(&self.orchestrators, "registry.get_or_create")
      .entry(key.clone())
      .or_insert_with(create)
      .clone()
  }

  pub(crate) fn get(&self, key: &CacheKey) -> Option<FetchOrchestrator<K>> {
    lock(&self.orchestrators, "registry.get").get(key).cloned()
  }

  pub(crate) fn has_pending_fetch(&self) -> bool {
    lock(&self.orchestrators, "registry.has_pending_fetch")
      .values()
      .any(|orchestrator| orchestrator.has_pending_fetch())
  }

  /// Resolves once no orchestrator has work in flight or queued.
  pub(crate) async fn wait_for_no_pending_requests(&self) {
    loop {
      let pending: Vec<FetchOrchestrator<K>> = lock(&self.orchestrators, "registry.wait")
        .values()
        .filter(|orchestrator| orchestrator.has_pending_fetch())
        .cloned()
        .collect();
      if pending.is_empty() {
        return;
      }
      for orchestrator in pending {
        orchestrator.wait_for_no_pending_requests().await;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::FutureExt;
  use std::sync::atomic::AtomicUsize;

  #[derive(Default)]
  struct Recorder {
    started: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
    aborted: AtomicUsize,
    priorities: Mutex<Vec<FetchPriority>>,
  }

  impl Recorder {
    fn started(&self) -> usize {
      self.started.load(Ordering::SeqCst)
    }
  }

  fn config() -> OrchestratorConfig {
    OrchestratorConfig {
      low_priority_throttle: Duration::from_millis(200),
      realtime_throttle: Arc::new(|_| Duration::from_millis(100)),
    }
  }

  fn orchestrator(duration: Duration) -> (FetchOrchestrator, Arc<Recorder>) {
    orchestrator_with(config(), duration)
  }

  fn orchestrator_with(
    config: OrchestratorConfig,
    duration: Duration,
  ) -> (FetchOrchestrator, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let recorder_clone = recorder.clone();
    let orchestrator = FetchOrchestrator::new("test", config, move |attempt: FetchAttempt<()>| {
      let recorder = recorder_clone.clone();
      recorder.started.fetch_add(1, Ordering::SeqCst);
      recorder.priorities.lock().unwrap().push(attempt.priority);
      let running = recorder.running.fetch_add(1, Ordering::SeqCst) + 1;
      recorder.max_running.fetch_max(running, Ordering::SeqCst);
      async move {
        tokio::time::sleep(duration).await;
        if attempt.should_abort() {
          recorder.aborted.fetch_add(1, Ordering::SeqCst);
        }
        recorder.running.fetch_sub(1, Ordering::SeqCst);
      }
      .boxed()
    });
    (orchestrator, recorder)
  }

  fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
  }

  #[tokio::test(start_paused = true)]
  async fn test_idle_fetch_starts_immediately() {
    let (orchestrator, recorder) = orchestrator(ms(30));

    assert_eq!(
      orchestrator.schedule_fetch(FetchPriority::HighPriority, ()),
      ScheduleResult::Started
    );
    assert_eq!(recorder.started(), 1);
    assert!(orchestrator.is_fetching());

    orchestrator.wait_for_no_pending_requests().await;
    assert!(!orchestrator.has_pending_fetch());
    let measured = orchestrator.last_duration().unwrap();
    assert!(measured >= ms(30) && measured < ms(35));
  }

  #[tokio::test(start_paused = true)]
  async fn test_low_priority_burst_runs_once() {
    let (orchestrator, recorder) = orchestrator(ms(50));

    let results: Vec<_> = (0..5)
      .map(|_| orchestrator.schedule_fetch(FetchPriority::LowPriority, ()))
      .collect();

    assert_eq!(results[0], ScheduleResult::Started);
    assert!(results[1..].iter().all(|r| *r == ScheduleResult::Skipped));

    tokio::time::sleep(ms(10)).await;
    assert_eq!(
      orchestrator.schedule_fetch(FetchPriority::LowPriority, ()),
      ScheduleResult::Skipped
    );

    orchestrator.wait_for_no_pending_requests().await;
    assert_eq!(recorder.started(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_low_priority_after_window_queues_one_follow_up() {
    let (orchestrator, recorder) = orchestrator(ms(300));

    orchestrator.schedule_fetch(FetchPriority::LowPriority, ());
    tokio::time::sleep(ms(250)).await;

    assert_eq!(
      orchestrator.schedule_fetch(FetchPriority::LowPriority, ()),
      ScheduleResult::Scheduled
    );
    assert_eq!(
      orchestrator.schedule_fetch(FetchPriority::LowPriority, ()),
      ScheduleResult::Skipped
    );

    orchestrator.wait_for_no_pending_requests().await;
    assert_eq!(recorder.started(), 2);
    assert_eq!(recorder.max_running.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_high_priority_queues_one_follow_up() {
    let (orchestrator, recorder) = orchestrator(ms(50));

    assert_eq!(
      orchestrator.schedule_fetch(FetchPriority::HighPriority, ()),
      ScheduleResult::Started
    );
    assert_eq!(
      orchestrator.schedule_fetch(FetchPriority::HighPriority, ()),
      ScheduleResult::Scheduled
    );
    assert_eq!(
      orchestrator.schedule_fetch(FetchPriority::HighPriority, ()),
      ScheduleResult::Skipped
    );

    // Follow-up is released as soon as the first attempt settles.
    tokio::time::sleep(ms(51)).await;
    assert_eq!(recorder.started(), 2);

    // Same rank: the running attempt is not superseded.
    orchestrator.wait_for_no_pending_requests().await;
    assert_eq!(recorder.aborted.load(Ordering::SeqCst), 0);
    assert_eq!(recorder.max_running.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_steady_high_priority_requests_keep_completing() {
    let (orchestrator, recorder) = orchestrator(ms(50));

    for _ in 0..25 {
      orchestrator.schedule_fetch(FetchPriority::HighPriority, ());
      tokio::time::sleep(ms(40)).await;
    }
    orchestrator.wait_for_no_pending_requests().await;

    assert!(recorder.started() > 15);
    assert_eq!(recorder.aborted.load(Ordering::SeqCst), 0);
    assert_eq!(recorder.max_running.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_high_priority_aborts_lower_ranked_attempt() {
    let (orchestrator, recorder) = orchestrator(ms(50));

    orchestrator.schedule_fetch(FetchPriority::RealtimeUpdate, ());
    assert_eq!(
      orchestrator.schedule_fetch(FetchPriority::HighPriority, ()),
      ScheduleResult::Scheduled
    );

    orchestrator.wait_for_no_pending_requests().await;
    assert_eq!(recorder.started(), 2);
    assert_eq!(recorder.aborted.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_refetch_after_settle_waits_for_window() {
    let (orchestrator, recorder) = orchestrator(ms(20));

    orchestrator.schedule_fetch(FetchPriority::LowPriority, ());
    orchestrator.wait_for_no_pending_requests().await;
    tokio::time::sleep(ms(30)).await;

    // A plain request is coalesced into the first start; a refetch is not.
    assert_eq!(
      orchestrator.schedule_fetch(FetchPriority::LowPriority, ()),
      ScheduleResult::Skipped
    );
    assert_eq!(
      orchestrator.schedule_refetch(FetchPriority::LowPriority, ()),
      ScheduleResult::Scheduled
    );
    assert!(orchestrator.has_pending_fetch());

    tokio::time::sleep(ms(140)).await;
    assert_eq!(recorder.started(), 1);
    tokio::time::sleep(ms(20)).await;
    assert_eq!(recorder.started(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_refetch_during_low_priority_attempt_queues_follow_up() {
    let (orchestrator, recorder) = orchestrator(ms(50));

    orchestrator.schedule_fetch(FetchPriority::LowPriority, ());
    tokio::time::sleep(ms(10)).await;
    assert_eq!(
      orchestrator.schedule_refetch(FetchPriority::LowPriority, ()),
      ScheduleResult::Scheduled
    );
    assert_eq!(
      orchestrator.schedule_refetch(FetchPriority::LowPriority, ()),
      ScheduleResult::Skipped
    );

    // The follow-up keeps the low priority spacing from the first start.
    tokio::time::sleep(ms(180)).await;
    assert_eq!(recorder.started(), 1);
    orchestrator.wait_for_no_pending_requests().await;
    assert_eq!(recorder.started(), 2);
    assert_eq!(recorder.aborted.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_realtime_follow_up_waits_for_window() {
    let (orchestrator, recorder) = orchestrator(ms(50));

    orchestrator.schedule_fetch(FetchPriority::HighPriority, ());
    assert_eq!(
      orchestrator.schedule_fetch(FetchPriority::RealtimeUpdate, ()),
      ScheduleResult::RtScheduled
    );
    assert_eq!(
      orchestrator.schedule_fetch(FetchPriority::RealtimeUpdate, ()),
      ScheduleResult::Skipped
    );

    // First attempt ends at 50ms, the window is 100ms.
    tokio::time::sleep(ms(140)).await;
    assert_eq!(recorder.started(), 1);
    tokio::time::sleep(ms(20)).await;
    assert_eq!(recorder.started(), 2);

    orchestrator.wait_for_no_pending_requests().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_realtime_while_idle_respects_window() {
    let (orchestrator, recorder) = orchestrator(ms(20));

    orchestrator.schedule_fetch(FetchPriority::HighPriority, ());
    orchestrator.wait_for_no_pending_requests().await;

    assert_eq!(
      orchestrator.schedule_fetch(FetchPriority::RealtimeUpdate, ()),
      ScheduleResult::RtScheduled
    );
    orchestrator.wait_for_no_pending_requests().await;
    assert_eq!(recorder.started(), 2);

    tokio::time::sleep(ms(500)).await;
    assert_eq!(
      orchestrator.schedule_fetch(FetchPriority::RealtimeUpdate, ()),
      ScheduleResult::Started
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_higher_priority_upgrades_queued_request() {
    let (orchestrator, recorder) = orchestrator(ms(300));

    orchestrator.schedule_fetch(FetchPriority::LowPriority, ());
    tokio::time::sleep(ms(250)).await;
    assert_eq!(
      orchestrator.schedule_fetch(FetchPriority::LowPriority, ()),
      ScheduleResult::Scheduled
    );
    assert_eq!(
      orchestrator.schedule_fetch(FetchPriority::HighPriority, ()),
      ScheduleResult::Scheduled
    );

    orchestrator.wait_for_no_pending_requests().await;
    assert_eq!(
      *recorder.priorities.lock().unwrap(),
      vec![FetchPriority::LowPriority, FetchPriority::HighPriority]
    );
    assert_eq!(recorder.aborted.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_lower_priority_never_downgrades_queued_request() {
    let (orchestrator, recorder) = orchestrator(ms(50));

    orchestrator.schedule_fetch(FetchPriority::HighPriority, ());
    orchestrator.schedule_fetch(FetchPriority::HighPriority, ());
    assert_eq!(
      orchestrator.schedule_fetch(FetchPriority::LowPriority, ()),
      ScheduleResult::Skipped
    );
    assert_eq!(
      orchestrator.schedule_fetch(FetchPriority::RealtimeUpdate, ()),
      ScheduleResult::Skipped
    );

    // A low follow-up would wait for the throttle window; a high one does not.
    tokio::time::sleep(ms(51)).await;
    assert_eq!(recorder.started(), 2);
    assert_eq!(
      recorder.priorities.lock().unwrap()[1],
      FetchPriority::HighPriority
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_mutation_aborts_and_holds_fetches() {
    let (orchestrator, recorder) = orchestrator(ms(50));

    orchestrator.schedule_fetch(FetchPriority::LowPriority, ());
    orchestrator.start_mutation();
    assert!(orchestrator.mutation_is_in_progress());

    assert_eq!(
      orchestrator.schedule_fetch(FetchPriority::HighPriority, ()),
      ScheduleResult::Skipped
    );

    tokio::time::sleep(ms(200)).await;
    assert_eq!(recorder.started(), 1);
    assert_eq!(recorder.aborted.load(Ordering::SeqCst), 1);
    assert!(orchestrator.has_pending_fetch());

    orchestrator.end_mutation();
    assert_eq!(recorder.started(), 2);
    assert_eq!(
      recorder.priorities.lock().unwrap()[1],
      FetchPriority::HighPriority
    );

    orchestrator.wait_for_no_pending_requests().await;
    assert_eq!(recorder.max_running.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_schedule_during_mutation_reports_first_deferral() {
    let (orchestrator, recorder) = orchestrator(ms(10));

    orchestrator.start_mutation();
    assert_eq!(
      orchestrator.schedule_fetch(FetchPriority::LowPriority, ()),
      ScheduleResult::Scheduled
    );
    assert_eq!(
      orchestrator.schedule_fetch(FetchPriority::LowPriority, ()),
      ScheduleResult::Skipped
    );
    assert_eq!(recorder.started(), 0);

    orchestrator.end_mutation();
    orchestrator.wait_for_no_pending_requests().await;
    assert_eq!(recorder.started(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_nested_mutations_release_on_last_end() {
    let (orchestrator, recorder) = orchestrator(ms(10));

    orchestrator.start_mutation();
    orchestrator.start_mutation();
    orchestrator.schedule_fetch(FetchPriority::HighPriority, ());

    orchestrator.end_mutation();
    assert_eq!(recorder.started(), 0);
    orchestrator.end_mutation();
    assert_eq!(recorder.started(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unmatched_end_mutation_is_ignored() {
    let (orchestrator, recorder) = orchestrator(ms(10));

    orchestrator.end_mutation();
    assert!(!orchestrator.mutation_is_in_progress());
    assert_eq!(
      orchestrator.schedule_fetch(FetchPriority::HighPriority, ()),
      ScheduleResult::Started
    );
    assert_eq!(recorder.started(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_try_start_only_when_idle() {
    let (orchestrator, recorder) = orchestrator(ms(10));

    assert_eq!(
      orchestrator.try_start(FetchPriority::HighPriority, ()),
      ScheduleResult::Started
    );
    assert_eq!(
      orchestrator.try_start(FetchPriority::HighPriority, ()),
      ScheduleResult::Skipped
    );
    orchestrator.wait_for_no_pending_requests().await;
    assert_eq!(recorder.started(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_duration_hint_widens_realtime_window() {
    let config = OrchestratorConfig {
      low_priority_throttle: ms(200),
      realtime_throttle: Arc::new(|last| last * 2),
    };
    let (orchestrator, recorder) = orchestrator_with(config, ms(20));

    orchestrator.schedule_fetch(FetchPriority::HighPriority, ());
    orchestrator.wait_for_no_pending_requests().await;
    tokio::time::sleep(ms(50)).await;

    // Measured 20ms gives a 40ms window that already passed; the hint does not.
    assert_eq!(
      orchestrator.schedule_fetch_with_hint(FetchPriority::RealtimeUpdate, (), ms(100)),
      ScheduleResult::RtScheduled
    );
    orchestrator.wait_for_no_pending_requests().await;
    assert_eq!(recorder.started(), 2);

    // The new measurement replaces the hint.
    tokio::time::sleep(ms(50)).await;
    assert_eq!(
      orchestrator.schedule_fetch(FetchPriority::RealtimeUpdate, ()),
      ScheduleResult::Started
    );
  }
}
