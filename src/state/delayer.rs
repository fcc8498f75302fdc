use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::retry::RetryDelays;
use crate::signal::CancelToken;

/// Decides how long a [`ComputedState`](super::ComputedState) waits between being invalidated
/// and recomputing.
#[async_trait]
pub trait UpdateDelayer: Send + Sync + 'static {
    /// Wait before the next update.
    ///
    /// `retry_count` is the number of consecutive failed updates. Returns early when `cancel`
    /// fires.
    async fn delay(&self, retry_count: u32, cancel: &CancelToken);
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancelToken) {
    if delay.is_zero() {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = cancel.cancelled() => {}
    }
}

/// Waits a fixed time, stretched by retry delays after failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedDelayer {
    delay: Duration,
    retry_delays: RetryDelays,
}

impl FixedDelayer {
    /// Wait `delay` before every update.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            retry_delays: RetryDelays::default(),
        }
    }

    /// Update right away (unless the last updates failed).
    pub fn zero() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Use `retry_delays` after failed updates.
    pub fn with_retry_delays(mut self, retry_delays: RetryDelays) -> Self {
        self.retry_delays = retry_delays;
        self
    }

    /// The delay for the given retry count.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            self.delay
        } else {
            self.delay.max(self.retry_delays.get(retry_count))
        }
    }
}

impl Default for FixedDelayer {
    fn default() -> Self {
        Self::zero()
    }
}

#[async_trait]
impl UpdateDelayer for FixedDelayer {
    async fn delay(&self, retry_count: u32, cancel: &CancelToken) {
        sleep_or_cancel(self.delay_for(retry_count), cancel).await;
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct TrackerState {
    running: usize,
    started: u64,
}

struct TrackerInner {
    state: watch::Sender<TrackerState>,
    last_completed_at: Mutex<Option<Instant>>,
    instant_update_period: Duration,
}

/// Counts user actions in flight.
///
/// While an action runs, and for a short period after it completes, a [`UiUpdateDelayer`]
/// updates without waiting.
#[derive(Clone)]
pub struct UiActionTracker {
    inner: Arc<TrackerInner>,
}

impl UiActionTracker {
    /// Create a tracker. Updates stay instant for `instant_update_period` after an action
    /// completes.
    pub fn new(instant_update_period: Duration) -> Self {
        let (state, _) = watch::channel(TrackerState::default());
        Self {
            inner: Arc::new(TrackerInner {
                state,
                last_completed_at: Mutex::new(None),
                instant_update_period,
            }),
        }
    }

    /// Mark an action as running until the returned guard is dropped.
    pub fn start_action(&self) -> UiActionGuard {
        self.inner.state.send_modify(|s| {
            s.running += 1;
            s.started += 1;
        });
        UiActionGuard {
            tracker: self.clone(),
        }
    }

    /// Number of running actions.
    pub fn running_count(&self) -> usize {
        self.inner.state.borrow().running
    }

    /// Returns true if an action is running or completed within the instant update period.
    pub fn is_instant_update_window(&self) -> bool {
        if self.running_count() > 0 {
            return true;
        }
        self.inner
            .last_completed_at
            .lock()
            .is_some_and(|at| at.elapsed() < self.inner.instant_update_period)
    }

    /// Wait until an action is running or a new one was started.
    pub async fn when_active(&self) {
        let mut rx = self.inner.state.subscribe();
        let initial = *rx.borrow_and_update();
        if initial.running > 0 {
            return;
        }
        while rx.changed().await.is_ok() {
            let state = *rx.borrow_and_update();
            if state.running > 0 || state.started != initial.started {
                return;
            }
        }
    }
}

impl Default for UiActionTracker {
    fn default() -> Self {
        Self::new(Duration::from_millis(300))
    }
}

impl fmt::Debug for UiActionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UiActionTracker")
            .field("running", &self.running_count())
            .finish()
    }
}

/// A running action. Dropping it completes the action.
#[must_use = "the action completes when the guard is dropped"]
pub struct UiActionGuard {
    tracker: UiActionTracker,
}

impl Drop for UiActionGuard {
    fn drop(&mut self) {
        let inner = &self.tracker.inner;
        *inner.last_completed_at.lock() = Some(Instant::now());
        inner.state.send_modify(|s| s.running -= 1);
    }
}

/// Delayer for UI-facing states: waits a fixed time, but updates right away while the user
/// is acting.
#[derive(Debug, Clone)]
pub struct UiUpdateDelayer {
    tracker: UiActionTracker,
    delay: FixedDelayer,
}

impl UiUpdateDelayer {
    /// Wait `delay`, cut short by activity on `tracker`.
    pub fn new(tracker: UiActionTracker, delay: Duration) -> Self {
        Self {
            tracker,
            delay: FixedDelayer::new(delay),
        }
    }

    /// Use `retry_delays` after failed updates.
    pub fn with_retry_delays(mut self, retry_delays: RetryDelays) -> Self {
        self.delay = self.delay.with_retry_delays(retry_delays);
        self
    }

    /// The tracker this delayer listens to.
    pub fn tracker(&self) -> &UiActionTracker {
        &self.tracker
    }
}

#[async_trait]
impl UpdateDelayer for UiUpdateDelayer {
    async fn delay(&self, retry_count: u32, cancel: &CancelToken) {
        // Failed updates always back off.
        if retry_count > 0 {
            return self.delay.delay(retry_count, cancel).await;
        }
        if self.tracker.is_instant_update_window() {
            return;
        }
        tokio::select! {
            _ = sleep_or_cancel(self.delay.delay_for(0), cancel) => {}
            _ = self.tracker.when_active() => {}
        }
    }
}
