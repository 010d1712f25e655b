//! Debounced scheduling
//!
//! A delayer coalesces bursts of invalidation into one run of its
//! committed action. `queue()` cancels whatever is pending or in flight
//! and restarts the quiet window; when the window elapses undisturbed
//! the action runs with a cancellation token it must re-check before
//! applying results, because a later `queue()` can supersede it while
//! the work is still in flight.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Quiet window used when none is configured.
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_secs(1);

/// Scheduling phase, observable for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing scheduled.
    Idle,
    /// Waiting out the quiet window.
    Pending,
    /// The committed action is running.
    InFlight,
}

type Action = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

struct DelayerState {
    phase: Phase,
    current: Option<CancellationToken>,
    generation: u64,
}

/// Debounced scheduler bound to one committed action.
#[derive(Clone)]
pub struct Delayer {
    quiet_period: Duration,
    action: Action,
    state: Arc<Mutex<DelayerState>>,
}

impl Delayer {
    pub fn new(
        action: impl Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            quiet_period: DEFAULT_QUIET_PERIOD,
            action: Arc::new(action),
            state: Arc::new(Mutex::new(DelayerState {
                phase: Phase::Idle,
                current: None,
                generation: 0,
            })),
        }
    }

    pub fn with_quiet_period(mut self, quiet_period: Duration) -> Self {
        self.quiet_period = quiet_period;
        self
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// Supersedes any pending or in-flight run and restarts the quiet
    /// window. Last write wins: a burst of calls produces one run.
    ///
    /// Requires an ambient Tokio runtime.
    pub fn queue(&self) {
        let token = CancellationToken::new();
        let generation = {
            let mut state = self.state.lock();
            if let Some(previous) = state.current.take() {
                previous.cancel();
            }
            state.generation += 1;
            state.phase = Phase::Pending;
            state.current = Some(token.clone());
            state.generation
        };

        let delayer = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delayer.quiet_period) => {}
            }

            {
                let mut state = delayer.state.lock();
                if state.generation != generation || token.is_cancelled() {
                    return;
                }
                state.phase = Phase::InFlight;
            }

            tracing::debug!(generation, "quiet window elapsed, running committed action");
            (delayer.action)(token.clone()).await;

            let mut state = delayer.state.lock();
            if state.generation == generation {
                state.phase = Phase::Idle;
                state.current = None;
            }
        });
    }

    /// Cancels without rescheduling. Idempotent from any phase.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if let Some(token) = state.current.take() {
            token.cancel();
        }
        state.generation += 1;
        state.phase = Phase::Idle;
    }
}
