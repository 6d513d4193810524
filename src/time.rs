//! Injectable time source for reconnect timers.
//!
//! Production code uses [`TokioTime`]. Tests use [`ManualTime`], a virtual
//! clock that only moves when [`ManualTime::advance`] is called, so reconnect
//! behaviour can be asserted without real delays.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::future::{self, BoxFuture};
use tokio::{sync::oneshot, time::Instant};

/// Source of time for timers owned by ports.
pub trait TimeProvider: Send + Sync + fmt::Debug {
    /// Time elapsed since the provider was created.
    fn elapsed(&self) -> Duration;

    /// A future completing once `duration` has passed.
    ///
    /// The deadline is fixed when this method is called, not when the
    /// future is first polled.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Wall-clock time backed by the tokio timer.
#[derive(Clone, Copy, Debug)]
pub struct TokioTime {
    start: Instant,
}

impl TokioTime {
    /// Create a provider starting now.
    #[must_use]
    pub fn new() -> Self { Self { start: Instant::now() } }
}

impl Default for TokioTime {
    fn default() -> Self { Self::new() }
}

impl TimeProvider for TokioTime {
    fn elapsed(&self) -> Duration { self.start.elapsed() }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

struct Timer {
    deadline: Duration,
    seq: u64,
    wake: oneshot::Sender<()>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_seq: u64,
    timers: Vec<Timer>,
}

/// Virtual clock advanced explicitly by tests.
///
/// Cloning yields a handle to the same clock.
#[derive(Clone, Default)]
pub struct ManualTime {
    state: Arc<Mutex<ManualState>>,
}

impl ManualTime {
    /// Create a clock at time zero.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    fn with_state<R>(&self, f: impl FnOnce(&mut ManualState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Move the clock forward by `by`, waking every timer now due.
    ///
    /// Timers fire in deadline order. Returns how many fired.
    pub fn advance(&self, by: Duration) -> usize {
        let mut due = self.with_state(|state| {
            state.now += by;
            let now = state.now;
            let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.timers)
                .into_iter()
                .partition(|timer| timer.deadline <= now);
            state.timers = pending;
            due
        });
        due.sort_by_key(|timer| (timer.deadline, timer.seq));
        due.into_iter()
            .filter_map(|timer| timer.wake.send(()).ok())
            .count()
    }

    /// Timers registered and not yet fired or abandoned.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.with_state(|state| {
            state.timers.retain(|timer| !timer.wake.is_closed());
            state.timers.len()
        })
    }
}

impl fmt::Debug for ManualTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with_state(|state| {
            f.debug_struct("ManualTime")
                .field("now", &state.now)
                .field("timers", &state.timers.len())
                .finish()
        })
    }
}

impl TimeProvider for ManualTime {
    fn elapsed(&self) -> Duration { self.with_state(|state| state.now) }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        if duration.is_zero() {
            return Box::pin(future::ready(()));
        }
        let (wake, fired) = oneshot::channel();
        self.with_state(|state| {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.timers.push(Timer {
                deadline: state.now + duration,
                seq,
                wake,
            });
        });
        Box::pin(async move {
            // A dropped clock never advances again.
            if fired.await.is_err() {
                future::pending::<()>().await;
            }
        })
    }
}
