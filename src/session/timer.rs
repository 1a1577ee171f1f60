//! Cancellable one-shot timers
//!
//! The session manager arms at most one refresh timer at a time through a
//! [`Timer`]. [`TokioTimer`] spawns a task that sleeps and then runs the
//! callback; [`ManualTimer`] only records what was armed so tests can fire
//! callbacks explicitly.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;

/// Callback run when a timer fires.
pub type TimerTask = BoxFuture<'static, ()>;

/// Schedules one-shot callbacks.
pub trait Timer: Send + Sync + fmt::Debug {
    /// Runs `task` after `delay`; the returned handle can cancel it.
    fn arm(&self, delay: Duration, task: TimerTask) -> TimerHandle;
}

/// Handle to an armed timer.
///
/// Dropping the handle detaches the timer; only [`TimerHandle::cancel`]
/// stops it.
pub struct TimerHandle {
    delay: Duration,
    cancel: Box<dyn FnOnce() + Send>,
}

impl TimerHandle {
    /// Creates a handle that calls `cancel` when cancelled.
    pub fn new(delay: Duration, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            delay,
            cancel: Box::new(cancel),
        }
    }

    /// The delay the timer was armed with.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Cancels the timer if it has not fired yet.
    pub fn cancel(self) {
        (self.cancel)();
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

/// Timer backed by `tokio::spawn` and `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn arm(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        let abort = handle.abort_handle();
        TimerHandle::new(delay, move || abort.abort())
    }
}

// ---------------------------------------------------------------------------
// ManualTimer
// ---------------------------------------------------------------------------

struct ManualEntry {
    delay: Duration,
    cancelled: Arc<AtomicBool>,
    task: Option<TimerTask>,
}

/// Timer for tests: nothing runs until [`ManualTimer::fire_latest`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use oidcx::session::timer::{ManualTimer, Timer};
///
/// # #[tokio::main]
/// # async fn main() {
/// let timer = ManualTimer::new();
/// let handle = timer.arm(Duration::from_millis(60000), Box::pin(async {}));
/// assert_eq!(timer.delays(), vec![Duration::from_millis(60000)]);
/// assert_eq!(timer.pending(), 1);
///
/// handle.cancel();
/// assert_eq!(timer.pending(), 0);
/// assert!(!timer.fire_latest().await);
/// # }
/// ```
#[derive(Default)]
pub struct ManualTimer {
    entries: Mutex<Vec<ManualEntry>>,
}

impl ManualTimer {
    /// Creates an empty manual timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays of every timer armed so far, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.lock().iter().map(|e| e.delay).collect()
    }

    /// Number of timers that are neither cancelled nor fired.
    pub fn pending(&self) -> usize {
        self.lock()
            .iter()
            .filter(|e| e.task.is_some() && !e.cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Runs the most recently armed pending timer.
    ///
    /// Returns `false` when no timer is pending.
    pub async fn fire_latest(&self) -> bool {
        let task = {
            let mut entries = self.lock();
            entries
                .iter_mut()
                .rev()
                .find(|e| e.task.is_some() && !e.cancelled.load(Ordering::SeqCst))
                .and_then(|e| e.task.take())
        };
        match task {
            Some(task) => {
                task.await;
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ManualEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ManualTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualTimer")
            .field("delays", &self.delays())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Timer for ManualTimer {
    fn arm(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.lock().push(ManualEntry {
            delay,
            cancelled: cancelled.clone(),
            task: Some(task),
        });
        TimerHandle::new(delay, move || cancelled.store(true, Ordering::SeqCst))
    }
}
