//! Delayed and periodic tasks that can be cancelled without racing the timer.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Handle to a task created by [`Scheduler`].
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    token: CancellationToken,
    state: Arc<AtomicU8>,
}

impl ScheduledTask {
    /// Cancel the task.
    ///
    /// Returns true if cancellation won, i.e. a one-shot action had not
    /// started and never will. Returns false once the action has fired.
    pub fn cancel(&self) -> bool {
        let won = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.token.cancel();
        won
    }

    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Owner of all timer tasks for one supervisor.
///
/// Tasks must be scheduled from inside a tokio runtime.
#[derive(Debug, Default)]
pub struct Scheduler {
    root: CancellationToken,
    tracker: TaskTracker,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` once after `delay` unless cancelled first.
    pub fn schedule_once<F>(&self, delay: Duration, action: F) -> ScheduledTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = ScheduledTask {
            token: self.root.child_token(),
            state: Arc::new(AtomicU8::new(PENDING)),
        };
        let token = task.token.clone();
        let state = Arc::clone(&task.state);

        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if state
                        .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        action.await;
                    }
                }
            }
        });
        task
    }

    /// Run `action` every `period` until cancelled. The first run is one
    /// period from now.
    pub fn schedule_repeating<F, Fut>(&self, period: Duration, mut action: F) -> ScheduledTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = ScheduledTask {
            token: self.root.child_token(),
            state: Arc::new(AtomicU8::new(PENDING)),
        };
        let token = task.token.clone();

        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => action().await,
                }
            }
        });
        task
    }

    /// Cancel every task and refuse new ones from being tracked.
    pub fn shutdown(&self) {
        self.root.cancel();
        self.tracker.close();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Wait for all tasks to finish. Only returns after [`Scheduler::shutdown`].
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }
}
