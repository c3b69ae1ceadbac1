//! Resident tool process shared by all callers.
//!
//! A [`KeepAliveSupervisor`] owns at most one stay-open tool. Calls are
//! serialized around "ensure handle, send, read"; a handle whose stream
//! closed underneath a call is replaced and the call retried, up to
//! [`MAX_ATTEMPTS`]. A low-frequency sweep closes the tool after a period
//! without calls; the next call starts a new one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::process::{CallRecord, ProcessHandle, ProcessRegistry, ProxyError};
use crate::protocol::{keep_alive_argv, CommandEnvelope, ResponseBatch};
use crate::supervisor::{
    arm_watchdog, disarm, CloseReason, ExecutionMode, Executor, HandleState, HandleStateMachine,
    ScheduledTask, Scheduler, SupervisorBuilder, SupervisorStats,
};

/// Attempts per call before giving up on a dying tool.
pub const MAX_ATTEMPTS: u32 = 3;

const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(50);
const MAX_SWEEP_PERIOD: Duration = Duration::from_secs(60);

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    argv: Vec<String>,
    inactivity_timeout: Duration,
    registry: Arc<ProcessRegistry>,
    scheduler: Scheduler,
    /// Held for the whole of one call.
    call_lock: Mutex<()>,
    /// Held while a handle is being created.
    start_lock: Mutex<()>,
    handle: StdMutex<Option<Arc<ProcessHandle>>>,
    machine: StdMutex<HandleStateMachine>,
    last_call_start: StdMutex<Instant>,
    shutting_down: AtomicBool,
    sweeper: StdMutex<Option<ScheduledTask>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.scheduler.shutdown();
        if lock(&self.handle).is_some() && !self.shutting_down.load(Ordering::Acquire) {
            tracing::debug!("Keep-alive supervisor dropped without shutdown");
        }
    }
}

/// Supervisor for one long-lived stay-open tool process.
///
/// Cloning is cheap; clones share the same process.
#[derive(Clone)]
pub struct KeepAliveSupervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for KeepAliveSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAliveSupervisor")
            .field("argv", &self.inner.argv)
            .field("state", &self.state())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl KeepAliveSupervisor {
    /// Supervisor for `tool` with default settings and the global registry.
    #[must_use]
    pub fn new(tool: impl Into<String>) -> Self {
        SupervisorBuilder::new(tool).build_keep_alive()
    }

    pub(crate) fn from_builder(builder: SupervisorBuilder) -> Self {
        let registry = builder.resolve_registry();
        Self {
            inner: Arc::new(Inner {
                argv: keep_alive_argv(&builder.tool, &builder.common_args),
                inactivity_timeout: builder.inactivity_timeout,
                registry,
                scheduler: Scheduler::new(),
                call_lock: Mutex::new(()),
                start_lock: Mutex::new(()),
                handle: StdMutex::new(None),
                machine: StdMutex::new(HandleStateMachine::new()),
                last_call_start: StdMutex::new(Instant::now()),
                shutting_down: AtomicBool::new(false),
                sweeper: StdMutex::new(None),
            }),
        }
    }

    /// Current handle state. A ready handle whose process has exited
    /// reports `Closed` until the next call replaces it.
    #[must_use]
    pub fn state(&self) -> HandleState {
        let state = lock(&self.inner.machine).state();
        if state == HandleState::Ready && self.ready_handle().is_none() {
            return HandleState::Closed;
        }
        state
    }

    #[must_use]
    pub fn stats(&self) -> SupervisorStats {
        lock(&self.inner.machine).stats()
    }

    /// Number of tool processes started so far.
    #[must_use]
    pub fn spawn_count(&self) -> usize {
        self.stats().spawns
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Whether an open handle with a live process is currently held.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready_handle().is_some()
    }

    /// Pid of the current tool process, if one is ready.
    #[must_use]
    pub fn current_pid(&self) -> Option<u32> {
        self.ready_handle().and_then(|handle| handle.pid())
    }

    #[must_use]
    pub fn inactivity_timeout(&self) -> Duration {
        self.inner.inactivity_timeout
    }

    /// Start the tool now instead of on the first call.
    ///
    /// Shutdown is final: once [`shutdown`](Self::shutdown) has run this
    /// fails rather than reviving the supervisor.
    ///
    /// # Errors
    ///
    /// Returns `ShuttingDown` after shutdown, or `LaunchFailed`.
    pub async fn startup(&self) -> Result<(), ProxyError> {
        if self.is_shutting_down() {
            return Err(ProxyError::ShuttingDown);
        }
        self.ensure_handle().await.map(|_| ())
    }

    /// Run one request on the resident tool.
    ///
    /// # Errors
    ///
    /// - `ShuttingDown` during or after shutdown, even mid-retry.
    /// - `TimedOut` if the watchdog closed the tool.
    /// - `RetriesExhausted` if the stream kept closing for [`MAX_ATTEMPTS`] attempts.
    /// - `LaunchFailed`, `ToolReported`, `ProtocolViolation` unchanged.
    pub async fn execute(
        &self,
        run_timeout: Option<Duration>,
        args: &[String],
    ) -> Result<ResponseBatch, ProxyError> {
        if self.is_shutting_down() {
            return Err(ProxyError::ShuttingDown);
        }
        *lock(&self.inner.last_call_start) = Instant::now();

        let envelope = CommandEnvelope::new(args.iter().cloned());
        let _serial = self.inner.call_lock.lock().await;

        for attempt in 1..=MAX_ATTEMPTS {
            if self.is_shutting_down() {
                return Err(ProxyError::ShuttingDown);
            }
            let handle = self.ensure_handle().await?;

            let watchdog = arm_watchdog(&self.inner.scheduler, &handle, run_timeout);
            let result = handle.send_and_await(&envelope).await;
            let fired = disarm(watchdog);

            match result {
                Ok(batch) => {
                    lock(&self.inner.machine).record_call();
                    return Ok(batch);
                }
                Err(_) if self.is_shutting_down() => return Err(ProxyError::ShuttingDown),
                Err(ProxyError::ChannelClosed) if fired => {
                    self.discard(&handle, CloseReason::CallTimeout).await;
                    return Err(ProxyError::TimedOut {
                        timeout: run_timeout.unwrap_or_default(),
                        record: CallRecord::new(args, handle.take_partial_lines()),
                    });
                }
                Err(ProxyError::ChannelClosed) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = MAX_ATTEMPTS,
                        handle = %handle.id(),
                        "Tool stream closed, restarting"
                    );
                    self.discard(&handle, CloseReason::StreamClosed).await;
                }
                Err(err @ (ProxyError::ToolReported { .. } | ProxyError::InvalidArgument(_))) => {
                    return Err(err);
                }
                Err(err) => {
                    self.discard(&handle, CloseReason::CallFailed).await;
                    return Err(err);
                }
            }
        }

        Err(ProxyError::RetriesExhausted {
            attempts: MAX_ATTEMPTS,
            record: CallRecord::new(args, Vec::new()),
        })
    }

    /// Fence off new calls and close the tool. Calls in flight fail with
    /// `ShuttingDown`.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Shutting down keep-alive supervisor");
        self.inner.scheduler.shutdown();

        let handle = lock(&self.inner.handle).take();
        if let Some(handle) = handle {
            handle.close().await;
            lock(&self.inner.machine).record_close(CloseReason::Shutdown);
        }
    }

    fn ready_handle(&self) -> Option<Arc<ProcessHandle>> {
        lock(&self.inner.handle)
            .as_ref()
            .filter(|handle| handle.is_alive())
            .cloned()
    }

    fn set_state(&self, state: HandleState) {
        lock(&self.inner.machine).transition(state);
    }

    /// Return the ready handle, starting one if none is open.
    async fn ensure_handle(&self) -> Result<Arc<ProcessHandle>, ProxyError> {
        if let Some(handle) = self.ready_handle() {
            return Ok(handle);
        }

        let _start = self.inner.start_lock.lock().await;
        if self.is_shutting_down() {
            return Err(ProxyError::ShuttingDown);
        }
        if let Some(handle) = self.ready_handle() {
            return Ok(handle);
        }

        let stale = lock(&self.inner.handle).take();
        if let Some(stale) = stale {
            stale.close().await;
            lock(&self.inner.machine).record_close(CloseReason::StreamClosed);
        }

        self.set_state(HandleState::Starting);
        let handle = match ProcessHandle::start(&self.inner.argv, true, &self.inner.registry) {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!(error = %err, "Failed to start tool");
                self.set_state(HandleState::Absent);
                return Err(err);
            }
        };
        lock(&self.inner.machine).record_spawn();
        *lock(&self.inner.handle) = Some(Arc::clone(&handle));
        self.set_state(HandleState::Ready);

        if self.is_shutting_down() {
            let _ = lock(&self.inner.handle).take();
            handle.close().await;
            return Err(ProxyError::ShuttingDown);
        }

        tracing::info!(handle = %handle.id(), pid = ?handle.pid(), "Tool process ready");
        self.ensure_sweeper();
        Ok(handle)
    }

    /// Drop `handle` from the slot (if still current) and close it.
    async fn discard(&self, handle: &Arc<ProcessHandle>, reason: CloseReason) {
        {
            let mut slot = lock(&self.inner.handle);
            if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, handle)) {
                *slot = None;
            }
        }
        handle.close().await;

        let mut machine = lock(&self.inner.machine);
        machine.record_close(reason);
        machine.transition(HandleState::Absent);
    }

    fn ensure_sweeper(&self) {
        if self.inner.inactivity_timeout.is_zero() {
            return;
        }
        let mut sweeper = lock(&self.inner.sweeper);
        if sweeper.is_some() {
            return;
        }

        let period = (self.inner.inactivity_timeout / 4).clamp(MIN_SWEEP_PERIOD, MAX_SWEEP_PERIOD);
        let weak = Arc::downgrade(&self.inner);
        *sweeper = Some(self.inner.scheduler.schedule_repeating(period, move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    KeepAliveSupervisor { inner }.evict_if_idle().await;
                }
            }
        }));
    }

    /// Close the ready handle if no call started within the inactivity timeout.
    async fn evict_if_idle(&self) {
        if self.is_shutting_down() || self.idle_for() < self.inner.inactivity_timeout {
            return;
        }
        let Ok(_serial) = self.inner.call_lock.try_lock() else {
            return;
        };
        let idle = self.idle_for();
        if idle < self.inner.inactivity_timeout {
            return;
        }
        let Some(handle) = self.ready_handle() else {
            return;
        };

        tracing::info!(handle = %handle.id(), ?idle, "Closing idle tool process");
        self.discard(&handle, CloseReason::IdleTimeout).await;
    }

    fn idle_for(&self) -> Duration {
        lock(&self.inner.last_call_start).elapsed()
    }
}

#[async_trait]
impl Executor for KeepAliveSupervisor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::KeepAlive
    }

    async fn execute(
        &self,
        run_timeout: Option<Duration>,
        args: &[String],
    ) -> Result<ResponseBatch, ProxyError> {
        KeepAliveSupervisor::execute(self, run_timeout, args).await
    }

    async fn shutdown(&self) {
        KeepAliveSupervisor::shutdown(self).await;
    }
}
