//! One process per call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use uuid::Uuid;

use crate::process::{CallRecord, ProcessHandle, ProcessRegistry, ProxyError};
use crate::protocol::{CommandEnvelope, ResponseBatch};
use crate::supervisor::{
    arm_watchdog, disarm, ExecutionMode, Executor, Scheduler, SupervisorBuilder,
};

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs every call in a fresh tool process and always closes it.
///
/// Nothing is shared between calls and nothing is retried. Processes of
/// calls in flight are tracked so shutdown can close them.
#[derive(Debug)]
pub struct SingleUseSupervisor {
    tool: String,
    common_args: Vec<String>,
    registry: Arc<ProcessRegistry>,
    scheduler: Scheduler,
    shutting_down: AtomicBool,
    spawns: AtomicUsize,
    in_flight: StdMutex<HashMap<Uuid, Arc<ProcessHandle>>>,
}

impl SingleUseSupervisor {
    /// Supervisor for `tool` using the global registry.
    #[must_use]
    pub fn new(tool: impl Into<String>) -> Self {
        SupervisorBuilder::new(tool).build_single_use()
    }

    pub(crate) fn from_builder(builder: SupervisorBuilder) -> Self {
        let registry = builder.resolve_registry();
        Self {
            tool: builder.tool,
            common_args: builder.common_args,
            registry,
            scheduler: Scheduler::new(),
            shutting_down: AtomicBool::new(false),
            spawns: AtomicUsize::new(0),
            in_flight: StdMutex::new(HashMap::new()),
        }
    }

    /// Number of processes started so far.
    #[must_use]
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Run `args` in a new process and return everything it printed.
    ///
    /// # Errors
    ///
    /// Returns `ShuttingDown` after [`shutdown`](Self::shutdown), `TimedOut`
    /// if the watchdog fired, or whatever the process handle reported.
    pub async fn execute(
        &self,
        run_timeout: Option<Duration>,
        args: &[String],
    ) -> Result<ResponseBatch, ProxyError> {
        if self.is_shutting_down() {
            return Err(ProxyError::ShuttingDown);
        }

        let envelope = CommandEnvelope::new(args.iter().cloned());
        let argv = envelope.single_use_argv(&self.tool, &self.common_args);
        let handle = ProcessHandle::start(&argv, false, &self.registry)?;
        self.spawns.fetch_add(1, Ordering::AcqRel);
        {
            // Checked under the lock so shutdown either sees this handle or
            // this call sees the flag.
            let mut in_flight = lock(&self.in_flight);
            if !self.is_shutting_down() {
                in_flight.insert(handle.id(), Arc::clone(&handle));
            }
        }
        if self.is_shutting_down() {
            handle.close().await;
            return Err(ProxyError::ShuttingDown);
        }

        let watchdog = arm_watchdog(&self.scheduler, &handle, run_timeout);
        let result = handle.send_and_await(&envelope).await;
        let fired = disarm(watchdog);
        lock(&self.in_flight).remove(&handle.id());
        handle.close().await;

        match result {
            Err(ProxyError::ChannelClosed) if self.is_shutting_down() => {
                Err(ProxyError::ShuttingDown)
            }
            Err(ProxyError::ChannelClosed) if fired => Err(ProxyError::TimedOut {
                timeout: run_timeout.unwrap_or_default(),
                record: CallRecord::new(args, handle.take_partial_lines()),
            }),
            other => other,
        }
    }

    /// Number of calls whose process is still running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Refuse further calls, cancel pending watchdogs and close the
    /// processes of calls in flight, which then fail with `ShuttingDown`.
    pub async fn shutdown(&self) {
        let live: Vec<Arc<ProcessHandle>> = {
            let mut in_flight = lock(&self.in_flight);
            if !self.shutting_down.swap(true, Ordering::AcqRel) {
                tracing::debug!(
                    tool = %self.tool,
                    in_flight = in_flight.len(),
                    "Single-use supervisor shutting down"
                );
            }
            in_flight.drain().map(|(_, handle)| handle).collect()
        };
        self.scheduler.shutdown();
        join_all(live.iter().map(|handle| handle.close())).await;
    }
}

#[async_trait]
impl Executor for SingleUseSupervisor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::SingleUse
    }

    async fn execute(
        &self,
        run_timeout: Option<Duration>,
        args: &[String],
    ) -> Result<ResponseBatch, ProxyError> {
        SingleUseSupervisor::execute(self, run_timeout, args).await
    }

    async fn shutdown(&self) {
        SingleUseSupervisor::shutdown(self).await;
    }
}
