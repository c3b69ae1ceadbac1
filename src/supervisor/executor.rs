//! Call contract shared by both supervisors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::process::{ProcessHandle, ProcessRegistry, ProxyError};
use crate::protocol::ResponseBatch;
use crate::supervisor::{KeepAliveSupervisor, ScheduledTask, Scheduler, SingleUseSupervisor};

/// Default inactivity period after which a stay-open tool is closed.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(600);

/// How tool processes are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// A fresh process per call.
    SingleUse,
    /// One resident process fed through stdin.
    KeepAlive,
}

/// Something that runs tool requests.
#[async_trait]
pub trait Executor: Send + Sync {
    /// How this executor runs the tool.
    fn mode(&self) -> ExecutionMode;

    /// Run one request. `run_timeout` of `None` or zero disables the watchdog.
    async fn execute(
        &self,
        run_timeout: Option<Duration>,
        args: &[String],
    ) -> Result<ResponseBatch, ProxyError>;

    /// Stop accepting calls and close any running tool.
    async fn shutdown(&self);
}

/// Builder for configuring supervisors.
#[derive(Debug, Clone)]
pub struct SupervisorBuilder {
    pub(crate) tool: String,
    pub(crate) common_args: Vec<String>,
    pub(crate) inactivity_timeout: Duration,
    pub(crate) registry: Option<Arc<ProcessRegistry>>,
}

impl SupervisorBuilder {
    /// Create a new builder for the given tool binary.
    #[must_use]
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            common_args: Vec::new(),
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            registry: None,
        }
    }

    /// Arguments applied to every request.
    #[must_use]
    pub fn common_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.common_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Close a stay-open tool after this long without calls. Zero disables eviction.
    #[must_use]
    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Track processes in `registry` instead of the global one.
    #[must_use]
    pub fn registry(mut self, registry: Arc<ProcessRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub(crate) fn resolve_registry(&self) -> Arc<ProcessRegistry> {
        self.registry.clone().unwrap_or_else(ProcessRegistry::global)
    }

    #[must_use]
    pub fn build_keep_alive(self) -> KeepAliveSupervisor {
        KeepAliveSupervisor::from_builder(self)
    }

    #[must_use]
    pub fn build_single_use(self) -> SingleUseSupervisor {
        SingleUseSupervisor::from_builder(self)
    }

    /// Build the executor for `mode`.
    #[must_use]
    pub fn build(self, mode: ExecutionMode) -> Arc<dyn Executor> {
        match mode {
            ExecutionMode::KeepAlive => Arc::new(self.build_keep_alive()),
            ExecutionMode::SingleUse => Arc::new(self.build_single_use()),
        }
    }
}

/// Schedule a force-close of `handle` after `run_timeout`.
pub(crate) fn arm_watchdog(
    scheduler: &Scheduler,
    handle: &Arc<ProcessHandle>,
    run_timeout: Option<Duration>,
) -> Option<ScheduledTask> {
    let timeout = run_timeout.filter(|t| !t.is_zero())?;
    let handle = Arc::clone(handle);
    Some(scheduler.schedule_once(timeout, async move {
        tracing::warn!(
            handle = %handle.id(),
            pid = ?handle.pid(),
            ?timeout,
            "Call overran, closing tool process"
        );
        handle.close().await;
    }))
}

/// Disarm a watchdog. Returns true if it had already fired.
pub(crate) fn disarm(watchdog: Option<ScheduledTask>) -> bool {
    watchdog.is_some_and(|task| !task.cancel())
}
