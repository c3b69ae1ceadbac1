//! Configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::supervisor::ExecutionMode;

/// Environment variable that overrides the configured tool path.
pub const TOOL_PATH_ENV: &str = "EXIFTOOL_PATH";

/// Configuration consumed by the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Path or name of the exiftool binary.
    #[serde(default = "default_tool_path")]
    pub tool_path: String,
    /// Keep one tool process resident instead of starting one per call.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,
    /// Close a resident tool after this many milliseconds without calls. 0 disables.
    #[serde(default = "default_inactivity_timeout_ms")]
    pub inactivity_timeout_ms: u64,
    /// Fail a call that has not answered within this many milliseconds. 0 disables.
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,
    /// Arguments passed with every request.
    #[serde(default)]
    pub common_args: Vec<String>,
}

fn default_tool_path() -> String {
    "exiftool".to_string()
}

fn default_keep_alive() -> bool {
    true
}

fn default_inactivity_timeout_ms() -> u64 {
    600_000
}

fn default_run_timeout_ms() -> u64 {
    20_000
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            tool_path: default_tool_path(),
            keep_alive: default_keep_alive(),
            inactivity_timeout_ms: default_inactivity_timeout_ms(),
            run_timeout_ms: default_run_timeout_ms(),
            common_args: Vec::new(),
        }
    }
}

impl ProxyConfig {
    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        if self.keep_alive {
            ExecutionMode::KeepAlive
        } else {
            ExecutionMode::SingleUse
        }
    }

    #[must_use]
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    /// Per-call timeout, `None` when disabled.
    #[must_use]
    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_ms > 0).then(|| Duration::from_millis(self.run_timeout_ms))
    }

    /// Replace the tool path when an override is present and non-empty.
    #[must_use]
    pub fn with_tool_override(mut self, tool_path: Option<String>) -> Self {
        if let Some(path) = tool_path.filter(|p| !p.trim().is_empty()) {
            self.tool_path = path;
        }
        self
    }
}
