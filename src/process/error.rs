//! Proxy error types.

use std::fmt;
use std::time::Duration;

/// Diagnostic context captured for a failed call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallRecord {
    /// The argument list the caller submitted.
    pub args: Vec<String>,
    /// Response lines read before the failure, in arrival order.
    pub lines: Vec<String>,
}

impl CallRecord {
    #[must_use]
    pub fn new(args: &[String], lines: Vec<String>) -> Self {
        Self {
            args: args.to_vec(),
            lines,
        }
    }

    /// Number of lines read before the failure.
    #[must_use]
    pub fn lines_read(&self) -> usize {
        self.lines.len()
    }
}

impl fmt::Display for CallRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "args={:?}, {} line(s) read",
            self.args,
            self.lines.len()
        )
    }
}

/// Reason the OS refused to start the tool.
#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    /// The binary was not found.
    #[error("binary not found")]
    NotFound,
    /// Permission denied when spawning.
    #[error("permission denied")]
    PermissionDenied,
    /// Other I/O error.
    #[error("{0}")]
    Io(std::io::Error),
}

impl SpawnError {
    /// Classify an I/O error raised by `spawn`.
    #[must_use]
    pub fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Io(err),
        }
    }
}

/// Errors surfaced by process handles and supervisors.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    /// The OS could not start the subprocess.
    #[error("Failed to launch `{command}`: {source}")]
    LaunchFailed {
        command: String,
        #[source]
        source: SpawnError,
    },

    /// I/O attempted on a handle that is, or became, closed.
    #[error("Channel closed")]
    ChannelClosed,

    /// The tool wrote an `error` line to stderr.
    #[error("Tool reported error: {message} ({record})")]
    ToolReported { message: String, record: CallRecord },

    /// The keep-alive supervisor ran out of attempts.
    #[error("Gave up after {attempts} attempts ({record})")]
    RetriesExhausted { attempts: u32, record: CallRecord },

    /// A call was made during or after shutdown.
    #[error("Proxy is shutting down")]
    ShuttingDown,

    /// End of stream reached in keep-alive mode without the sentinel.
    #[error("Stream ended before the {{ready}} sentinel ({record})")]
    ProtocolViolation { record: CallRecord },

    /// An argument would break line framing.
    #[error("Argument contains a line break: {0:?}")]
    InvalidArgument(String),

    /// The watchdog closed the handle because the call overran.
    #[error("No response within {timeout:?} ({record})")]
    TimedOut { timeout: Duration, record: CallRecord },

    /// Unexpected pipe error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// True for transport failures the keep-alive supervisor recovers from.
    #[must_use]
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, Self::ChannelClosed)
    }

    /// Call record attached to this error, if any.
    #[must_use]
    pub fn record(&self) -> Option<&CallRecord> {
        match self {
            Self::ToolReported { record, .. }
            | Self::RetriesExhausted { record, .. }
            | Self::ProtocolViolation { record }
            | Self::TimedOut { record, .. } => Some(record),
            _ => None,
        }
    }
}
