//! Line-oriented pipes to a spawned tool.
//!
//! A [`LineChannel`] owns the child process, its stdin/stdout pipes and a
//! background task that keeps stderr drained into a small bounded queue so
//! the tool never blocks on a full pipe while we wait on stdout.
//!
//! In stay-open mode the drain also counts `{ready}` lines echoed on stderr.
//! Once the count reaches the number of requests sent, every diagnostic the
//! tool wrote for those requests is in the queue.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::process::{ProxyError, SpawnError};
use crate::protocol::{SENTINEL, SHUTDOWN_LINES};

/// Maximum number of stderr lines retained between calls.
pub const STDERR_CAPACITY: usize = 50;

/// Default timeout for graceful process termination.
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a stay-open tool gets to exit on its own after the shutdown handshake.
const HANDSHAKE_GRACE: Duration = Duration::from_millis(500);

/// Bounded queue of non-blank stderr lines.
#[derive(Debug, Clone, Default)]
pub struct ErrorQueue {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl ErrorQueue {
    /// Append a line, dropping the oldest once full. Blank lines are ignored.
    pub fn push(&self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == STDERR_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(trimmed.to_string());
    }

    /// Take every queued line.
    #[must_use]
    pub fn drain(&self) -> Vec<String> {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Render an argv as a shell-quoted command line for diagnostics.
#[must_use]
pub fn render_command(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| shell_escape::escape(Cow::Borrowed(arg.as_str())))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Read one line, decoding lossily and stripping the line terminator.
async fn read_lossy_line<R>(reader: &mut BufReader<R>) -> std::io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf).await? == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

fn map_pipe_error(err: std::io::Error) -> ProxyError {
    match err.kind() {
        std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::UnexpectedEof => ProxyError::ChannelClosed,
        _ => ProxyError::Io(err),
    }
}

/// Pipes and process for one running tool instance.
#[derive(Debug)]
pub struct LineChannel {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
    errors: ErrorQueue,
    drain: Option<tokio::task::JoinHandle<()>>,
    drain_abort: AbortHandle,
    stderr_marks: watch::Receiver<u64>,
    requests: u64,
    keep_alive: bool,
    command_line: String,
    closed: bool,
}

impl LineChannel {
    /// Spawn `argv[0]` with the remaining arguments.
    ///
    /// Stay-open channels get a piped stdin; single-use channels get `/dev/null`.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::LaunchFailed` if the process cannot be started.
    pub fn spawn(argv: &[String], keep_alive: bool) -> Result<Self, ProxyError> {
        let command_line = render_command(argv);
        let Some((program, args)) = argv.split_first() else {
            return Err(ProxyError::LaunchFailed {
                command: command_line,
                source: SpawnError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "empty command line",
                )),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if keep_alive {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ProxyError::LaunchFailed {
            command: command_line.clone(),
            source: SpawnError::from_io(e),
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(BufReader::new);
        let stderr = child.stderr.take();

        let errors = ErrorQueue::default();
        let sink = errors.clone();
        let (marks, stderr_marks) = watch::channel(0u64);
        let drain = tokio::spawn(async move {
            let Some(stderr) = stderr else { return };
            let mut reader = BufReader::new(stderr);
            while let Ok(Some(line)) = read_lossy_line(&mut reader).await {
                if keep_alive && line.trim() == SENTINEL {
                    marks.send_modify(|seen| *seen += 1);
                    continue;
                }
                tracing::trace!(line = %line, "stderr");
                sink.push(&line);
            }
        });
        let drain_abort = drain.abort_handle();

        Ok(Self {
            child,
            stdin,
            stdout,
            errors,
            drain: Some(drain),
            drain_abort,
            stderr_marks,
            requests: 0,
            keep_alive,
            command_line,
            closed: false,
        })
    }

    /// OS process id, while the child has not been reaped.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    #[must_use]
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Write `text` plus a newline and flush.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::ChannelClosed` if the channel or pipe is closed.
    pub async fn write_line(&mut self, text: &str) -> Result<(), ProxyError> {
        if self.closed {
            return Err(ProxyError::ChannelClosed);
        }
        let stdin = self.stdin.as_mut().ok_or(ProxyError::ChannelClosed)?;
        stdin
            .write_all(text.as_bytes())
            .await
            .map_err(map_pipe_error)?;
        stdin.write_all(b"\n").await.map_err(map_pipe_error)?;
        stdin.flush().await.map_err(map_pipe_error)
    }

    /// Read one line from stdout; `None` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::ChannelClosed` if the channel is closed.
    pub async fn read_line(&mut self) -> Result<Option<String>, ProxyError> {
        if self.closed {
            return Err(ProxyError::ChannelClosed);
        }
        let stdout = self.stdout.as_mut().ok_or(ProxyError::ChannelClosed)?;
        read_lossy_line(stdout).await.map_err(map_pipe_error)
    }

    /// Take whatever stderr lines have accumulated.
    #[must_use]
    pub fn drain_errors(&self) -> Vec<String> {
        self.errors.drain()
    }

    /// Note that one more request is being sent. Returns its sequence number.
    pub fn begin_request(&mut self) -> u64 {
        self.requests += 1;
        self.requests
    }

    /// Wait until the stderr sentinel for request `seq` has been drained,
    /// up to `grace`. Returns false on timeout or if stderr ended first.
    pub async fn await_stderr_sentinel(&mut self, seq: u64, grace: Duration) -> bool {
        let reached = self.stderr_marks.wait_for(|seen| *seen >= seq);
        matches!(tokio::time::timeout(grace, reached).await, Ok(Ok(_)))
    }

    /// Wait for the stderr drain to reach end of stream, up to `grace`.
    ///
    /// Used once stdout has ended so late diagnostics are not missed.
    pub async fn settle_errors(&mut self, grace: Duration) {
        if let Some(drain) = self.drain.take() {
            if tokio::time::timeout(grace, drain).await.is_err() {
                tracing::debug!(command = %self.command_line, "stderr still open after stdout ended");
            }
        }
    }

    /// Whether the child has already exited.
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Wait up to `grace` for the child to exit. Returns true if it did.
    pub async fn wait_exit(&mut self, grace: Duration) -> bool {
        matches!(
            tokio::time::timeout(grace, self.child.wait()).await,
            Ok(Ok(_))
        )
    }

    /// Tear the channel down. Safe to call more than once.
    ///
    /// Each step runs even if an earlier one fails: the read end is dropped,
    /// a stay-open tool is asked to exit, the write end is dropped, the
    /// stderr drain is stopped, and finally the process is terminated.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.stdout = None;

        if let Some(mut stdin) = self.stdin.take() {
            if self.keep_alive {
                if let Err(e) = Self::send_shutdown(&mut stdin).await {
                    tracing::debug!(error = %e, "Shutdown handshake failed");
                }
            }
            drop(stdin);
        }

        self.drain_abort.abort();
        self.drain = None;

        if self.keep_alive && self.wait_exit(HANDSHAKE_GRACE).await {
            return;
        }
        if let Err(e) = self.graceful_terminate(DEFAULT_TERMINATE_TIMEOUT).await {
            tracing::warn!(error = %e, command = %self.command_line, "Failed to terminate tool");
        }
    }

    async fn send_shutdown(stdin: &mut ChildStdin) -> std::io::Result<()> {
        for line in SHUTDOWN_LINES {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
        }
        stdin.flush().await
    }

    /// Attempt graceful termination with a timeout.
    ///
    /// On Unix, sends SIGTERM first, then SIGKILL after the timeout.
    /// On other platforms, falls back to immediate kill.
    ///
    /// # Errors
    ///
    /// Returns an error if termination fails.
    pub async fn graceful_terminate(&mut self, timeout: Duration) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            self.graceful_terminate_unix(timeout).await
        }

        #[cfg(not(unix))]
        {
            let _ = timeout;
            self.child.kill().await
        }
    }

    #[cfg(unix)]
    async fn graceful_terminate_unix(&mut self, timeout: Duration) -> std::io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if self.has_exited() {
            return Ok(());
        }
        let Some(pid) = self.child.id() else {
            return Ok(());
        };

        let nix_pid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
        let _ = kill(nix_pid, Signal::SIGTERM);

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => self.child.kill().await,
        }
    }
}
