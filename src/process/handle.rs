//! One running tool instance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::process::{CallRecord, LineChannel, ProcessRegistry, ProxyError};
use crate::protocol::{
    is_error_line, CommandEnvelope, Decoded, Framing, ResponseBatch, ResponseDecoder,
};

/// How long to wait for a child that hit end of stream to be reaped.
const EXIT_GRACE: Duration = Duration::from_millis(250);

/// How long to wait for stderr to catch up once stdout has finished: the
/// `{ready}` echo in stay-open mode, end of stream in single-use mode.
const STDERR_SETTLE: Duration = Duration::from_secs(1);

/// A spawned tool plus its line channel.
///
/// Calls are serialized by an internal lock. `close` may run from any task
/// at any time: it flips the closed flag and cancels the handle's token
/// first, which makes an in-flight `send_and_await` fail with
/// `ChannelClosed` instead of blocking on the pipe.
#[derive(Debug)]
pub struct ProcessHandle {
    id: Uuid,
    pid: Option<u32>,
    keep_alive: bool,
    command_line: String,
    closed: AtomicBool,
    torn_down: AtomicBool,
    close_token: CancellationToken,
    channel: Mutex<Option<LineChannel>>,
    /// Lines read by the last exchange that was cut short.
    partial: StdMutex<Vec<String>>,
    registry: Arc<ProcessRegistry>,
}

impl ProcessHandle {
    /// Spawn the tool and register the handle.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::LaunchFailed` if the process cannot be started.
    pub fn start(
        argv: &[String],
        keep_alive: bool,
        registry: &Arc<ProcessRegistry>,
    ) -> Result<Arc<Self>, ProxyError> {
        let channel = LineChannel::spawn(argv, keep_alive)?;
        let handle = Arc::new(Self {
            id: Uuid::new_v4(),
            pid: channel.pid(),
            keep_alive,
            command_line: channel.command_line().to_string(),
            closed: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            close_token: CancellationToken::new(),
            channel: Mutex::new(Some(channel)),
            partial: StdMutex::new(Vec::new()),
            registry: Arc::clone(registry),
        });
        registry.register(&handle);

        tracing::debug!(
            handle = %handle.id,
            pid = ?handle.pid,
            keep_alive,
            command = %handle.command_line,
            "Started tool process"
        );
        Ok(handle)
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[must_use]
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether the tool process is still running. A handle busy with a call
    /// is reported alive; the call itself notices a dead tool.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.channel.try_lock() {
            Ok(mut guard) => guard.as_mut().is_some_and(|channel| !channel.has_exited()),
            Err(_) => true,
        }
    }

    /// Lines the last interrupted call had read before the handle was
    /// closed under it.
    #[must_use]
    pub fn take_partial_lines(&self) -> Vec<String> {
        std::mem::take(&mut *self.partial.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Send one request and collect its response.
    ///
    /// In stay-open mode the envelope is written line by line followed by
    /// `-execute`, and lines are read up to the `{ready}` sentinel. In
    /// single-use mode the arguments were already on the command line and
    /// lines are read until the stream ends.
    ///
    /// # Errors
    ///
    /// - `ChannelClosed` if the handle is or becomes closed, or the tool died
    ///   before answering.
    /// - `ProtocolViolation` if stdout ends before the sentinel.
    /// - `ToolReported` if stderr carried an `error` line.
    pub async fn send_and_await(
        &self,
        envelope: &CommandEnvelope,
    ) -> Result<ResponseBatch, ProxyError> {
        if self.is_closed() {
            return Err(ProxyError::ChannelClosed);
        }
        if let Some(bad) = envelope.args().iter().find(|a| a.contains(['\n', '\r'])) {
            return Err(ProxyError::InvalidArgument(bad.clone()));
        }

        let mut guard = tokio::select! {
            biased;
            () = self.close_token.cancelled() => return Err(ProxyError::ChannelClosed),
            guard = self.channel.lock() => guard,
        };
        let channel = guard.as_mut().ok_or(ProxyError::ChannelClosed)?;

        let stale = channel.drain_errors();
        if stale.iter().any(|line| is_error_line(line)) {
            tracing::warn!(
                handle = %self.id,
                lines = ?stale,
                "Dropping error output from an earlier call"
            );
        } else if !stale.is_empty() {
            tracing::debug!(handle = %self.id, lines = ?stale, "Discarding stale stderr");
        }

        let abandon = AbandonGuard { handle: self, armed: true };
        let mut decoder = ResponseDecoder::new(Framing::for_keep_alive(self.keep_alive));
        let result = tokio::select! {
            biased;
            () = self.close_token.cancelled() => Err(ProxyError::ChannelClosed),
            result = Self::exchange(channel, envelope, &mut decoder) => result,
        };
        abandon.disarm();
        if matches!(result, Err(ProxyError::ChannelClosed)) {
            *self.partial.lock().unwrap_or_else(PoisonError::into_inner) =
                decoder.lines().to_vec();
        }
        result
    }

    async fn exchange(
        channel: &mut LineChannel,
        envelope: &CommandEnvelope,
        decoder: &mut ResponseDecoder,
    ) -> Result<ResponseBatch, ProxyError> {
        let framing = decoder.framing();
        let keep_alive = framing == Framing::Sentinel;
        let mut request = 0;
        if keep_alive {
            if channel.has_exited() {
                return Err(ProxyError::ChannelClosed);
            }
            request = channel.begin_request();
            for line in envelope.keep_alive_lines() {
                channel.write_line(line).await?;
            }
        }

        loop {
            match channel.read_line().await? {
                Some(line) => {
                    if decoder.push(line) == Decoded::Complete {
                        break;
                    }
                }
                None => {
                    if keep_alive
                        && decoder.lines().is_empty()
                        && channel.wait_exit(EXIT_GRACE).await
                    {
                        return Err(ProxyError::ChannelClosed);
                    }
                    if !keep_alive {
                        channel.settle_errors(STDERR_SETTLE).await;
                    }
                    break;
                }
            }
        }

        if keep_alive
            && decoder.is_complete()
            && !channel.await_stderr_sentinel(request, STDERR_SETTLE).await
        {
            tracing::debug!(request, "stderr sentinel not seen, checking what arrived");
        }

        let done = std::mem::replace(decoder, ResponseDecoder::new(framing));
        let batch = done.finish_at_eof(envelope.args())?;
        Self::check_errors(channel.drain_errors(), envelope, batch)
    }

    fn check_errors(
        errors: Vec<String>,
        envelope: &CommandEnvelope,
        batch: ResponseBatch,
    ) -> Result<ResponseBatch, ProxyError> {
        let fatal: Vec<&str> = errors
            .iter()
            .map(String::as_str)
            .filter(|line| is_error_line(line))
            .collect();
        if fatal.is_empty() {
            if !errors.is_empty() {
                tracing::debug!(lines = ?errors, "Tool diagnostics");
            }
            return Ok(batch);
        }
        Err(ProxyError::ToolReported {
            message: fatal.join("\n"),
            record: CallRecord::new(envelope.args(), batch.into_lines()),
        })
    }

    /// Mark the handle closed and wake any blocked caller, without cleanup.
    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_token.cancel();
    }

    /// Close the handle and terminate the tool. Idempotent; a concurrent
    /// caller returns once the first one has finished tearing down.
    pub async fn close(&self) {
        self.mark_closed();

        let mut slot = self.channel.lock().await;
        let Some(mut channel) = slot.take() else {
            return;
        };
        channel.close().await;
        self.registry.deregister(self.id);
        self.torn_down.store(true, Ordering::Release);
        drop(slot);

        tracing::debug!(handle = %self.id, pid = ?self.pid, "Closed tool process");
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.torn_down.load(Ordering::Acquire) {
            tracing::debug!(handle = %self.id, "Process handle dropped without close");
            self.registry.deregister(self.id);
        }
    }
}

/// Closes the handle if the caller's future is dropped mid-exchange, since
/// the stream would otherwise be left holding half a response.
struct AbandonGuard<'a> {
    handle: &'a ProcessHandle,
    armed: bool,
}

impl AbandonGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(handle = %self.handle.id, "Call abandoned mid-exchange");
            self.handle.mark_closed();
        }
    }
}
