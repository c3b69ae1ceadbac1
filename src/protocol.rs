//! Line protocol spoken with `exiftool`.
//!
//! In stay-open mode the tool reads one argument per line from stdin and
//! runs the accumulated arguments when it sees `-execute`. Output for that
//! request is terminated by a `{ready}` line. In single-use mode arguments
//! go on the command line and the response ends with the stream.
//!
//! Each stay-open request also asks the tool to echo `{ready}` on stderr
//! once it has finished, so diagnostics for a request can be collected up
//! to a known point instead of racing the stdout sentinel.

use crate::process::{CallRecord, ProxyError};

/// Line that terminates one response batch in stay-open mode.
pub const SENTINEL: &str = "{ready}";

/// Line that makes the tool run the arguments sent so far.
pub const EXECUTE: &str = "-execute";

/// Option that echoes the following argument to stderr after processing.
pub const STDERR_ECHO: &str = "-echo4";

/// Flags that put the tool in stay-open mode reading arguments from stdin.
pub const STAY_OPEN_ARGS: [&str; 4] = ["-stay_open", "True", "-@", "-"];

/// Lines that ask a stay-open tool to exit.
pub const SHUTDOWN_LINES: [&str; 2] = ["-stay_open", "False"];

/// Default separator between tag name and value in `-S` output.
pub const DEFAULT_SEPARATOR: &str = ": ";

/// How a response batch is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Terminated by [`SENTINEL`].
    Sentinel,
    /// Terminated by end of stream.
    UntilEof,
}

impl Framing {
    #[must_use]
    pub fn for_keep_alive(keep_alive: bool) -> Self {
        if keep_alive {
            Self::Sentinel
        } else {
            Self::UntilEof
        }
    }
}

/// One logical request: an ordered, immutable argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEnvelope {
    args: Vec<String>,
}

impl CommandEnvelope {
    #[must_use]
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Wire lines for stay-open mode: one argument per line, the stderr
    /// sentinel request, then `-execute`.
    #[must_use]
    pub fn keep_alive_lines(&self) -> Vec<&str> {
        self.args
            .iter()
            .map(String::as_str)
            .chain([STDERR_ECHO, SENTINEL, EXECUTE])
            .collect()
    }

    /// Full argv for a single-use invocation of `tool`.
    #[must_use]
    pub fn single_use_argv(&self, tool: &str, extra_args: &[String]) -> Vec<String> {
        std::iter::once(tool.to_string())
            .chain(extra_args.iter().cloned())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Argv that starts `tool` in stay-open mode.
///
/// `common_args` are applied by the tool to every request on the stream.
#[must_use]
pub fn keep_alive_argv(tool: &str, common_args: &[String]) -> Vec<String> {
    let mut argv = vec![tool.to_string()];
    argv.extend(STAY_OPEN_ARGS.iter().map(|a| (*a).to_string()));
    if !common_args.is_empty() {
        argv.push("-common_args".to_string());
        argv.extend(common_args.iter().cloned());
    }
    argv
}

/// Ordered output lines collected for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseBatch {
    lines: Vec<String>,
}

impl ResponseBatch {
    #[must_use]
    pub fn new(lines: Vec<String>) -> Self {
        Self { lines }
    }

    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    #[must_use]
    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Split `key<sep>value` lines, skipping lines without the separator.
    pub fn pairs<'a>(&'a self, sep: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.lines
            .iter()
            .filter_map(move |line| line.split_once(sep))
            .map(|(k, v)| (k.trim(), v.trim()))
    }
}

impl PartialEq<Vec<&str>> for ResponseBatch {
    fn eq(&self, other: &Vec<&str>) -> bool {
        self.lines.len() == other.len() && self.lines.iter().zip(other).all(|(a, b)| a == b)
    }
}

/// Progress of a decoder after consuming a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// More lines are expected.
    Pending,
    /// The batch is complete.
    Complete,
}

/// Accumulates response lines until the batch terminator.
#[derive(Debug)]
pub struct ResponseDecoder {
    framing: Framing,
    lines: Vec<String>,
    complete: bool,
}

impl ResponseDecoder {
    #[must_use]
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            lines: Vec::new(),
            complete: false,
        }
    }

    /// Consume one line. The sentinel is never added to the batch.
    pub fn push(&mut self, line: String) -> Decoded {
        if self.complete {
            return Decoded::Complete;
        }
        if self.framing == Framing::Sentinel && line.trim_end() == SENTINEL {
            self.complete = true;
            return Decoded::Complete;
        }
        self.lines.push(line);
        Decoded::Pending
    }

    /// Lines accumulated so far.
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    #[must_use]
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Take the finished batch. Only valid once [`Decoded::Complete`] was seen.
    #[must_use]
    pub fn into_batch(self) -> ResponseBatch {
        ResponseBatch::new(self.lines)
    }

    /// Close the batch because the stream ended.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::ProtocolViolation` when the framing expects a
    /// sentinel that never arrived.
    pub fn finish_at_eof(self, args: &[String]) -> Result<ResponseBatch, ProxyError> {
        match self.framing {
            Framing::UntilEof => Ok(ResponseBatch::new(self.lines)),
            Framing::Sentinel if self.complete => Ok(ResponseBatch::new(self.lines)),
            Framing::Sentinel => Err(ProxyError::ProtocolViolation {
                record: CallRecord::new(args, self.lines),
            }),
        }
    }
}

/// Stderr convention: a line starting with `error` (any case) fails the call.
#[must_use]
pub fn is_error_line(line: &str) -> bool {
    line.trim_start()
        .get(..5)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("error"))
}
