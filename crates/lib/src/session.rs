//! Session events and terminal statuses shared by the command streamer and the log tailer.
//!
//! A session is one run of a subprocess, from spawn to its terminal event. Consumers
//! receive zero or more [`StreamEvent::Line`] followed by exactly one [`StreamEvent::Finished`].

use std::fmt;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};

/// Capacity of the per-session event channel between the reader task and its consumer.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Errors that end a session (or prevent one from starting). Each is reported once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("failed to start: {0}")]
    SpawnFailed(String),
    #[error("error while streaming output: {0}")]
    StreamError(String),
    #[error("log not found: {}", .0.display())]
    LogNotFound(PathBuf),
    #[error("tail failed: {0}")]
    TailError(String),
    #[error("no pending command")]
    NoPendingCommand,
    #[error("pending command expired; propose it again")]
    Expired,
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Code(i32),
    Signal(i32),
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ProcessExit::Code(code),
            (None, Some(sig)) => ProcessExit::Signal(sig),
            (None, None) => ProcessExit::Code(-1),
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessExit::Code(c) => write!(f, "code {}", c),
            ProcessExit::Signal(s) => write!(f, "signal {}", s),
        }
    }
}

/// Terminal status of a session; delivered exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// Command ran to completion. `suppressed` counts lines read past the cap and not forwarded.
    Completed {
        exit: ProcessExit,
        cap: usize,
        suppressed: usize,
    },
    /// Log follower ended, either by its deadline or on its own.
    TailFinished {
        timed_out: bool,
        exit: Option<ProcessExit>,
    },
    Failed(SessionError),
}

/// One item of a session's output sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Line(String),
    Finished(SessionStatus),
}

/// Longest prefix of `line` with at most `max_chars` characters (never splits a code point).
pub fn truncate_chars(line: &str, max_chars: usize) -> &str {
    match line.char_indices().nth(max_chars) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

/// Spawn `program args...` with stdout and stderr writing into one pipe, so the
/// output arrives as a single interleaved stream. The child is killed if its handle is dropped.
pub(crate) fn spawn_merged(
    program: &str,
    args: &[String],
) -> io::Result<(Child, BufReader<pipe::Receiver>)> {
    let (reader, writer) = io::pipe()?;
    let child = {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer)
            .kill_on_drop(true);
        command.spawn()?
        // `command` drops here, closing the parent's copies of the write end so EOF is observable.
    };
    let receiver = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;
    Ok((child, BufReader::new(receiver)))
}

/// Decode one raw line: drop the line terminator and replace invalid UTF-8.
pub(crate) fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Read one line into `buf` (appending). Returns 0 at end of stream.
/// Partially read bytes stay in `buf` if the future is cancelled, so callers clear it only after a full line.
pub(crate) async fn read_raw_line(
    reader: &mut BufReader<pipe::Receiver>,
    buf: &mut Vec<u8>,
) -> io::Result<usize> {
    reader.read_until(b'\n', buf).await
}

/// Kill the child (if still running) and reap it.
pub(crate) async fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        log::debug!("start_kill: {}", e);
    }
    if let Err(e) = child.wait().await {
        log::debug!("waiting for killed child: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_chars_limits_by_characters() {
        let long = "x".repeat(10_000);
        assert_eq!(truncate_chars(&long, 4000).chars().count(), 4000);
        assert_eq!(truncate_chars("short", 4000), "short");
        assert_eq!(truncate_chars("ééé", 2), "éé");
        assert_eq!(truncate_chars("abc", 0), "");
    }

    #[test]
    fn decode_line_strips_terminators_and_tolerates_bad_utf8() {
        assert_eq!(decode_line(b"hello\n"), "hello");
        assert_eq!(decode_line(b"crlf\r\n"), "crlf");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"bad \xff byte\n"), "bad \u{fffd} byte");
    }

    #[test]
    fn session_error_messages() {
        assert_eq!(SessionError::NoPendingCommand.to_string(), "no pending command");
        assert_eq!(
            SessionError::LogNotFound(PathBuf::from("/reinstall.log")).to_string(),
            "log not found: /reinstall.log"
        );
    }

    #[tokio::test]
    async fn spawn_merged_interleaves_stdout_and_stderr() {
        let args = vec!["-c".to_string(), "echo out; echo err 1>&2; echo out2".to_string()];
        let (mut child, mut reader) = spawn_merged("sh", &args).expect("spawn sh");
        let mut lines = Vec::new();
        let mut buf = Vec::new();
        while read_raw_line(&mut reader, &mut buf).await.expect("read") > 0 {
            lines.push(decode_line(&buf));
            buf.clear();
        }
        let status = child.wait().await.expect("wait");
        assert_eq!(ProcessExit::from(status), ProcessExit::Code(0));
        assert_eq!(lines, vec!["out", "err", "out2"]);
    }
}
