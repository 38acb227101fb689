//! Command execution: run an approved command and stream its merged output.
//! No shell is used; the command vector is passed as argv.
//!
//! At most `max_lines` lines are forwarded. Lines past the cap are still read so the
//! child never stalls on a full pipe; the final status reports how many were held back
//! (the full record lives in the script's own log).

use tokio::process::Child;
use tokio::sync::mpsc;

use crate::command::CommandVector;
use crate::session::{
    decode_line, kill_and_reap, read_raw_line, spawn_merged, truncate_chars, ProcessExit,
    SessionError, SessionStatus, StreamEvent, EVENT_CHANNEL_CAPACITY,
};

/// Default number of output lines forwarded per command.
pub const DEFAULT_MAX_LINES: usize = 40;
/// Default per-message character limit (Telegram rejects longer messages).
pub const DEFAULT_MAX_LINE_CHARS: usize = 4000;

/// Spawns commands and streams their output under a line cap.
#[derive(Debug, Clone)]
pub struct ProcessStreamer {
    max_lines: usize,
    max_line_chars: usize,
}

impl Default for ProcessStreamer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES, DEFAULT_MAX_LINE_CHARS)
    }
}

impl ProcessStreamer {
    pub fn new(max_lines: usize, max_line_chars: usize) -> Self {
        Self {
            max_lines,
            max_line_chars,
        }
    }

    /// Start `command` on its own task. The receiver yields forwarded lines in read order,
    /// then exactly one `Finished`. Dropping the receiver kills and reaps the child.
    pub fn run(&self, command: CommandVector) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let Some(program) = command.program() else {
            let _ = tx.try_send(StreamEvent::Finished(SessionStatus::Failed(
                SessionError::SpawnFailed("empty command".to_string()),
            )));
            return rx;
        };
        match spawn_merged(program, command.args()) {
            Ok((child, reader)) => {
                log::info!(
                    "exec: started {} (pid {:?})",
                    command,
                    child.id()
                );
                let streamer = self.clone();
                tokio::spawn(async move {
                    let status = streamer.stream(child, reader, &tx).await;
                    if let Some(status) = status {
                        let _ = tx.send(StreamEvent::Finished(status)).await;
                    }
                });
            }
            Err(e) => {
                log::warn!("exec: failed to start {}: {}", command, e);
                let _ = tx.try_send(StreamEvent::Finished(SessionStatus::Failed(
                    SessionError::SpawnFailed(e.to_string()),
                )));
            }
        }
        rx
    }

    /// Read until end of stream, then wait for the child. Returns None when the consumer went away.
    async fn stream(
        &self,
        mut child: Child,
        mut reader: tokio::io::BufReader<tokio::net::unix::pipe::Receiver>,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Option<SessionStatus> {
        let mut emitted = 0usize;
        let mut suppressed = 0usize;
        let mut buf = Vec::new();
        loop {
            let read = tokio::select! {
                read = read_raw_line(&mut reader, &mut buf) => read,
                _ = tx.closed() => {
                    log::info!("exec: consumer disconnected, killing child");
                    kill_and_reap(&mut child).await;
                    return None;
                }
            };
            match read {
                Ok(n) => {
                    // An unterminated final line still counts as a line.
                    if !buf.is_empty() {
                        if emitted < self.max_lines {
                            let line = decode_line(&buf);
                            let line = truncate_chars(&line, self.max_line_chars).to_string();
                            if tx.send(StreamEvent::Line(line)).await.is_err() {
                                log::info!("exec: consumer disconnected, killing child");
                                kill_and_reap(&mut child).await;
                                return None;
                            }
                            emitted += 1;
                            if emitted == self.max_lines {
                                log::debug!("exec: line cap {} reached, draining remaining output", self.max_lines);
                            }
                        } else {
                            suppressed += 1;
                        }
                        buf.clear();
                    }
                    if n == 0 {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("exec: reading output failed: {}", e);
                    kill_and_reap(&mut child).await;
                    return Some(SessionStatus::Failed(SessionError::StreamError(e.to_string())));
                }
            }
        }
        match child.wait().await {
            Ok(status) => {
                let exit = ProcessExit::from(status);
                log::info!("exec: finished with {} ({} line(s) suppressed)", exit, suppressed);
                Some(SessionStatus::Completed {
                    exit,
                    cap: self.max_lines,
                    suppressed,
                })
            }
            Err(e) => {
                log::warn!("exec: waiting for child failed: {}", e);
                Some(SessionStatus::Failed(SessionError::StreamError(e.to_string())))
            }
        }
    }
}

/// Collect every event of a session; test helper.
#[cfg(test)]
pub(crate) async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> (Vec<String>, SessionStatus) {
    let mut lines = Vec::new();
    while let Some(ev) = rx.recv().await {
        match ev {
            StreamEvent::Line(l) => lines.push(l),
            StreamEvent::Finished(s) => return (lines, s),
        }
    }
    panic!("session ended without a terminal event");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> CommandVector {
        CommandVector::new(vec!["sh".into(), "-c".into(), script.into()])
    }

    #[tokio::test]
    async fn caps_forwarded_lines_and_reports_completion() {
        let streamer = ProcessStreamer::default();
        let (lines, status) = collect(streamer.run(sh("i=1; while [ $i -le 1000 ]; do echo line$i; i=$((i+1)); done"))).await;
        assert_eq!(lines.len(), 40);
        assert_eq!(lines[0], "line1");
        assert_eq!(lines[39], "line40");
        assert_eq!(
            status,
            SessionStatus::Completed {
                exit: ProcessExit::Code(0),
                cap: 40,
                suppressed: 960
            }
        );
    }

    #[tokio::test]
    async fn truncates_long_lines() {
        let streamer = ProcessStreamer::default();
        let (lines, status) =
            collect(streamer.run(sh("printf '%010000d\\n' 0; echo short"))).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].chars().count(), 4000);
        assert_eq!(lines[1], "short");
        assert!(matches!(status, SessionStatus::Completed { exit: ProcessExit::Code(0), .. }));
    }

    #[tokio::test]
    async fn merges_stderr_and_reports_exit_code() {
        let streamer = ProcessStreamer::default();
        let (lines, status) = collect(streamer.run(sh("echo to-stdout; echo to-stderr >&2; exit 3"))).await;
        assert_eq!(lines, vec!["to-stdout", "to-stderr"]);
        assert!(matches!(status, SessionStatus::Completed { exit: ProcessExit::Code(3), suppressed: 0, .. }));
    }

    #[tokio::test]
    async fn forwards_unterminated_final_line() {
        let streamer = ProcessStreamer::default();
        let (lines, status) = collect(streamer.run(sh("echo done; printf 'progress 42%%'"))).await;
        assert_eq!(lines, vec!["done", "progress 42%"]);
        assert!(matches!(status, SessionStatus::Completed { exit: ProcessExit::Code(0), .. }));
    }

    #[tokio::test]
    async fn reports_signal_termination() {
        let streamer = ProcessStreamer::default();
        let (_, status) = collect(streamer.run(sh("kill -9 $$"))).await;
        assert!(matches!(status, SessionStatus::Completed { exit: ProcessExit::Signal(9), .. }));
    }

    #[tokio::test]
    async fn spawn_failure_yields_no_lines() {
        let streamer = ProcessStreamer::default();
        let cmd = CommandVector::new(vec!["/nonexistent/definitely-not-here".into()]);
        let (lines, status) = collect(streamer.run(cmd)).await;
        assert!(lines.is_empty());
        assert!(matches!(status, SessionStatus::Failed(SessionError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn empty_command_is_a_spawn_failure() {
        let streamer = ProcessStreamer::default();
        let (lines, status) = collect(streamer.run(CommandVector::new(Vec::new()))).await;
        assert!(lines.is_empty());
        assert_eq!(
            status,
            SessionStatus::Failed(SessionError::SpawnFailed("empty command".to_string()))
        );
    }

    #[tokio::test]
    async fn tokens_are_not_shell_interpreted() {
        let streamer = ProcessStreamer::default();
        let cmd = CommandVector::new(vec![
            "printf".into(),
            "%s\\n".into(),
            "$(echo injected)".into(),
            "a b".into(),
        ]);
        let (lines, _) = collect(streamer.run(cmd)).await;
        assert_eq!(lines, vec!["$(echo injected)", "a b"]);
    }

    #[tokio::test]
    async fn dropping_consumer_kills_child() {
        let streamer = ProcessStreamer::default();
        let mut rx = streamer.run(sh("echo $$; exec sleep 30"));
        let pid: i32 = match rx.recv().await {
            Some(StreamEvent::Line(l)) => l.trim().parse().expect("pid line"),
            other => panic!("expected pid line, got {:?}", other),
        };
        drop(rx);
        let gone = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                // Reaped children no longer exist; kill(pid, 0) then fails with ESRCH.
                if unsafe { libc::kill(pid, 0) } != 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(gone.is_ok(), "child {} still alive after consumer dropped", pid);
    }
}
