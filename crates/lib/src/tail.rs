//! Log tailing: follow a log file for a bounded time and forward what gets appended.
//!
//! The follower (`tail -F -n <seed>`) is spawned with merged output. A deadline armed at
//! spawn time sends SIGTERM; if the follower is still alive after the grace period it is
//! killed. The deadline lives in the same loop that owns the child handle, so it is gone
//! as soon as the follower exits on its own and can never signal a reused pid.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::unix::pipe;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::session::{
    decode_line, kill_and_reap, read_raw_line, spawn_merged, truncate_chars, ProcessExit,
    SessionError, SessionStatus, StreamEvent, EVENT_CHANNEL_CAPACITY,
};

pub const DEFAULT_TAIL_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_TAIL_SEED_LINES: usize = 50;
pub const DEFAULT_TAIL_GRACE: Duration = Duration::from_secs(5);

/// How followed lines are grouped into messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TailDelivery {
    /// One message per line.
    #[default]
    PerLine,
    /// Lines already buffered are joined into one message, up to the character limit.
    Batched,
}

/// Tail supervisor settings.
#[derive(Debug, Clone)]
pub struct TailOptions {
    pub timeout: Duration,
    pub grace: Duration,
    pub seed_lines: usize,
    pub max_line_chars: usize,
    pub delivery: TailDelivery,
    /// Follower program; invoked as `<program> -F -n <seed_lines> <path>`.
    pub program: String,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TAIL_TIMEOUT,
            grace: DEFAULT_TAIL_GRACE,
            seed_lines: DEFAULT_TAIL_SEED_LINES,
            max_line_chars: crate::exec::DEFAULT_MAX_LINE_CHARS,
            delivery: TailDelivery::PerLine,
            program: "tail".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Following,
    Terminating,
    Killed,
}

/// Runs time-bounded log followers.
#[derive(Debug, Clone, Default)]
pub struct LogTailSupervisor {
    options: TailOptions,
}

impl LogTailSupervisor {
    pub fn new(options: TailOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &TailOptions {
        &self.options
    }

    /// Follow `path` on its own task. Fails with `LogNotFound` (and no lines) when the
    /// path does not exist now; it is not re-checked later.
    pub fn follow(&self, path: &Path) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        if !path.exists() {
            let _ = tx.try_send(StreamEvent::Finished(SessionStatus::Failed(
                SessionError::LogNotFound(path.to_path_buf()),
            )));
            return rx;
        }
        let args = vec![
            "-F".to_string(),
            "-n".to_string(),
            self.options.seed_lines.to_string(),
            path.to_string_lossy().into_owned(),
        ];
        match spawn_merged(&self.options.program, &args) {
            Ok((child, reader)) => {
                log::info!(
                    "tail: following {} for {:?} (pid {:?})",
                    path.display(),
                    self.options.timeout,
                    child.id()
                );
                let options = self.options.clone();
                let path = path.to_path_buf();
                tokio::spawn(async move {
                    if let Some(status) = supervise(options, path, child, reader, &tx).await {
                        let _ = tx.send(StreamEvent::Finished(status)).await;
                    }
                });
            }
            Err(e) => {
                log::warn!("tail: failed to start follower: {}", e);
                let _ = tx.try_send(StreamEvent::Finished(SessionStatus::Failed(
                    SessionError::TailError(e.to_string()),
                )));
            }
        }
        rx
    }
}

/// Send SIGTERM to the child. A child that already exited makes this a no-op.
fn request_termination(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    // The child has not been reaped (we still own it), so the pid cannot have been reused.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        log::debug!(
            "tail: SIGTERM to {} failed: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

async fn supervise(
    options: TailOptions,
    path: PathBuf,
    mut child: Child,
    mut reader: BufReader<pipe::Receiver>,
    tx: &mpsc::Sender<StreamEvent>,
) -> Option<SessionStatus> {
    let timer = tokio::time::sleep(options.timeout);
    tokio::pin!(timer);
    let mut phase = Phase::Following;
    let mut buf = Vec::new();
    let mut outbox = Outbox::new(options.delivery, options.max_line_chars);
    let mut eof = false;
    let mut exit: Option<ProcessExit> = None;

    // Reading pauses while a message waits for channel capacity; the deadline and the
    // child are watched regardless of the consumer.
    while !(eof && exit.is_some() && outbox.is_drained()) {
        tokio::select! {
            read = read_raw_line(&mut reader, &mut buf), if !eof && outbox.ready.is_empty() => {
                match read {
                    Ok(n) => {
                        if !buf.is_empty() {
                            let line = decode_line(&buf);
                            buf.clear();
                            let more_buffered = reader.buffer().contains(&b'\n');
                            outbox.push(truncate_chars(&line, options.max_line_chars), more_buffered);
                        }
                        if n == 0 {
                            eof = true;
                            outbox.flush();
                        }
                    }
                    Err(e) => {
                        log::warn!("tail: reading {} failed: {}", path.display(), e);
                        kill_and_reap(&mut child).await;
                        return Some(SessionStatus::Failed(SessionError::TailError(e.to_string())));
                    }
                }
            }
            permit = tx.reserve(), if !outbox.ready.is_empty() => {
                match (permit, outbox.ready.pop_front()) {
                    (Ok(permit), Some(text)) => permit.send(StreamEvent::Line(text)),
                    (Ok(_), None) => {}
                    (Err(_), _) => {
                        log::info!("tail: consumer disconnected, stopping follower");
                        kill_and_reap(&mut child).await;
                        return None;
                    }
                }
            }
            status = child.wait(), if exit.is_none() => {
                match status {
                    Ok(status) => {
                        let code = ProcessExit::from(status);
                        log::info!("tail: follower for {} exited with {}", path.display(), code);
                        exit = Some(code);
                    }
                    Err(e) => {
                        log::warn!("tail: waiting for follower failed: {}", e);
                        return Some(SessionStatus::Failed(SessionError::TailError(e.to_string())));
                    }
                }
            }
            _ = &mut timer, if phase != Phase::Killed && exit.is_none() => {
                match phase {
                    Phase::Following => {
                        log::info!("tail: {} reached its deadline, stopping follower", path.display());
                        request_termination(&child);
                        phase = Phase::Terminating;
                        timer.as_mut().reset(Instant::now() + options.grace);
                    }
                    _ => {
                        log::warn!("tail: follower ignored SIGTERM for {:?}, killing", options.grace);
                        if let Err(e) = child.start_kill() {
                            log::debug!("tail: start_kill: {}", e);
                        }
                        phase = Phase::Killed;
                    }
                }
            }
            _ = tx.closed(), if outbox.ready.is_empty() => {
                log::info!("tail: consumer disconnected, stopping follower");
                kill_and_reap(&mut child).await;
                return None;
            }
        }
    }

    Some(SessionStatus::TailFinished {
        timed_out: phase != Phase::Following,
        exit,
    })
}

/// Lines waiting to be delivered, grouped according to the delivery mode.
struct Outbox {
    delivery: TailDelivery,
    max_chars: usize,
    /// Messages ready to send, in order.
    ready: VecDeque<String>,
    /// Batched mode only: lines still being joined.
    batch: String,
    batch_chars: usize,
}

impl Outbox {
    fn new(delivery: TailDelivery, max_chars: usize) -> Self {
        Self {
            delivery,
            max_chars,
            ready: VecDeque::new(),
            batch: String::new(),
            batch_chars: 0,
        }
    }

    /// Queue a line. In batched mode the batch is closed once nothing more is buffered
    /// or the next line would not fit.
    fn push(&mut self, line: &str, more_buffered: bool) {
        if self.delivery == TailDelivery::PerLine {
            self.ready.push_back(line.to_string());
            return;
        }
        let len = line.chars().count();
        if !self.batch.is_empty() && self.batch_chars + 1 + len > self.max_chars {
            self.flush();
        }
        if !self.batch.is_empty() {
            self.batch.push('\n');
            self.batch_chars += 1;
        }
        self.batch.push_str(line);
        self.batch_chars += len;
        if !more_buffered {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if !self.batch.is_empty() {
            self.batch_chars = 0;
            self.ready.push_back(std::mem::take(&mut self.batch));
        }
    }

    fn is_drained(&self) -> bool {
        self.ready.is_empty() && self.batch.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::collect;
    use std::io::Write;

    fn temp_log(contents: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("rebullos-tail-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("reinstall.log");
        std::fs::File::create(&path)
            .and_then(|mut f| f.write_all(contents.as_bytes()))
            .expect("write log");
        (dir, path)
    }

    fn short_options() -> TailOptions {
        TailOptions {
            timeout: Duration::from_millis(500),
            grace: Duration::from_secs(2),
            ..TailOptions::default()
        }
    }

    #[tokio::test]
    async fn missing_log_yields_log_not_found_and_no_lines() {
        let supervisor = LogTailSupervisor::default();
        let path = PathBuf::from("/definitely/not/here/reinstall.log");
        let (lines, status) = collect(supervisor.follow(&path)).await;
        assert!(lines.is_empty());
        assert_eq!(status, SessionStatus::Failed(SessionError::LogNotFound(path)));
    }

    #[tokio::test]
    async fn seeds_last_lines_then_stops_at_deadline() {
        let contents: String = (1..=60).map(|i| format!("entry {}\n", i)).collect();
        let (dir, path) = temp_log(&contents);
        let supervisor = LogTailSupervisor::new(short_options());
        let (lines, status) = tokio::time::timeout(
            Duration::from_secs(15),
            collect(supervisor.follow(&path)),
        )
        .await
        .expect("follower stopped within the grace period");
        assert_eq!(lines.len(), 50);
        assert_eq!(lines.first().map(String::as_str), Some("entry 11"));
        assert_eq!(lines.last().map(String::as_str), Some("entry 60"));
        assert!(matches!(status, SessionStatus::TailFinished { timed_out: true, .. }));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn forwards_appended_lines_and_truncates_them() {
        let (dir, path) = temp_log("");
        let supervisor = LogTailSupervisor::new(TailOptions {
            timeout: Duration::from_secs(2),
            ..short_options()
        });
        let mut rx = supervisor.follow(&path);
        let appender_path = path.clone();
        let appender = tokio::spawn(async move {
            // Keep appending, like a script that never stops logging.
            for i in 0.. {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let line = if i == 0 { "y".repeat(10_000) } else { format!("tick {}", i) };
                let mut f = match std::fs::OpenOptions::new().append(true).open(&appender_path) {
                    Ok(f) => f,
                    Err(_) => return,
                };
                let _ = writeln!(f, "{}", line);
            }
        });
        let mut lines = Vec::new();
        let status = tokio::time::timeout(Duration::from_secs(15), async {
            while let Some(ev) = rx.recv().await {
                match ev {
                    StreamEvent::Line(l) => lines.push(l),
                    StreamEvent::Finished(s) => return s,
                }
            }
            panic!("no terminal event");
        })
        .await
        .expect("follower stopped within the grace period");
        appender.abort();
        assert!(matches!(status, SessionStatus::TailFinished { timed_out: true, .. }));
        assert!(!lines.is_empty());
        assert_eq!(lines[0].chars().count(), 4000);
        assert!(lines.iter().all(|l| l.chars().count() <= 4000));
        assert!(lines.iter().skip(1).any(|l| l.starts_with("tick")));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn follower_ignoring_sigterm_is_killed_after_grace() {
        let (dir, path) = temp_log("x\n");
        // Stands in for the follower; ignores its arguments and SIGTERM.
        let stubborn = dir.join("stubborn.sh");
        std::fs::write(&stubborn, "#!/bin/sh\ntrap '' TERM\necho started\nwhile :; do sleep 1; done\n")
            .expect("write stub");
        make_executable(&stubborn);
        let supervisor = LogTailSupervisor::new(TailOptions {
            timeout: Duration::from_millis(200),
            grace: Duration::from_millis(300),
            program: stubborn.to_string_lossy().into_owned(),
            ..TailOptions::default()
        });
        let (lines, status) = tokio::time::timeout(
            Duration::from_secs(10),
            collect(supervisor.follow(&path)),
        )
        .await
        .expect("stubborn follower was killed");
        assert_eq!(lines, vec!["started"]);
        assert_eq!(
            status,
            SessionStatus::TailFinished {
                timed_out: true,
                exit: Some(ProcessExit::Signal(libc::SIGKILL))
            }
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn batched_delivery_joins_buffered_lines() {
        let contents: String = (1..=5).map(|i| format!("row {}\n", i)).collect();
        let (dir, path) = temp_log(&contents);
        let supervisor = LogTailSupervisor::new(TailOptions {
            delivery: TailDelivery::Batched,
            ..short_options()
        });
        let (messages, status) = tokio::time::timeout(
            Duration::from_secs(15),
            collect(supervisor.follow(&path)),
        )
        .await
        .expect("follower stopped");
        assert!(matches!(status, SessionStatus::TailFinished { timed_out: true, .. }));
        let joined = messages.join("\n");
        assert_eq!(joined, "row 1\nrow 2\nrow 3\nrow 4\nrow 5");
        assert!(messages.len() <= 5);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn unterminated_last_line_is_delivered_at_deadline() {
        let (dir, path) = temp_log("done\nprogress 42%");
        let supervisor = LogTailSupervisor::new(short_options());
        let (lines, status) = tokio::time::timeout(
            Duration::from_secs(15),
            collect(supervisor.follow(&path)),
        )
        .await
        .expect("follower stopped within the grace period");
        assert_eq!(lines, vec!["done", "progress 42%"]);
        assert!(matches!(status, SessionStatus::TailFinished { timed_out: true, .. }));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn deadline_fires_while_consumer_is_not_reading() {
        let contents: String = (1..=500).map(|i| format!("line {}\n", i)).collect();
        let (dir, path) = temp_log(&contents);
        // Reports its pid, then becomes the real follower.
        let wrapper = dir.join("follow.sh");
        std::fs::write(&wrapper, "#!/bin/sh\necho $$\nexec tail \"$@\"\n").expect("write wrapper");
        make_executable(&wrapper);
        let supervisor = LogTailSupervisor::new(TailOptions {
            timeout: Duration::from_millis(300),
            grace: Duration::from_millis(300),
            seed_lines: 500,
            program: wrapper.to_string_lossy().into_owned(),
            ..TailOptions::default()
        });
        let mut rx = supervisor.follow(&path);
        let pid: i32 = match rx.recv().await {
            Some(StreamEvent::Line(l)) => l.trim().parse().expect("pid line"),
            other => panic!("expected pid line, got {:?}", other),
        };

        // More lines than the channel holds are pending and nobody reads them.
        let gone = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if unsafe { libc::kill(pid, 0) } != 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(gone.is_ok(), "follower {} outlived its deadline", pid);

        let (lines, status) = tokio::time::timeout(Duration::from_secs(10), collect(rx))
            .await
            .expect("session finished");
        assert_eq!(lines.len(), 500);
        assert_eq!(lines.last().map(String::as_str), Some("line 500"));
        assert!(matches!(status, SessionStatus::TailFinished { timed_out: true, exit: Some(_) }));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(start_paused = true)]
    async fn default_deadline_fires_after_ten_minutes() {
        let (dir, path) = temp_log("booting\n");
        let supervisor = LogTailSupervisor::default();
        assert_eq!(supervisor.options().timeout, Duration::from_secs(600));
        let started = Instant::now();
        let (_, status) = collect(supervisor.follow(&path)).await;
        assert!(started.elapsed() >= DEFAULT_TAIL_TIMEOUT);
        assert!(matches!(status, SessionStatus::TailFinished { timed_out: true, exit: Some(_) }));
        let _ = std::fs::remove_dir_all(dir);
    }

    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).expect("chmod");
    }
}
