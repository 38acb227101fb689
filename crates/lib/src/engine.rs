//! Engine: the entry points the chat adapter calls, and the pump that delivers session
//! output back through an [`OutputSink`].
//!
//! Every session (command run or log tail) gets its own task, so a ten-minute tail never
//! holds up a confirmation in the same or another conversation.

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::command::{CommandBuilder, CommandVector};
use crate::config::{self, Config};
use crate::exec::ProcessStreamer;
use crate::gate::{ConfirmationGate, Resolution};
use crate::pending::PendingStore;
use crate::session::{SessionError, SessionStatus, StreamEvent};
use crate::tail::{LogTailSupervisor, TailOptions};

/// Where session output goes (e.g. a Telegram chat).
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Called once per forwarded line, in read order. Failures are logged and skipped.
    async fn emit_line(&self, conversation_id: &str, text: &str) -> Result<(), String>;
    /// Called exactly once when a session ends.
    async fn emit_status(&self, conversation_id: &str, status: &SessionStatus);
}

/// Values injected into the engine; resolved from [`Config`] by [`EngineSettings::from_config`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub script_path: PathBuf,
    pub elevation: Option<String>,
    pub log_path: PathBuf,
    pub pending_ttl: Option<Duration>,
    pub max_lines: usize,
    pub max_line_chars: usize,
    pub tail: TailOptions,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            script_path: config::resolve_script_path(config)?,
            elevation: Some(config.reinstall.elevation.clone()),
            log_path: config.reinstall.log_path.clone(),
            pending_ttl: config::resolve_pending_ttl(config),
            max_lines: config.limits.max_lines,
            max_line_chars: config.limits.max_line_chars,
            tail: config.limits.tail_options(),
        })
    }
}

/// Result of an approve/cancel press that found a pending command.
#[derive(Debug)]
pub enum Decision {
    /// The command is running; the handle completes after its status was emitted.
    Running {
        command: CommandVector,
        session: JoinHandle<()>,
    },
    Cancelled,
}

pub struct Engine {
    builder: CommandBuilder,
    gate: ConfirmationGate,
    streamer: ProcessStreamer,
    tailer: LogTailSupervisor,
    script_path: PathBuf,
    log_path: PathBuf,
    sink: Arc<dyn OutputSink>,
}

impl Engine {
    pub fn new(settings: EngineSettings, sink: Arc<dyn OutputSink>) -> Self {
        Self {
            builder: CommandBuilder::new(settings.elevation),
            gate: ConfirmationGate::new(PendingStore::new(), settings.pending_ttl),
            streamer: ProcessStreamer::new(settings.max_lines, settings.max_line_chars),
            tailer: LogTailSupervisor::new(settings.tail),
            script_path: settings.script_path,
            log_path: settings.log_path,
            sink,
        }
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn tail_options(&self) -> &TailOptions {
        self.tailer.options()
    }

    /// Build the command for `tokens` and hold it for confirmation. Returns the rendering to show.
    pub async fn on_command_request(&self, conversation_id: &str, tokens: Vec<String>) -> String {
        let command = self.builder.build(&self.script_path, tokens);
        self.gate.propose(conversation_id, command).await
    }

    /// Resolve the pending command. On approval the command starts streaming to the sink.
    pub async fn on_confirmation(
        &self,
        conversation_id: &str,
        approve: bool,
    ) -> Result<Decision, SessionError> {
        match self.gate.resolve(conversation_id, approve).await? {
            Resolution::Cancelled => Ok(Decision::Cancelled),
            Resolution::Approved(pending) => {
                let rx = if self.script_path.exists() {
                    self.streamer.run(pending.command.clone())
                } else {
                    log::warn!("engine: script not found: {}", self.script_path.display());
                    finished(SessionStatus::Failed(SessionError::SpawnFailed(format!(
                        "script not found: {}",
                        self.script_path.display()
                    ))))
                };
                let session = pump(self.sink.clone(), conversation_id.to_string(), rx);
                Ok(Decision::Running {
                    command: pending.command,
                    session,
                })
            }
        }
    }

    /// Start following the log. A missing log ends the session with `LogNotFound` and no lines.
    pub fn on_tail_request(&self, conversation_id: &str) -> JoinHandle<()> {
        let rx = self.tailer.follow(&self.log_path);
        pump(self.sink.clone(), conversation_id.to_string(), rx)
    }
}

/// A receiver that yields only `status`.
fn finished(status: SessionStatus) -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel(1);
    let _ = tx.try_send(StreamEvent::Finished(status));
    rx
}

/// Forward session events to the sink on a dedicated task. Emits exactly one status, even
/// if the producer vanished without one.
fn pump(
    sink: Arc<dyn OutputSink>,
    conversation_id: String,
    mut rx: mpsc::Receiver<StreamEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Line(text) => {
                    if let Err(e) = sink.emit_line(&conversation_id, &text).await {
                        log::debug!("engine: emit_line to {} failed: {}", conversation_id, e);
                    }
                }
                StreamEvent::Finished(status) => {
                    sink.emit_status(&conversation_id, &status).await;
                    return;
                }
            }
        }
        log::warn!("engine: session for {} ended without a status", conversation_id);
        sink.emit_status(
            &conversation_id,
            &SessionStatus::Failed(SessionError::StreamError(
                "session ended unexpectedly".to_string(),
            )),
        )
        .await;
    })
}
