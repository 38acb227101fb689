//! Confirmation gate: a proposed command only runs after the operator approves it.
//!
//! Per conversation: `NoPending -> Proposed -> {Approved | Cancelled}`. Proposing again
//! while a proposal is outstanding replaces it. Resolution consumes the proposal through
//! [`PendingStore::take`], so a confirm racing a re-propose sees exactly one command.

use std::time::Duration;

use chrono::Utc;

use crate::command::CommandVector;
use crate::pending::{PendingCommand, PendingStore};
use crate::session::SessionError;

/// Outcome of a successful resolution.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Approved; the caller hands the command to the streamer.
    Approved(PendingCommand),
    /// Cancelled; the command was discarded.
    Cancelled,
}

pub struct ConfirmationGate {
    store: PendingStore,
    /// Proposals older than this are discarded on resolve. None = no expiry.
    ttl: Option<Duration>,
}

impl ConfirmationGate {
    pub fn new(store: PendingStore, ttl: Option<Duration>) -> Self {
        Self { store, ttl }
    }

    /// Store `cmd` as the pending command for `key` and return its rendering for display.
    pub async fn propose(&self, key: &str, cmd: CommandVector) -> String {
        let rendered = cmd.render();
        if self.store.put(PendingCommand::new(key, cmd)).await.is_some() {
            log::info!("gate: replaced pending command for conversation {}", key);
        } else {
            log::info!("gate: stored pending command for conversation {}", key);
        }
        rendered
    }

    /// Consume the pending command for `key`.
    /// Errors with `NoPendingCommand` when there is none, `Expired` when it outlived the TTL.
    pub async fn resolve(&self, key: &str, approve: bool) -> Result<Resolution, SessionError> {
        let pending = self
            .store
            .take(key)
            .await
            .ok_or(SessionError::NoPendingCommand)?;
        if let Some(ttl) = self.ttl {
            let age = (Utc::now() - pending.created_at).to_std().unwrap_or_default();
            if age > ttl {
                log::info!(
                    "gate: pending command for conversation {} expired after {:?}",
                    key,
                    age
                );
                return Err(SessionError::Expired);
            }
        }
        if approve {
            log::info!("gate: conversation {} approved {}", key, pending.command);
            Ok(Resolution::Approved(pending))
        } else {
            log::info!("gate: conversation {} cancelled", key);
            Ok(Resolution::Cancelled)
        }
    }
}
