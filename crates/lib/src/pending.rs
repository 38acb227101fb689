//! Pending commands awaiting operator confirmation.
//!
//! One slot per conversation: proposing again replaces the previous command.
//! Entries are only ever consumed through [`PendingStore::take`], so a command
//! can be approved or cancelled at most once. Nothing here is persisted.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::command::CommandVector;

/// Opaque conversation identifier (e.g. a Telegram chat id).
pub type ConversationId = String;

/// A proposed command that has not been approved or cancelled yet.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub conversation_id: ConversationId,
    pub command: CommandVector,
    pub created_at: DateTime<Utc>,
}

impl PendingCommand {
    pub fn new(conversation_id: impl Into<ConversationId>, command: CommandVector) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            command,
            created_at: Utc::now(),
        }
    }
}

/// In-memory store: conversation id -> the single outstanding command.
/// Clones share the same map.
#[derive(Clone)]
pub struct PendingStore {
    inner: Arc<Mutex<HashMap<ConversationId, PendingCommand>>>,
}

impl Default for PendingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Store `cmd` under its conversation id, overwriting any existing entry.
    /// Returns the replaced entry, if there was one.
    pub async fn put(&self, cmd: PendingCommand) -> Option<PendingCommand> {
        let mut g = self.inner.lock().await;
        g.insert(cmd.conversation_id.clone(), cmd)
    }

    /// Remove and return the entry for `key` in one step.
    pub async fn take(&self, key: &str) -> Option<PendingCommand> {
        self.inner.lock().await.remove(key)
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(tokens: &[&str]) -> CommandVector {
        CommandVector::new(tokens.iter().map(|s| s.to_string()).collect())
    }

    #[tokio::test]
    async fn take_consumes_entry_once() {
        let store = PendingStore::new();
        store.put(PendingCommand::new("42", cmd(&["sudo", "/r.sh", "alpine"]))).await;
        let first = store.take("42").await.expect("entry present");
        assert_eq!(first.command.tokens()[2], "alpine");
        assert!(store.take("42").await.is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn put_replaces_previous_entry_for_same_key() {
        let store = PendingStore::new();
        assert!(store.put(PendingCommand::new("42", cmd(&["a"]))).await.is_none());
        let replaced = store.put(PendingCommand::new("42", cmd(&["b"]))).await;
        assert_eq!(replaced.map(|p| p.command), Some(cmd(&["a"])));
        assert_eq!(store.len().await, 1);
        assert_eq!(store.take("42").await.map(|p| p.command), Some(cmd(&["b"])));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let store = PendingStore::new();
        store.put(PendingCommand::new("1", cmd(&["one"]))).await;
        store.put(PendingCommand::new("2", cmd(&["two"]))).await;
        assert_eq!(store.take("2").await.map(|p| p.command), Some(cmd(&["two"])));
        assert_eq!(store.take("1").await.map(|p| p.command), Some(cmd(&["one"])));
    }

    #[tokio::test]
    async fn clones_share_entries() {
        let store = PendingStore::new();
        let other = store.clone();
        other.put(PendingCommand::new("3", cmd(&["z"]))).await;
        assert_eq!(store.len().await, 1);
        assert_eq!(store.take("3").await.map(|p| p.command), Some(cmd(&["z"])));
        assert!(other.is_empty().await);
    }

    #[tokio::test]
    async fn concurrent_takes_yield_a_single_winner() {
        let store = PendingStore::new();
        store.put(PendingCommand::new("7", cmd(&["x"]))).await;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = store.clone();
            handles.push(tokio::spawn(async move { s.take("7").await.is_some() }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.expect("join") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
