use std::collections::HashSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::core::models::{InboxMessage, ReconcileResult, RemoteMessage};

/// The requested id is not in the store. A normal outcome, not a failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("message {0} not found")]
pub struct NotFound(pub String);

/// Outcome of a successful `mark_read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Updated {
    /// The flag flipped from unread to read.
    Changed,
    /// The message was already read.
    Unchanged,
}

/// Full store contents, as handed to the persistent cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub messages: Vec<InboxMessage>,
    pub pending_reads: Vec<String>,
}

#[derive(Default)]
struct State {
    messages: IndexMap<String, InboxMessage>,
    /// Ids marked read locally that no batch has confirmed as read yet.
    pending_reads: HashSet<String>,
}

/// In-memory inbox cache keyed by message id.
///
/// Every mutation runs under the write lock, so readers see the state either
/// before or after it, never in between.
#[derive(Default)]
pub struct MessageStore {
    state: RwLock<State>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the id set with exactly the ids in `batch`.
    ///
    /// Existing messages keep their local read flag unless the record asserts
    /// one. A server `read: false` does not undo a local read the server has
    /// not confirmed yet.
    pub fn upsert_all(&self, batch: impl IntoIterator<Item = RemoteMessage>) -> ReconcileResult {
        let mut incoming: IndexMap<String, RemoteMessage> = IndexMap::new();
        for remote in batch {
            let id = remote.message.id.clone();
            if incoming.insert(id.clone(), remote).is_some() {
                log::debug!("Duplicate id {} in batch, keeping the last record", id);
            }
        }

        let mut state = self.write();
        let mut result = ReconcileResult::default();
        let mut next = IndexMap::with_capacity(incoming.len());

        for (id, remote) in incoming {
            let mut message = remote.message;
            let pending = state.pending_reads.contains(&id);
            match state.messages.get(&id) {
                Some(existing) => {
                    result.updated += 1;
                    message.is_read = merge_read(existing.is_read, remote.read, pending);
                }
                None => {
                    result.added += 1;
                    message.is_read = remote.read.unwrap_or(false);
                }
            }
            if remote.read == Some(true) {
                state.pending_reads.remove(&id);
            }
            next.insert(id, message);
        }

        result.removed = state
            .messages
            .keys()
            .filter(|id| !next.contains_key(id.as_str()))
            .count();
        state.pending_reads.retain(|id| next.contains_key(id));
        state.messages = next;

        result
    }

    pub fn get(&self, id: &str) -> Result<InboxMessage, NotFound> {
        self.read()
            .messages
            .get(id)
            .cloned()
            .ok_or_else(|| NotFound(id.to_string()))
    }

    /// Flag a message as read. Calling it again is a no-op.
    pub fn mark_read(&self, id: &str) -> Result<Updated, NotFound> {
        let mut state = self.write();
        let message = state
            .messages
            .get_mut(id)
            .ok_or_else(|| NotFound(id.to_string()))?;
        if message.is_read {
            return Ok(Updated::Unchanged);
        }
        message.is_read = true;
        state.pending_reads.insert(id.to_string());
        Ok(Updated::Changed)
    }

    /// Apply a fresher copy of a single message already in the store.
    ///
    /// Read state merges as in `upsert_all`. A message that is no longer
    /// stored is not brought back.
    pub fn update_one(&self, remote: RemoteMessage) -> Result<InboxMessage, NotFound> {
        let mut state = self.write();
        let id = remote.message.id.clone();
        let pending = state.pending_reads.contains(&id);
        let existing = state
            .messages
            .get_mut(&id)
            .ok_or_else(|| NotFound(id.clone()))?;
        let mut message = remote.message;
        message.is_read = merge_read(existing.is_read, remote.read, pending);
        *existing = message.clone();
        if remote.read == Some(true) {
            state.pending_reads.remove(&id);
        }
        Ok(message)
    }

    /// Non-expired messages, newest first, ties broken by id.
    pub fn list_visible(&self, now: DateTime<Utc>) -> Vec<InboxMessage> {
        let mut visible: Vec<InboxMessage> = self
            .read()
            .messages
            .values()
            .filter(|m| !m.is_expired(now))
            .cloned()
            .collect();
        visible.sort_by(|a, b| {
            b.received_at
                .cmp(&a.received_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        visible
    }

    pub fn unread_count(&self, now: DateTime<Utc>) -> usize {
        self.read()
            .messages
            .values()
            .filter(|m| !m.is_read && !m.is_expired(now))
            .count()
    }

    pub fn len(&self) -> usize {
        self.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().messages.is_empty()
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.read();
        let mut pending_reads: Vec<String> = state.pending_reads.iter().cloned().collect();
        pending_reads.sort();
        Snapshot {
            messages: state.messages.values().cloned().collect(),
            pending_reads,
        }
    }

    /// Seed an empty store from a persisted snapshot.
    ///
    /// Returns false, leaving the store alone, if a sync got there first.
    pub fn restore(&self, snapshot: Snapshot) -> bool {
        let mut state = self.write();
        if !state.messages.is_empty() {
            return false;
        }
        let messages: IndexMap<String, InboxMessage> = snapshot
            .messages
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();
        let pending_reads = snapshot
            .pending_reads
            .into_iter()
            .filter(|id| messages.contains_key(id))
            .collect();
        state.messages = messages;
        state.pending_reads = pending_reads;
        true
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn merge_read(local: bool, server: Option<bool>, pending: bool) -> bool {
    match server {
        // Server hasn't seen our read yet
        Some(false) if pending => true,
        Some(read) => read,
        None => local,
    }
}
