use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;

use crate::core::cache::CacheHandle;
use crate::core::models::{InboxMessage, MessageRecord, ReconcileResult, RemoteMessage};
use crate::core::remote::{FetchError, InboxSource};
use crate::core::store::{MessageStore, NotFound, Updated};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Network or timeout trouble; the store was left alone and a retry may work.
    #[error("inbox unavailable: {0}")]
    Transient(String),

    /// The server answered with something that isn't an inbox listing.
    #[error("invalid inbox response: {0}")]
    Invalid(String),
}

impl From<FetchError> for SyncError {
    fn from(e: FetchError) -> Self {
        if e.is_transient() {
            SyncError::Transient(e.to_string())
        } else {
            SyncError::Invalid(e.to_string())
        }
    }
}

pub type SyncResult = Result<ReconcileResult, SyncError>;

type Flight = Shared<BoxFuture<'static, SyncResult>>;

struct Inner {
    source: Arc<dyn InboxSource>,
    store: Arc<MessageStore>,
    cache: Option<CacheHandle>,
    /// The refresh currently running, tagged with its flight number.
    inflight: Mutex<Option<(u64, Flight)>>,
    next_flight: AtomicU64,
}

/// Fetches the inbox and reconciles it into the [`MessageStore`].
#[derive(Clone)]
pub struct InboxSyncEngine {
    inner: Arc<Inner>,
}

impl InboxSyncEngine {
    pub fn new(
        source: Arc<dyn InboxSource>,
        store: Arc<MessageStore>,
        cache: Option<CacheHandle>,
    ) -> Self {
        InboxSyncEngine {
            inner: Arc::new(Inner {
                source,
                store,
                cache,
                inflight: Mutex::new(None),
                next_flight: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.inner.store
    }

    /// Fetch and reconcile. Callers arriving while a refresh is running join
    /// it instead of starting another fetch.
    ///
    /// The work runs on its own task: dropping the returned future does not
    /// cancel it, and the store is still updated.
    pub async fn refresh(&self) -> SyncResult {
        let flight = self.join_or_start();
        flight.await
    }

    pub fn is_refreshing(&self) -> bool {
        lock(&self.inner.inflight).is_some()
    }

    fn join_or_start(&self) -> Flight {
        let mut slot = lock(&self.inner.inflight);
        if let Some((id, flight)) = slot.as_ref() {
            log::debug!("Joining inbox refresh #{}", id);
            return flight.clone();
        }

        let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
        log::debug!("Starting inbox refresh #{}", id);

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let result = inner.run().await;
            let mut slot = lock(&inner.inflight);
            if slot.as_ref().is_some_and(|(current, _)| *current == id) {
                *slot = None;
            }
            result
        });

        let flight = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(SyncError::Transient(format!("sync task failed: {e}"))))
        }
        .boxed()
        .shared();

        *slot = Some((id, flight.clone()));
        flight
    }

    /// Mark a message read locally, then persist it and tell the server in
    /// the background. Only the first call for a message reports anything.
    pub fn mark_read(&self, id: &str) -> Result<Updated, NotFound> {
        let updated = self.inner.store.mark_read(id)?;
        if updated == Updated::Changed {
            let inner = self.inner.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                if let Some(cache) = &inner.cache {
                    if let Err(e) = cache.set_read(id.clone()).await {
                        log::warn!("Failed to cache read flag for {}: {}", id, e);
                    }
                }
                if let Err(e) = inner.source.mark_read(&id).await {
                    log::warn!("Failed to report read for {}: {}", id, e);
                }
            });
        }
        Ok(updated)
    }

    /// Re-fetch one message and apply it to the store.
    ///
    /// Returns `Ok(None)` when the message left the store in the meantime;
    /// the store is never grown by this call.
    pub async fn refresh_message(&self, id: &str) -> Result<Option<InboxMessage>, SyncError> {
        let body = self.inner.source.fetch_message(id).await?;
        let value: Value = serde_json::from_slice(&body)
            .map_err(|e| SyncError::Invalid(format!("undecodable body: {e}")))?;
        let remote = MessageRecord::parse(value, Utc::now())
            .map_err(|e| SyncError::Invalid(format!("bad record: {e}")))?;
        if remote.message.id != id {
            return Err(SyncError::Invalid(format!(
                "asked for {} but got {}",
                id, remote.message.id
            )));
        }

        let message = match self.inner.store.update_one(remote) {
            Ok(message) => message,
            Err(NotFound(id)) => {
                log::debug!("Message {} left the store during refresh", id);
                return Ok(None);
            }
        };
        if let Some(cache) = &self.inner.cache {
            if let Err(e) = cache.save_snapshot(self.inner.store.snapshot()).await {
                log::warn!("Failed to cache inbox: {}", e);
            }
        }
        Ok(Some(message))
    }

    /// Seed an empty store from the persistent cache.
    pub async fn restore_from_cache(&self) -> Result<bool, String> {
        let Some(cache) = &self.inner.cache else {
            return Ok(false);
        };
        let snapshot = cache.load_snapshot().await?;
        let count = snapshot.messages.len();
        let restored = self.inner.store.restore(snapshot);
        if restored {
            log::info!("Restored {} inbox messages from cache", count);
        }
        Ok(restored)
    }
}

impl Inner {
    async fn run(&self) -> SyncResult {
        let body = self.source.fetch_messages().await.map_err(|e| {
            let err = SyncError::from(e);
            log::error!("Inbox fetch failed: {}", err);
            err
        })?;

        let batch = parse_batch(&body, Utc::now()).map_err(|e| {
            log::error!("Inbox sync rejected: {}", e);
            e
        })?;

        let result = self.store.upsert_all(batch);
        log::info!(
            "Inbox synced: {} added, {} updated, {} removed",
            result.added,
            result.updated,
            result.removed
        );

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.save_snapshot(self.store.snapshot()).await {
                log::warn!("Failed to cache inbox: {}", e);
            }
        }

        Ok(result)
    }
}

/// Decode a listing body. The batch as a whole must be well formed; single
/// bad records are dropped.
fn parse_batch(body: &[u8], fetched_at: DateTime<Utc>) -> Result<Vec<RemoteMessage>, SyncError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| SyncError::Invalid(format!("undecodable body: {e}")))?;

    let records = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("messages") {
            Some(Value::Array(items)) => items,
            _ => return Err(SyncError::Invalid("object without a messages array".into())),
        },
        _ => return Err(SyncError::Invalid("expected an array of messages".into())),
    };

    let total = records.len();
    let batch: Vec<RemoteMessage> = records
        .into_iter()
        .enumerate()
        .filter_map(|(i, value)| match MessageRecord::parse(value, fetched_at) {
            Ok(remote) => Some(remote),
            Err(e) => {
                log::warn!("Dropping inbox record {}: {}", i, e);
                None
            }
        })
        .collect();

    if batch.len() < total {
        log::warn!("Kept {} of {} inbox records", batch.len(), total);
    }
    Ok(batch)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{eventually, FakeInbox};
    use serde_json::json;

    fn listing() -> Vec<u8> {
        json!([
            { "message_uid": "a", "subject": "Hi", "content": "", "created_at": "1970-01-01T00:01:40Z" },
            { "message_uid": "b", "subject": "Yo", "content": "", "created_at": "1970-01-01T00:03:20Z" }
        ])
        .to_string()
        .into_bytes()
    }

    fn engine(source: &Arc<FakeInbox>) -> InboxSyncEngine {
        InboxSyncEngine::new(source.clone(), Arc::new(MessageStore::new()), None)
    }

    fn visible_ids(engine: &InboxSyncEngine) -> Vec<String> {
        engine
            .store()
            .list_visible(Utc::now())
            .into_iter()
            .map(|m| m.id)
            .collect()
    }

    #[tokio::test]
    async fn refresh_reconciles_listing() {
        let source = FakeInbox::new(Ok(listing()));
        let engine = engine(&source);

        let result = engine.refresh().await.unwrap();
        assert_eq!(result, ReconcileResult { added: 2, updated: 0, removed: 0 });
        assert_eq!(visible_ids(&engine), vec!["b", "a"]);
        assert!(!engine.is_refreshing());
    }

    #[tokio::test]
    async fn accepts_wrapped_listing() {
        let body = json!({ "messages": [{ "message_uid": "a", "content": "" }] });
        let source = FakeInbox::new(Ok(body.to_string().into_bytes()));
        let engine = engine(&source);
        assert_eq!(engine.refresh().await.unwrap().added, 1);
    }

    #[tokio::test]
    async fn malformed_records_are_dropped() {
        let body = json!([
            { "message_uid": "a", "content": "ok" },
            { "subject": "no id" },
            42
        ]);
        let source = FakeInbox::new(Ok(body.to_string().into_bytes()));
        let engine = engine(&source);

        let result = engine.refresh().await.unwrap();
        assert_eq!(result.added, 1);
        assert_eq!(visible_ids(&engine), vec!["a"]);
    }

    #[tokio::test]
    async fn transient_failure_keeps_store() {
        let source = FakeInbox::new(Ok(listing()));
        let engine = engine(&source);
        engine.refresh().await.unwrap();
        let now = Utc::now();
        let before = engine.store().list_visible(now);

        source.respond(Err(FetchError::Timeout));
        let err = engine.refresh().await.unwrap_err();
        assert!(matches!(err, SyncError::Transient(_)));
        assert_eq!(engine.store().list_visible(now), before);

        source.respond(Err(FetchError::Status(503)));
        assert!(matches!(engine.refresh().await, Err(SyncError::Transient(_))));
        assert_eq!(engine.store().list_visible(now), before);
    }

    #[tokio::test]
    async fn invalid_payload_keeps_store() {
        let source = FakeInbox::new(Ok(listing()));
        let engine = engine(&source);
        engine.refresh().await.unwrap();
        let before = engine.store().snapshot();

        let bodies: [&[u8]; 3] = [b"<html>", br#"{"error":"nope"}"#, b"\"text\""];
        for body in bodies {
            source.respond(Ok(body.to_vec()));
            assert!(matches!(engine.refresh().await, Err(SyncError::Invalid(_))));
            assert_eq!(engine.store().snapshot(), before);
        }

        source.respond(Err(FetchError::Status(401)));
        assert!(matches!(engine.refresh().await, Err(SyncError::Invalid(_))));
        assert_eq!(engine.store().snapshot(), before);
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_fetch() {
        let source = FakeInbox::gated(Ok(listing()));
        let engine = engine(&source);

        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.refresh().await }
        });
        eventually(|| source.fetches() == 1).await;
        assert!(engine.is_refreshing());

        let second = tokio::spawn({
            let engine = engine.clone();
            async move { engine.refresh().await }
        });
        tokio::task::yield_now().await;
        source.release();

        let a = first.await.unwrap();
        let b = second.await.unwrap();
        assert_eq!(a, b);
        assert_eq!(source.fetches(), 1);

        // A later refresh is a new flight.
        source.release();
        engine.refresh().await.unwrap();
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test]
    async fn dropped_caller_does_not_cancel() {
        let source = FakeInbox::gated(Ok(listing()));
        let engine = engine(&source);

        let caller = tokio::spawn({
            let engine = engine.clone();
            async move { engine.refresh().await }
        });
        eventually(|| source.fetches() == 1).await;
        caller.abort();
        source.release();

        let store = engine.store().clone();
        eventually(move || store.len() == 2).await;
    }

    #[tokio::test]
    async fn mark_read_reports_once() {
        let source = FakeInbox::new(Ok(listing()));
        let engine = engine(&source);
        engine.refresh().await.unwrap();

        assert_eq!(engine.mark_read("a"), Ok(Updated::Changed));
        assert_eq!(engine.mark_read("a"), Ok(Updated::Unchanged));
        assert_eq!(engine.mark_read("zzz"), Err(NotFound("zzz".into())));

        eventually(|| source.reads() == vec!["a".to_string()]).await;
        tokio::task::yield_now().await;
        assert_eq!(source.reads().len(), 1);
    }

    #[tokio::test]
    async fn writes_through_and_restores_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheHandle::open_at(dir.path()).unwrap();
        let source = FakeInbox::new(Ok(listing()));
        let engine = InboxSyncEngine::new(
            source.clone(),
            Arc::new(MessageStore::new()),
            Some(cache.clone()),
        );
        engine.refresh().await.unwrap();
        assert_eq!(cache.load_snapshot().await.unwrap().messages.len(), 2);

        let cold = InboxSyncEngine::new(source, Arc::new(MessageStore::new()), Some(cache));
        assert_eq!(cold.restore_from_cache().await, Ok(true));
        assert_eq!(visible_ids(&cold), vec!["b", "a"]);
        assert_eq!(cold.restore_from_cache().await, Ok(false));
    }

    #[test]
    fn null_optional_fields_keep_records() {
        let body = json!([
            { "message_uid": "a", "subject": "s", "content": "c", "images": null },
            { "message_uid": "b", "subject": "s", "content": "c", "inbox_custom_data": null },
            { "message_uid": "c", "subject": "s", "content": "c", "images": { "icon": null } },
            { "message_uid": "d", "subject": "s", "content": "c", "read": "true" }
        ]);
        let batch = parse_batch(body.to_string().as_bytes(), Utc::now()).unwrap();
        let ids: Vec<_> = batch.iter().map(|r| r.message.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn refresh_message_updates_stored_copy() {
        let source = FakeInbox::new(Ok(listing()));
        let engine = engine(&source);
        engine.refresh().await.unwrap();

        let record = json!({ "message_uid": "a", "subject": "Edited", "content": "new",
                             "created_at": "1970-01-01T00:01:40Z", "read": true });
        source.respond_single("a", Ok(record.to_string().into_bytes()));

        let message = engine.refresh_message("a").await.unwrap().unwrap();
        assert_eq!(message.subject, "Edited");
        assert!(message.is_read);
        assert_eq!(engine.store().get("a").unwrap(), message);
        assert_eq!(engine.store().len(), 2);
    }

    #[tokio::test]
    async fn refresh_message_failures_leave_store() {
        let source = FakeInbox::new(Ok(listing()));
        let engine = engine(&source);
        engine.refresh().await.unwrap();
        let before = engine.store().snapshot();

        assert!(matches!(
            engine.refresh_message("a").await,
            Err(SyncError::Invalid(_))
        ));
        source.respond_single("a", Err(FetchError::Timeout));
        assert!(matches!(
            engine.refresh_message("a").await,
            Err(SyncError::Transient(_))
        ));
        let other = json!({ "message_uid": "b", "content": "" });
        source.respond_single("a", Ok(other.to_string().into_bytes()));
        assert!(matches!(
            engine.refresh_message("a").await,
            Err(SyncError::Invalid(_))
        ));
        assert_eq!(engine.store().snapshot(), before);
    }

    #[tokio::test]
    async fn refresh_message_skips_removed_message() {
        let source = FakeInbox::new(Ok(listing()));
        let engine = engine(&source);
        engine.refresh().await.unwrap();

        let record = json!({ "message_uid": "zzz", "content": "" });
        source.respond_single("zzz", Ok(record.to_string().into_bytes()));
        assert_eq!(engine.refresh_message("zzz").await, Ok(None));
        assert!(engine.store().get("zzz").is_err());
    }
}
