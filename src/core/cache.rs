use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::core::models::InboxMessage;
use crate::core::store::Snapshot;

/// Schema DDL run on open.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    subject TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL DEFAULT '',
    icon_url TEXT,
    main_image_url TEXT,
    received_at INTEGER NOT NULL,
    expires_at INTEGER,
    is_read INTEGER DEFAULT 0,
    read_pending INTEGER DEFAULT 0,
    collapse_key TEXT,
    custom_data TEXT,
    client_app_data TEXT,
    app_ref_data TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_received
    ON messages(received_at DESC);
";

// ---------------------------------------------------------------------------
// Commands sent from async world → background thread
// ---------------------------------------------------------------------------

enum CacheCmd {
    SaveSnapshot {
        snapshot: Snapshot,
        reply: oneshot::Sender<Result<(), String>>,
    },
    LoadSnapshot {
        reply: oneshot::Sender<Result<Snapshot, String>>,
    },
    SetRead {
        id: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
}

// ---------------------------------------------------------------------------
// CacheHandle — Clone + Send + Sync async facade
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CacheHandle {
    tx: mpsc::UnboundedSender<CacheCmd>,
}

impl CacheHandle {
    /// Open (or create) the cache database under the user data dir.
    pub fn open() -> Result<Self, String> {
        Self::open_at(&Self::resolve_path())
    }

    /// Open (or create) `cache.db` inside `dir` and spawn the background thread.
    pub fn open_at(dir: &Path) -> Result<Self, String> {
        std::fs::create_dir_all(dir).map_err(|e| format!("Failed to create cache dir: {e}"))?;

        let db_file = dir.join("cache.db");
        let conn =
            Connection::open(&db_file).map_err(|e| format!("Failed to open cache db: {e}"))?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| format!("Failed to init cache schema: {e}"))?;

        let (tx, rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("inbox-sync-cache".into())
            .spawn(move || Self::run_loop(conn, rx))
            .map_err(|e| format!("Failed to spawn cache thread: {e}"))?;

        Ok(CacheHandle { tx })
    }

    fn resolve_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("inbox-sync")
    }

    // -- async methods -------------------------------------------------------

    /// Write-through: replaces every cached message with `snapshot`.
    ///
    /// A read recorded by `set_read` survives a snapshot that still has the
    /// message unread.
    pub async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheCmd::SaveSnapshot { snapshot, reply })
            .map_err(|_| "Cache unavailable".to_string())?;
        rx.await.map_err(|_| "Cache unavailable".to_string())?
    }

    pub async fn load_snapshot(&self) -> Result<Snapshot, String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheCmd::LoadSnapshot { reply })
            .map_err(|_| "Cache unavailable".to_string())?;
        rx.await.map_err(|_| "Cache unavailable".to_string())?
    }

    /// Persist a local read that the server has not confirmed yet.
    pub async fn set_read(&self, id: String) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheCmd::SetRead { id, reply })
            .map_err(|_| "Cache unavailable".to_string())?;
        rx.await.map_err(|_| "Cache unavailable".to_string())?
    }

    // -- background thread ---------------------------------------------------

    fn run_loop(conn: Connection, mut rx: mpsc::UnboundedReceiver<CacheCmd>) {
        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                CacheCmd::SaveSnapshot { snapshot, reply } => {
                    let _ = reply.send(Self::do_save_snapshot(&conn, &snapshot));
                }
                CacheCmd::LoadSnapshot { reply } => {
                    let _ = reply.send(Self::do_load_snapshot(&conn));
                }
                CacheCmd::SetRead { id, reply } => {
                    let _ = reply.send(Self::do_set_read(&conn, &id));
                }
            }
        }
        log::debug!("Cache thread exiting");
    }

    // -- synchronous DB operations -------------------------------------------

    fn do_save_snapshot(conn: &Connection, snapshot: &Snapshot) -> Result<(), String> {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| format!("Cache tx error: {e}"))?;

        let cached_reads: HashSet<String> = {
            let mut stmt = tx
                .prepare("SELECT id FROM messages WHERE is_read = 1 AND read_pending = 1")
                .map_err(|e| format!("Cache prepare error: {e}"))?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| format!("Cache query error: {e}"))?;
            let reads = ids
                .collect::<Result<HashSet<String>, _>>()
                .map_err(|e| format!("Cache row error: {e}"))?;
            reads
        };

        tx.execute("DELETE FROM messages", [])
            .map_err(|e| format!("Cache delete error: {e}"))?;

        let mut stmt = tx
            .prepare(
                "INSERT INTO messages (id, subject, content, icon_url, main_image_url, received_at, expires_at, is_read, read_pending, collapse_key, custom_data, client_app_data, app_ref_data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )
            .map_err(|e| format!("Cache prepare error: {e}"))?;

        for m in &snapshot.messages {
            // Snapshot taken before a concurrent set_read landed
            let stale = !m.is_read && cached_reads.contains(&m.id);
            let is_read = m.is_read || stale;
            let pending = stale || snapshot.pending_reads.iter().any(|id| id == &m.id);
            stmt.execute(rusqlite::params![
                m.id,
                m.subject,
                m.content,
                m.icon_url.as_ref().map(Url::as_str),
                m.main_image_url.as_ref().map(Url::as_str),
                m.received_at.timestamp_millis(),
                m.expires_at.map(|t| t.timestamp_millis()),
                is_read as i32,
                pending as i32,
                m.collapse_key,
                encode_map(&m.custom_data)?,
                encode_map(&m.client_app_data)?,
                encode_map(&m.app_ref_data)?,
            ])
            .map_err(|e| format!("Cache insert error: {e}"))?;
        }
        drop(stmt);

        tx.commit()
            .map_err(|e| format!("Cache commit error: {e}"))?;
        Ok(())
    }

    fn do_load_snapshot(conn: &Connection) -> Result<Snapshot, String> {
        let mut stmt = conn
            .prepare(
                "SELECT id, subject, content, icon_url, main_image_url, received_at, expires_at, is_read, read_pending, collapse_key, custom_data, client_app_data, app_ref_data
                 FROM messages
                 ORDER BY received_at DESC",
            )
            .map_err(|e| format!("Cache prepare error: {e}"))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(CachedRow {
                    id: row.get(0)?,
                    subject: row.get(1)?,
                    content: row.get(2)?,
                    icon_url: row.get(3)?,
                    main_image_url: row.get(4)?,
                    received_at: row.get(5)?,
                    expires_at: row.get(6)?,
                    is_read: row.get::<_, i32>(7)? != 0,
                    read_pending: row.get::<_, i32>(8)? != 0,
                    collapse_key: row.get(9)?,
                    custom_data: row.get(10)?,
                    client_app_data: row.get(11)?,
                    app_ref_data: row.get(12)?,
                })
            })
            .map_err(|e| format!("Cache query error: {e}"))?;

        let mut snapshot = Snapshot::default();
        for row in rows {
            let row = row.map_err(|e| format!("Cache row error: {e}"))?;
            if row.read_pending {
                snapshot.pending_reads.push(row.id.clone());
            }
            snapshot.messages.push(row.into_message()?);
        }
        Ok(snapshot)
    }

    fn do_set_read(conn: &Connection, id: &str) -> Result<(), String> {
        conn.execute(
            "UPDATE messages SET is_read = 1, read_pending = 1 WHERE id = ?1 AND is_read = 0",
            [id],
        )
        .map_err(|e| format!("Cache read flag error: {e}"))?;
        Ok(())
    }
}

struct CachedRow {
    id: String,
    subject: String,
    content: String,
    icon_url: Option<String>,
    main_image_url: Option<String>,
    received_at: i64,
    expires_at: Option<i64>,
    is_read: bool,
    read_pending: bool,
    collapse_key: Option<String>,
    custom_data: Option<String>,
    client_app_data: Option<String>,
    app_ref_data: Option<String>,
}

fn encode_map(map: &Map<String, Value>) -> Result<String, String> {
    serde_json::to_string(map).map_err(|e| format!("Cache encode error: {e}"))
}

fn decode_map(id: &str, column: &str, raw: Option<&str>) -> Result<Map<String, Value>, String> {
    match raw {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| format!("Cache row {id}: bad {column}: {e}")),
        None => Ok(Map::new()),
    }
}

impl CachedRow {
    fn into_message(self) -> Result<InboxMessage, String> {
        let received_at = DateTime::<Utc>::from_timestamp_millis(self.received_at)
            .ok_or_else(|| format!("Cache row {}: bad received_at", self.id))?;
        let custom_data = decode_map(&self.id, "custom_data", self.custom_data.as_deref())?;
        let client_app_data =
            decode_map(&self.id, "client_app_data", self.client_app_data.as_deref())?;
        let app_ref_data = decode_map(&self.id, "app_ref_data", self.app_ref_data.as_deref())?;
        Ok(InboxMessage {
            icon_url: self.icon_url.as_deref().and_then(|u| Url::parse(u).ok()),
            main_image_url: self.main_image_url.as_deref().and_then(|u| Url::parse(u).ok()),
            received_at,
            expires_at: self.expires_at.and_then(DateTime::<Utc>::from_timestamp_millis),
            is_read: self.is_read,
            collapse_key: self.collapse_key,
            custom_data,
            client_app_data,
            app_ref_data,
            id: self.id,
            subject: self.subject,
            content: self.content,
        })
    }
}
