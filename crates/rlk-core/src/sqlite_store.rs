//! SQLite-backed session store.
//!
//! Each top-level document (`sessions/<id>`) is one row holding its JSON body.
//! Writes run in a transaction over that row. Subscriptions are served by a
//! polling task that re-reads watched documents, so a controller and a client
//! in different processes can share one database file. Writes made through
//! this handle notify local subscribers immediately.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::store::{SessionStore, StoreError};
use crate::tree;
use crate::watch::{ListenKind, ListenerRegistry, Subscription, SubscriptionId};

// ============================================================================
// Schema Version
// ============================================================================

/// Current schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

/// Default interval between polls for changes made by other processes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

// ============================================================================
// Row access
// ============================================================================

fn unavailable(e: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn write_failed(e: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(ref err, _) = e {
        if matches!(
            err.code,
            ErrorCode::ReadOnly
                | ErrorCode::PermissionDenied
                | ErrorCode::AuthorizationForStatementDenied
        ) {
            return StoreError::PermissionDenied(e.to_string());
        }
    }
    StoreError::WriteFailed(e.to_string())
}

fn document_key(segs: &[&str]) -> String {
    segs.iter().take(2).copied().collect::<Vec<_>>().join("/")
}

fn read_document(conn: &Connection, key: &str) -> Result<Option<Value>, StoreError> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM documents WHERE path = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(unavailable)?;

    match body {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

fn write_document(conn: &Connection, key: &str, body: Option<&Value>) -> Result<(), StoreError> {
    match body {
        Some(value) => {
            let text = serde_json::to_string(value)?;
            conn.execute(
                "INSERT INTO documents (path, body, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(path) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
                params![key, text, crate::types::now_millis()],
            )
            .map_err(write_failed)?;
        }
        None => {
            conn.execute("DELETE FROM documents WHERE path = ?1", params![key])
                .map_err(write_failed)?;
        }
    }
    Ok(())
}

/// Load the listed documents into a fresh tree. A one-segment entry loads
/// every document under that root.
fn load_documents(conn: &Connection, docs: &HashSet<Vec<String>>) -> Result<Value, StoreError> {
    let mut root = Value::Null;

    for doc in docs {
        match doc.as_slice() {
            [collection, id] => {
                let key = format!("{collection}/{id}");
                if let Some(body) = read_document(conn, &key)? {
                    tree::set(&mut root, &[collection.as_str(), id.as_str()], body);
                }
            }
            [collection] => {
                let mut stmt = conn
                    .prepare("SELECT path, body FROM documents WHERE path LIKE ?1")
                    .map_err(unavailable)?;
                let rows = stmt
                    .query_map(params![format!("{collection}/%")], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })
                    .map_err(unavailable)?;
                for row in rows {
                    let (path, text) = row.map_err(unavailable)?;
                    let body: Value = serde_json::from_str(&text)?;
                    let segs: Vec<&str> = path.split('/').collect();
                    tree::set(&mut root, &segs, body);
                }
            }
            _ => {}
        }
    }

    Ok(root)
}

// ============================================================================
// SQLite Store Implementation
// ============================================================================

struct Shared {
    conn: Mutex<Connection>,
    registry: Mutex<ListenerRegistry>,
}

impl Shared {
    /// Re-read watched documents and notify listeners of changes.
    ///
    /// Locks the registry before the connection; every path that needs both
    /// takes them in that order.
    async fn refresh(&self) -> Result<(), StoreError> {
        let mut registry = self.registry.lock().await;
        if registry.is_empty() {
            return Ok(());
        }
        let docs = registry.watched_documents();
        let root = {
            let conn = self.conn.lock().await;
            load_documents(&conn, &docs)?
        };
        registry.dispatch(&root);
        Ok(())
    }
}

/// SQLite-based persistent session store.
pub struct SqliteStore {
    shared: Arc<Shared>,
    poll_interval: Duration,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl SqliteStore {
    /// Open (or create) a store at `path` and run migrations.
    ///
    /// # Arguments
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    /// * `Ok(SqliteStore)` on success
    /// * `Err(StoreError)` if the database cannot be opened or migrated
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("failed to open database: {}", e)))?;

        // WAL lets a second process read while this one writes.
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )
        .map_err(|e| StoreError::Unavailable(format!("failed to set pragmas: {}", e)))?;

        Self::from_connection(conn)
    }

    /// Create an in-memory store, visible to this handle only.
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            StoreError::Unavailable(format!("failed to open in-memory database: {}", e))
        })?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        Self::run_migrations(&conn)?;
        Ok(Self {
            shared: Arc::new(Shared {
                conn: Mutex::new(conn),
                registry: Mutex::new(ListenerRegistry::new()),
            }),
            poll_interval: DEFAULT_POLL_INTERVAL,
            poller: Mutex::new(None),
        })
    }

    /// Set how often watched documents are re-read.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(10));
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Identifiers of every stored session.
    pub async fn session_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.shared.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT path FROM documents WHERE path LIKE 'sessions/%' ORDER BY path")
            .map_err(unavailable)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(unavailable)?;
        let mut ids = Vec::new();
        for row in rows {
            let path = row.map_err(unavailable)?;
            if let Some(id) = path.strip_prefix("sessions/") {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )
        .map_err(|e| StoreError::Unavailable(format!("failed to create schema_version: {}", e)))?;

        let current_version: i32 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap_or(0);

        if current_version < 1 {
            Self::migrate_v1(conn)?;
        }

        debug_assert!(current_version <= SCHEMA_VERSION);
        Ok(())
    }

    /// Schema version 1: one row per top-level document.
    fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                path TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_documents_updated ON documents(updated_at);

            INSERT OR IGNORE INTO schema_version (version) VALUES (1);
            "#,
        )
        .map_err(|e| StoreError::Unavailable(format!("migration v1 failed: {}", e)))
    }

    /// Apply `op` to the document addressed by `path` inside one transaction.
    async fn mutate<T>(
        &self,
        path: &str,
        op: impl FnOnce(&mut Value, &[&str]) -> T,
    ) -> Result<T, StoreError> {
        let segs = tree::segments(path)?;
        if segs.len() < 2 {
            return Err(StoreError::InvalidPath(format!(
                "{path}: writes must address a document or a node inside one"
            )));
        }
        let key = document_key(&segs);

        let out = {
            let mut conn = self.shared.conn.lock().await;
            let tx = conn.transaction().map_err(write_failed)?;

            let mut root = Value::Null;
            if let Some(body) = read_document(&tx, &key)? {
                tree::set(&mut root, &segs[..2], body);
            }
            let out = op(&mut root, &segs);
            write_document(&tx, &key, tree::get(&root, &segs[..2]))?;

            tx.commit().map_err(write_failed)?;
            out
        };

        // The write is committed; a failed refresh is caught up by the poller.
        if let Err(e) = self.shared.refresh().await {
            debug!(path, error = %e, "post-write refresh failed");
        }
        Ok(out)
    }

    async fn register(&self, path: &str, kind: ListenKind) -> Result<Subscription, StoreError> {
        let segs = tree::segments(path)?;
        let doc: Vec<String> = segs.iter().take(2).map(|s| s.to_string()).collect();

        let subscription = {
            let mut registry = self.shared.registry.lock().await;
            let root = {
                let conn = self.shared.conn.lock().await;
                load_documents(&conn, &HashSet::from([doc]))?
            };
            registry.register(path, kind, &root)?
        };

        self.ensure_poller().await;
        Ok(subscription)
    }

    async fn ensure_poller(&self) {
        let mut poller = self.poller.lock().await;
        if poller.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let shared = Arc::downgrade(&self.shared);
        let period = self.poll_interval;
        *poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if let Err(e) = shared.refresh().await {
                    debug!(error = %e, "poll failed");
                }
            }
        }));
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        if let Ok(mut poller) = self.poller.try_lock() {
            if let Some(handle) = poller.take() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn read(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let segs = tree::segments(path)?;
        let doc: Vec<String> = segs.iter().take(2).map(|s| s.to_string()).collect();
        let root = {
            let conn = self.shared.conn.lock().await;
            load_documents(&conn, &HashSet::from([doc]))?
        };
        Ok(tree::get(&root, &segs).cloned())
    }

    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.mutate(path, |root, segs| tree::set(root, segs, value))
            .await?;
        trace!(path, "write");
        Ok(())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        self.mutate(path, |root, segs| tree::update(root, segs, fields))
            .await?;
        trace!(path, "update");
        Ok(())
    }

    async fn write_if_present(&self, path: &str, value: Value) -> Result<bool, StoreError> {
        // Checked inside the row transaction so a concurrent delete cannot slip in.
        let written = self
            .mutate(path, |root, segs| {
                if tree::get(root, &segs[..2]).is_none() {
                    return false;
                }
                tree::set(root, segs, value);
                true
            })
            .await?;
        trace!(path, written, "conditional write");
        Ok(written)
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.mutate(path, |root, segs| tree::remove(root, segs)).await?;
        trace!(path, "delete");
        Ok(())
    }

    async fn append(&self, path: &str, record: Value) -> Result<String, StoreError> {
        let key = self
            .mutate(path, |root, segs| {
                let key = tree::next_push_key(tree::get(root, segs));
                let mut child: Vec<&str> = segs.to_vec();
                child.push(&key);
                tree::set(root, &child, record);
                key
            })
            .await?;
        trace!(path, key = %key, "append");
        Ok(key)
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription, StoreError> {
        self.register(path, ListenKind::Value).await
    }

    async fn subscribe_child_added(&self, path: &str) -> Result<Subscription, StoreError> {
        self.register(path, ListenKind::ChildAdded).await
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), StoreError> {
        self.shared.registry.lock().await.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::StoreEvent;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_read_update_delete() {
        let store = SqliteStore::new_in_memory().unwrap();
        store
            .write("sessions/s1", json!({"id": "s1", "client": {"connected": false}}))
            .await
            .unwrap();
        assert!(store.exists("s1").await.unwrap());

        let mut fields = Map::new();
        fields.insert("connected".into(), json!(true));
        store.update("sessions/s1/client", fields).await.unwrap();
        assert_eq!(
            store.read("sessions/s1/client/connected").await.unwrap(),
            Some(json!(true))
        );

        store.delete("sessions/s1").await.unwrap();
        assert!(!store.exists("s1").await.unwrap());
        assert!(store.session_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_root_level_write_rejected() {
        let store = SqliteStore::new_in_memory().unwrap();
        let err = store.write("sessions", json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn test_read_collection() {
        let store = SqliteStore::new_in_memory().unwrap();
        store.write("sessions/a", json!({"id": "a"})).await.unwrap();
        store.write("sessions/b", json!({"id": "b"})).await.unwrap();
        let all = store.read("sessions").await.unwrap().unwrap();
        assert_eq!(all["a"]["id"], "a");
        assert_eq!(all["b"]["id"], "b");
        assert_eq!(store.session_ids().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_append_is_ordered() {
        let store = SqliteStore::new_in_memory().unwrap();
        let a = store.append("sessions/s1/commands", json!({"n": 1})).await.unwrap();
        let b = store.append("sessions/s1/commands", json!({"n": 2})).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_local_write_notifies_subscriber() {
        let store = SqliteStore::new_in_memory().unwrap();
        let mut sub = store.subscribe("sessions/s1/lockState").await.unwrap();
        assert_eq!(sub.recv().await, Some(StoreEvent::Value(None)));

        store
            .write("sessions/s1/lockState", json!("locked"))
            .await
            .unwrap();
        assert_eq!(sub.recv().await, Some(StoreEvent::Value(Some(json!("locked")))));
    }

    #[tokio::test]
    async fn test_second_handle_sees_changes_by_polling() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rlk.db");

        let watcher = SqliteStore::new(&path)
            .unwrap()
            .with_poll_interval(Duration::from_millis(20));
        let writer = SqliteStore::new(&path).unwrap();

        let mut sub = watcher
            .subscribe_child_added("sessions/s1/commands")
            .await
            .unwrap();
        let key = writer
            .append("sessions/s1/commands", json!({"type": "lock"}))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(StoreEvent::ChildAdded { key: k, .. }) if k == key));
    }

    #[tokio::test]
    async fn test_write_if_present_does_not_resurrect_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rlk.db");
        let owner = SqliteStore::new(&path).unwrap();
        let other = SqliteStore::new(&path)
            .unwrap()
            .with_poll_interval(Duration::from_secs(60));

        owner.write("sessions/s1", json!({"id": "s1"})).await.unwrap();
        assert!(other
            .write_if_present("sessions/s1/client/lastSeen", json!(1))
            .await
            .unwrap());

        owner.delete("sessions/s1").await.unwrap();
        assert!(!other
            .write_if_present("sessions/s1/client/lastSeen", json!(2))
            .await
            .unwrap());
        assert!(!owner.exists("s1").await.unwrap());
        assert!(other.session_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rlk.db");
        SqliteStore::new(&path)
            .unwrap()
            .write("sessions/s1", json!({"id": "s1"}))
            .await
            .unwrap();
        let reopened = SqliteStore::new(&path).unwrap();
        assert!(reopened.exists("s1").await.unwrap());
    }
}
