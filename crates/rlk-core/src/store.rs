//! Storage abstraction for remote-lock session records.
//!
//! This module defines the `SessionStore` trait, a path-addressed JSON document
//! store with last-value subscriptions and an append-only child log, and an
//! in-memory implementation for tests and single-process use.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::trace;

use crate::model::paths;
use crate::tree;
use crate::watch::{ListenKind, ListenerRegistry, Subscription, SubscriptionId};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// Shared realtime document store holding session records.
///
/// Values at a path follow last-write-wins semantics. Writing `null` removes
/// the node. Subscriptions deliver the current value immediately and then every
/// change; child-added subscriptions deliver each child key once, in key order.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Check whether a session record exists.
    ///
    /// # Arguments
    /// * `session_id` - The session identifier (not a path)
    async fn exists(&self, session_id: &str) -> Result<bool, StoreError> {
        Ok(self.read(&paths::session(session_id)).await?.is_some())
    }

    /// Read the value at `path`.
    ///
    /// # Returns
    /// * `Ok(Some(value))` - The node exists
    /// * `Ok(None)` - Nothing is stored at `path`
    /// * `Err(StoreError)` - If the read failed
    async fn read(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Replace the value at `path`.
    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Merge `fields` into the node at `path`. Keys may be relative paths.
    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError>;

    /// Replace the value at `path` only while the document holding it
    /// (`sessions/<id>`) exists.
    ///
    /// # Returns
    /// * `Ok(true)` - The value was written
    /// * `Ok(false)` - The document is absent; nothing was written
    async fn write_if_present(&self, path: &str, value: Value) -> Result<bool, StoreError> {
        let segs = tree::segments(path)?;
        let doc = segs[..segs.len().min(2)].join("/");
        if self.read(&doc).await?.is_none() {
            return Ok(false);
        }
        self.write(path, value).await?;
        Ok(true)
    }

    /// Remove the node at `path`. Removing a missing node is not an error.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Append `record` under `path` with a generated key.
    ///
    /// # Returns
    /// The generated key. Keys sort in append order.
    async fn append(&self, path: &str, record: Value) -> Result<String, StoreError>;

    /// Subscribe to the value at `path`.
    async fn subscribe(&self, path: &str) -> Result<Subscription, StoreError>;

    /// Subscribe to children added under `path`, including those already present.
    async fn subscribe_child_added(&self, path: &str) -> Result<Subscription, StoreError>;

    /// Detach a subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: SessionStore + ?Sized> SessionStore for Arc<S> {
    async fn exists(&self, session_id: &str) -> Result<bool, StoreError> {
        (**self).exists(session_id).await
    }

    async fn read(&self, path: &str) -> Result<Option<Value>, StoreError> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError> {
        (**self).write(path, value).await
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        (**self).update(path, fields).await
    }

    async fn write_if_present(&self, path: &str, value: Value) -> Result<bool, StoreError> {
        (**self).write_if_present(path, value).await
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        (**self).delete(path).await
    }

    async fn append(&self, path: &str, record: Value) -> Result<String, StoreError> {
        (**self).append(path, record).await
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription, StoreError> {
        (**self).subscribe(path).await
    }

    async fn subscribe_child_added(&self, path: &str) -> Result<Subscription, StoreError> {
        (**self).subscribe_child_added(path).await
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), StoreError> {
        (**self).unsubscribe(id).await
    }
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

#[derive(Default)]
struct MemoryState {
    root: Value,
    registry: ListenerRegistry,
}

impl MemoryState {
    fn commit(&mut self) {
        self.registry.dispatch(&self.root);
    }
}

/// In-memory document store.
///
/// Every write notifies subscribers before the call returns, so a subscriber
/// in the same process observes changes in write order.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new store wrapped in an Arc for sharing between roles.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of the whole tree.
    pub async fn dump(&self) -> Value {
        self.state.read().await.root.clone()
    }

    /// Number of live listeners.
    pub async fn listener_count(&self) -> usize {
        self.state.read().await.registry.len()
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn read(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let segs = tree::segments(path)?;
        let state = self.state.read().await;
        Ok(tree::get(&state.root, &segs).cloned())
    }

    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let segs = tree::segments(path)?;
        let mut state = self.state.write().await;
        tree::set(&mut state.root, &segs, value);
        state.commit();
        trace!(path, "write");
        Ok(())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        let segs = tree::segments(path)?;
        let mut state = self.state.write().await;
        tree::update(&mut state.root, &segs, fields);
        state.commit();
        trace!(path, "update");
        Ok(())
    }

    async fn write_if_present(&self, path: &str, value: Value) -> Result<bool, StoreError> {
        let segs = tree::segments(path)?;
        let mut state = self.state.write().await;
        if tree::get(&state.root, &segs[..segs.len().min(2)]).is_none() {
            return Ok(false);
        }
        tree::set(&mut state.root, &segs, value);
        state.commit();
        trace!(path, "write");
        Ok(true)
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let segs = tree::segments(path)?;
        let mut state = self.state.write().await;
        tree::remove(&mut state.root, &segs);
        state.commit();
        trace!(path, "delete");
        Ok(())
    }

    async fn append(&self, path: &str, record: Value) -> Result<String, StoreError> {
        let segs = tree::segments(path)?;
        let mut state = self.state.write().await;
        let key = tree::next_push_key(tree::get(&state.root, &segs));
        let mut child = segs.clone();
        child.push(&key);
        tree::set(&mut state.root, &child, record);
        state.commit();
        trace!(path, key = %key, "append");
        Ok(key)
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription, StoreError> {
        let mut state = self.state.write().await;
        let MemoryState { root, registry } = &mut *state;
        registry.register(path, ListenKind::Value, root)
    }

    async fn subscribe_child_added(&self, path: &str) -> Result<Subscription, StoreError> {
        let mut state = self.state.write().await;
        let MemoryState { root, registry } = &mut *state;
        registry.register(path, ListenKind::ChildAdded, root)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), StoreError> {
        self.state.write().await.registry.remove(id);
        Ok(())
    }
}
