//! Listener registry shared by the store backends.
//!
//! Backends call [`ListenerRegistry::dispatch`] with the current tree after
//! every change they apply or observe. Each listener remembers what it has
//! already delivered, so re-dispatching an unchanged tree is silent.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::store::StoreError;
use crate::tree;

/// Handle identifying one subscription, used to unsubscribe.
pub type SubscriptionId = u64;

/// Notification delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// Current value at the subscribed path (`None` when absent).
    Value(Option<Value>),
    /// A new child appeared under the subscribed path.
    ChildAdded { key: String, value: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenKind {
    Value,
    ChildAdded,
}

/// Receiving end of a store subscription.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    path: String,
    kind: ListenKind,
    rx: mpsc::UnboundedReceiver<StoreEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> ListenKind {
        self.kind
    }

    /// Wait for the next event. Returns `None` once the store has dropped the
    /// listener.
    pub async fn recv(&mut self) -> Option<StoreEvent> {
        self.rx.recv().await
    }

    /// Take an already-delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<StoreEvent> {
        self.rx.try_recv().ok()
    }
}

struct Listener {
    segs: Vec<String>,
    kind: ListenKind,
    tx: mpsc::UnboundedSender<StoreEvent>,
    /// Last value delivered to a value listener; outer `None` before the first.
    last: Option<Option<Value>>,
    /// Keys already delivered to a child-added listener.
    seen: HashSet<String>,
}

impl Listener {
    fn deliver(&mut self, root: &Value) {
        let segs: Vec<&str> = self.segs.iter().map(String::as_str).collect();
        let current = tree::get(root, &segs);

        match self.kind {
            ListenKind::Value => {
                let current = current.cloned();
                if self.last.as_ref() != Some(&current) {
                    let _ = self.tx.send(StoreEvent::Value(current.clone()));
                    self.last = Some(current);
                }
            }
            ListenKind::ChildAdded => {
                let Some(Value::Object(children)) = current else {
                    return;
                };
                let mut fresh: Vec<(&String, &Value)> = children
                    .iter()
                    .filter(|(key, _)| !self.seen.contains(*key))
                    .collect();
                fresh.sort_by(|a, b| a.0.cmp(b.0));
                for (key, value) in fresh {
                    self.seen.insert(key.clone());
                    let _ = self.tx.send(StoreEvent::ChildAdded {
                        key: key.clone(),
                        value: value.clone(),
                    });
                }
            }
        }
    }
}

/// Registry of live listeners for one store.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: HashMap<SubscriptionId, Listener>,
    next_id: SubscriptionId,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener and deliver the current state at `path` to it.
    pub fn register(
        &mut self,
        path: &str,
        kind: ListenKind,
        root: &Value,
    ) -> Result<Subscription, StoreError> {
        let segs: Vec<String> = tree::segments(path)?
            .into_iter()
            .map(str::to_string)
            .collect();
        let (tx, rx) = mpsc::unbounded_channel();

        self.next_id += 1;
        let id = self.next_id;

        let mut listener = Listener {
            segs,
            kind,
            tx,
            last: None,
            seen: HashSet::new(),
        };
        listener.deliver(root);
        self.listeners.insert(id, listener);

        Ok(Subscription {
            id,
            path: path.to_string(),
            kind,
            rx,
        })
    }

    /// Drop a listener. Returns false if it was not registered.
    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    /// Deliver changes in `root` to every listener, pruning closed ones.
    pub fn dispatch(&mut self, root: &Value) {
        self.listeners.retain(|_, l| !l.tx.is_closed());
        for listener in self.listeners.values_mut() {
            listener.deliver(root);
        }
    }

    /// Top-level documents (first two path segments) with live listeners.
    ///
    /// A listener on a single-segment path yields a one-element entry.
    pub fn watched_documents(&self) -> HashSet<Vec<String>> {
        self.listeners
            .values()
            .filter(|l| !l.tx.is_closed())
            .map(|l| l.segs.iter().take(2).cloned().collect())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_listener_fires_initially_and_on_change() {
        let mut registry = ListenerRegistry::new();
        let root = json!({"s": {"lockState": "unlocked"}});
        let mut sub = registry
            .register("s/lockState", ListenKind::Value, &root)
            .unwrap();
        assert_eq!(
            sub.try_recv(),
            Some(StoreEvent::Value(Some(json!("unlocked"))))
        );

        registry.dispatch(&root);
        assert_eq!(sub.try_recv(), None);

        registry.dispatch(&json!({"s": {"lockState": "locked"}}));
        assert_eq!(sub.try_recv(), Some(StoreEvent::Value(Some(json!("locked")))));

        registry.dispatch(&json!({}));
        assert_eq!(sub.try_recv(), Some(StoreEvent::Value(None)));
    }

    #[test]
    fn test_child_listener_delivers_each_key_once_in_order() {
        let mut registry = ListenerRegistry::new();
        let root = json!({"log": {"-c2": 2, "-c1": 1}});
        let mut sub = registry
            .register("log", ListenKind::ChildAdded, &root)
            .unwrap();

        let first = sub.try_recv().unwrap();
        assert_eq!(
            first,
            StoreEvent::ChildAdded {
                key: "-c1".into(),
                value: json!(1)
            }
        );
        assert!(matches!(sub.try_recv(), Some(StoreEvent::ChildAdded { key, .. }) if key == "-c2"));

        registry.dispatch(&json!({"log": {"-c1": 1, "-c2": 2, "-c3": 3}}));
        assert!(matches!(sub.try_recv(), Some(StoreEvent::ChildAdded { key, .. }) if key == "-c3"));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_closed_listeners_are_pruned() {
        let mut registry = ListenerRegistry::new();
        let sub = registry
            .register("a", ListenKind::Value, &json!({}))
            .unwrap();
        assert_eq!(registry.len(), 1);
        drop(sub);
        registry.dispatch(&json!({"a": 1}));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_watched_documents() {
        let mut registry = ListenerRegistry::new();
        let _a = registry
            .register("sessions/s1/lockState", ListenKind::Value, &json!({}))
            .unwrap();
        let _b = registry
            .register("sessions/s1/commands", ListenKind::ChildAdded, &json!({}))
            .unwrap();
        let docs = registry.watched_documents();
        assert_eq!(docs.len(), 1);
        assert!(docs.contains(&vec!["sessions".to_string(), "s1".to_string()]));
    }
}
