//! In-memory rule table with add/delete notifications.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use rulesync_proto::{Rule, RuleId};

/// Handle returned when registering a change listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A keyed rule collection that reports its own mutations.
///
/// Listeners receive owned copies of rules over bounded channels. A full
/// channel makes the mutating call wait, so slow listeners throttle writers
/// instead of losing changes.
#[async_trait]
pub trait RuleChangeSource: Send + Sync {
    /// Register a target for future add (and replace) notifications.
    fn on_add(&self, listener: mpsc::Sender<Rule>) -> ListenerId;

    /// Register a target for future delete notifications.
    fn on_del(&self, listener: mpsc::Sender<Rule>) -> ListenerId;

    /// Deregister a listener. Returns false if it was not registered.
    fn remove_listener(&self, id: ListenerId) -> bool;

    /// Insert or replace a rule.
    async fn put(&self, rule: Rule);

    /// Remove a rule by id, returning it if it existed.
    async fn delete(&self, id: &str) -> Option<Rule>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    Add,
    Delete,
}

struct Listener {
    id: ListenerId,
    kind: ChangeKind,
    tx: mpsc::Sender<Rule>,
}

/// The rule table of a node.
pub struct RuleStore {
    /// Rules keyed by id.
    rules: DashMap<RuleId, Rule>,
    /// Registered change listeners, in registration order.
    listeners: Mutex<Vec<Listener>>,
    /// Next listener ID.
    next_listener_id: AtomicU64,
    /// Held from a mutation until its notifications are queued, so listeners
    /// see changes in the order they were applied.
    writes: tokio::sync::Mutex<()>,
}

impl RuleStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            rules: DashMap::new(),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            writes: tokio::sync::Mutex::new(()),
        }
    }

    /// Get a copy of a rule.
    pub fn get(&self, id: &str) -> Option<Rule> {
        self.rules.get(id).map(|entry| entry.value().clone())
    }

    /// Check whether a rule exists.
    pub fn contains(&self, id: &str) -> bool {
        self.rules.contains_key(id)
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Snapshot of all rules ordered by id.
    pub fn rules(&self) -> Vec<Rule> {
        let sorted: BTreeMap<RuleId, Rule> = self
            .rules
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        sorted.into_values().collect()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn register(&self, kind: ChangeKind, tx: mpsc::Sender<Rule>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        self.listeners.lock().push(Listener { id, kind, tx });
        debug!(listener = id.0, kind = ?kind, "rule listener registered");
        id
    }

    /// Deliver a rule to every listener of `kind`.
    ///
    /// Senders are cloned out of the lock first; the sends may wait on full
    /// channels. Listeners whose receiver is gone are dropped.
    async fn notify(&self, kind: ChangeKind, rule: &Rule) {
        let targets: Vec<(ListenerId, mpsc::Sender<Rule>)> = self
            .listeners
            .lock()
            .iter()
            .filter(|listener| listener.kind == kind)
            .map(|listener| (listener.id, listener.tx.clone()))
            .collect();

        let mut closed = Vec::new();
        for (id, tx) in targets {
            if tx.send(rule.clone()).await.is_err() {
                closed.push(id);
            }
        }

        if !closed.is_empty() {
            debug!(count = closed.len(), "pruning closed rule listeners");
            self.listeners
                .lock()
                .retain(|listener| !closed.contains(&listener.id));
        }
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuleChangeSource for RuleStore {
    fn on_add(&self, listener: mpsc::Sender<Rule>) -> ListenerId {
        self.register(ChangeKind::Add, listener)
    }

    fn on_del(&self, listener: mpsc::Sender<Rule>) -> ListenerId {
        self.register(ChangeKind::Delete, listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|listener| listener.id != id);
        before != listeners.len()
    }

    async fn put(&self, rule: Rule) {
        let _write = self.writes.lock().await;
        trace!(rule = %rule.id, "put rule");
        self.rules.insert(rule.id.clone(), rule.clone());
        self.notify(ChangeKind::Add, &rule).await;
    }

    async fn delete(&self, id: &str) -> Option<Rule> {
        let _write = self.writes.lock().await;
        let (_, removed) = self.rules.remove(id)?;
        trace!(rule = %id, "deleted rule");
        self.notify(ChangeKind::Delete, &removed).await;
        Some(removed)
    }
}

/// Shared rule store handle.
pub type SharedRuleStore = Arc<RuleStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_put_and_get() {
        let store = RuleStore::new();
        store.put(Rule::new("r1", "a.*")).await;
        store.put(Rule::new("r2", "b.*")).await;

        assert_eq!(store.len(), 2);
        assert_eq!(store.get("r1").unwrap().pattern, "a.*");
        assert!(store.contains("r2"));
        assert!(store.get("r3").is_none());
    }

    #[tokio::test]
    async fn test_put_replaces() {
        let store = RuleStore::new();
        store.put(Rule::new("r1", "a.*")).await;
        store.put(Rule::new("r1", "b.*")).await;

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("r1").unwrap().pattern, "b.*");
    }

    #[tokio::test]
    async fn test_rules_sorted_by_id() {
        let store = RuleStore::new();
        for id in ["c", "a", "b"] {
            store.put(Rule::new(id, "")).await;
        }

        let ids: Vec<RuleId> = store.rules().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_add_listener_notified() {
        let store = RuleStore::new();
        let (tx, mut rx) = mpsc::channel(4);
        store.on_add(tx);

        store.put(Rule::new("r1", "a.*")).await;
        store.put(Rule::new("r1", "b.*")).await;

        assert_eq!(rx.recv().await.unwrap().pattern, "a.*");
        assert_eq!(rx.recv().await.unwrap().pattern, "b.*");
    }

    #[tokio::test]
    async fn test_delete_listener_gets_removed_rule() {
        let store = RuleStore::new();
        let (tx, mut rx) = mpsc::channel(4);
        store.on_del(tx);

        store.put(Rule::new("r1", "a.*")).await;
        let removed = store.delete("r1").await;

        assert_eq!(removed, Some(Rule::new("r1", "a.*")));
        assert_eq!(rx.recv().await.unwrap(), Rule::new("r1", "a.*"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_is_noop() {
        let store = RuleStore::new();
        let (tx, mut rx) = mpsc::channel(4);
        store.on_del(tx);

        store.put(Rule::new("r1", "")).await;
        assert!(store.delete("nope").await.is_none());

        assert_eq!(store.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_listener() {
        let store = RuleStore::new();
        let (tx, mut rx) = mpsc::channel(4);
        let id = store.on_add(tx);

        assert!(store.remove_listener(id));
        assert!(!store.remove_listener(id));
        assert_eq!(store.listener_count(), 0);

        store.put(Rule::new("r1", "")).await;
        // The store held the only sender, so the channel is now closed.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_listener_pruned() {
        let store = RuleStore::new();
        let (tx, rx) = mpsc::channel(4);
        store.on_add(tx);
        drop(rx);

        store.put(Rule::new("r1", "")).await;
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_full_listener_blocks_put() {
        let store = Arc::new(RuleStore::new());
        let (tx, mut rx) = mpsc::channel(1);
        store.on_add(tx);

        store.put(Rule::new("r1", "")).await;

        let writer = {
            let store = store.clone();
            tokio::spawn(async move { store.put(Rule::new("r2", "")).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        assert_eq!(rx.recv().await.unwrap().id, "r1");
        writer.await.unwrap();
        assert_eq!(rx.recv().await.unwrap().id, "r2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers() {
        let store = Arc::new(RuleStore::new());
        let mut handles = Vec::new();

        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..25 {
                    store.put(Rule::new(format!("r{}-{}", i, j), "")).await;
                }
                for j in 0..10 {
                    store.delete(&format!("r{}-{}", i, j)).await;
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len(), 8 * 15);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_id_writers_notify_in_apply_order() {
        let store = Arc::new(RuleStore::new());
        let (tx, mut rx) = mpsc::channel(1024);
        store.on_add(tx);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..50 {
                    store.put(Rule::new("r1", format!("p{}-{}", i, j))).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut last = None;
        while let Ok(rule) = rx.try_recv() {
            last = Some(rule);
        }
        assert_eq!(last, store.get("r1"));
    }
}
