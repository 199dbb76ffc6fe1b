use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{MembershipChange, MembershipProvider, MembershipWatch, Snapshot, WatchEvent, WatchSender};
use crate::cluster::node::{Node, NodeId};
use crate::error::{Result, SwarmError};

/// Published changes kept for replay to watches resuming from a cursor.
const RETAINED_CHANGES: usize = 32;

/// Provider whose membership is driven programmatically.
///
/// Every change bumps a version that serves as the watch cursor. A watch
/// opened with a cursor first replays the retained changes after it; a cursor
/// older than the retained window gets `CursorExpired`. Snapshot failures can
/// be injected to exercise retry paths.
#[derive(Debug)]
pub struct InMemoryProvider {
    nodes: Mutex<BTreeMap<NodeId, Node>>,
    version: AtomicU64,
    failures: AtomicUsize,
    snapshots: AtomicUsize,
    watchable: AtomicBool,
    history: Mutex<History>,
    watchers: Mutex<Vec<WatchSender>>,
    watch_cursors: Mutex<Vec<Option<String>>>,
}

#[derive(Debug, Default)]
struct History {
    changes: VecDeque<(u64, WatchEvent)>,
    /// Newest version no longer replayable.
    compacted: u64,
}

impl History {
    fn record(&mut self, version: u64, event: WatchEvent) {
        self.changes.push_back((version, event));
        while self.changes.len() > RETAINED_CHANGES {
            if let Some((dropped, _)) = self.changes.pop_front() {
                self.compacted = dropped;
            }
        }
    }

    /// Events after `cursor`, or `CursorExpired` when some were compacted.
    fn since(&self, cursor: &str) -> Result<Vec<WatchEvent>> {
        let after: u64 = cursor.parse().map_err(|_| SwarmError::CursorExpired)?;
        if after < self.compacted {
            return Err(SwarmError::CursorExpired);
        }
        Ok(self
            .changes
            .iter()
            .filter(|(version, _)| *version > after)
            .map(|(_, event)| event.clone())
            .collect())
    }
}

impl InMemoryProvider {
    pub fn new<I: IntoIterator<Item = Node>>(nodes: I) -> Self {
        Self {
            nodes: Mutex::new(nodes.into_iter().map(|n| (n.id.clone(), n)).collect()),
            version: AtomicU64::new(1),
            failures: AtomicUsize::new(0),
            snapshots: AtomicUsize::new(0),
            watchable: AtomicBool::new(true),
            history: Mutex::new(History::default()),
            watchers: Mutex::new(Vec::new()),
            watch_cursors: Mutex::new(Vec::new()),
        }
    }

    /// Disables or enables watch support for subsequent `watch` calls.
    pub fn set_watchable(&self, watchable: bool) {
        self.watchable.store(watchable, Ordering::SeqCst);
    }

    /// Makes the next `count` snapshot calls fail.
    pub fn fail_snapshots(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of snapshot calls served so far, failed ones included.
    pub fn snapshot_calls(&self) -> usize {
        self.snapshots.load(Ordering::SeqCst)
    }

    /// Replaces the membership without notifying watchers, as if the change
    /// happened while nobody was listening.
    pub fn set_nodes<I: IntoIterator<Item = Node>>(&self, nodes: I) {
        *self.nodes.lock() = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    pub fn add_node(&self, node: Node) {
        self.nodes.lock().insert(node.id.clone(), node.clone());
        self.publish(MembershipChange::Added(node));
    }

    pub fn remove_node(&self, id: &NodeId) {
        let removed = self.nodes.lock().remove(id);
        if let Some(node) = removed {
            self.publish(MembershipChange::Removed(node));
        }
    }

    /// Advances the version without a membership change, like a server
    /// bookmark.
    pub fn bookmark(&self) {
        self.deliver(|version| WatchEvent::bookmark(version.to_string()));
    }

    /// Current version, as handed out in snapshots.
    pub fn version(&self) -> String {
        self.version.load(Ordering::SeqCst).to_string()
    }

    /// Cursor passed to every `watch` call so far, in order.
    pub fn watch_cursors(&self) -> Vec<Option<String>> {
        self.watch_cursors.lock().clone()
    }

    /// Delivers `error` to every open watch and closes them.
    pub fn break_watches(&self, error: SwarmError) {
        let watchers = std::mem::take(&mut *self.watchers.lock());
        for watcher in watchers {
            watcher.try_send(Err(error.clone()));
        }
    }

    pub fn open_watches(&self) -> usize {
        let mut watchers = self.watchers.lock();
        watchers.retain(|w| !w.is_closed());
        watchers.len()
    }

    fn publish(&self, change: MembershipChange) {
        self.deliver(|version| WatchEvent::new(change, Some(version.to_string())));
    }

    /// Bumps the version under the history lock so recorded versions stay
    /// ordered, then fans the event out.
    fn deliver<F: FnOnce(u64) -> WatchEvent>(&self, event: F) {
        let mut history = self.history.lock();
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let event = event(version);
        history.record(version, event.clone());
        self.watchers.lock().retain(|w| w.try_send(Ok(event.clone())));
    }
}

#[async_trait]
impl MembershipProvider for InMemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn snapshot(&self) -> Result<Snapshot> {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(SwarmError::provider("injected snapshot failure"));
        }
        let nodes = self.nodes.lock().values().cloned().collect();
        Ok(Snapshot {
            nodes,
            cursor: Some(self.version.load(Ordering::SeqCst).to_string()),
        })
    }

    fn watch(&self, cursor: Option<String>) -> Option<MembershipWatch> {
        self.watch_cursors.lock().push(cursor.clone());
        if !self.watchable.load(Ordering::SeqCst) {
            return None;
        }
        let (tx, watch) = MembershipWatch::channel();

        // Held across replay and registration so no change slips in between.
        let history = self.history.lock();
        let missed = match cursor.as_deref().map(|c| history.since(c)) {
            None => Ok(Vec::new()),
            Some(missed) => missed,
        };
        match missed {
            Ok(missed) => {
                for event in missed {
                    tx.try_send(Ok(event));
                }
                self.watchers.lock().push(tx);
            }
            Err(e) => {
                tx.try_send(Err(e));
            }
        }
        drop(history);
        Some(watch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_injected_failures_then_success() {
        let provider = InMemoryProvider::new([Node::new("a")]);
        provider.fail_snapshots(2);
        assert!(provider.snapshot().await.is_err());
        assert!(provider.snapshot().await.is_err());
        assert_eq!(provider.snapshot().await.unwrap().nodes.len(), 1);
        assert_eq!(provider.snapshot_calls(), 3);
    }

    #[tokio::test]
    async fn test_watch_sees_changes_with_increasing_cursor() {
        let provider = InMemoryProvider::new([]);
        let mut watch = provider.watch(None).unwrap();

        provider.add_node(Node::new("a"));
        provider.remove_node(&NodeId::from("a"));

        let first = watch.next().await.unwrap().unwrap();
        let second = watch.next().await.unwrap().unwrap();
        assert_eq!(first.change, Some(MembershipChange::Added(Node::new("a"))));
        assert_eq!(second.change, Some(MembershipChange::Removed(Node::new("a"))));
        let c1: u64 = first.cursor.unwrap().parse().unwrap();
        let c2: u64 = second.cursor.unwrap().parse().unwrap();
        assert!(c2 > c1);
    }

    #[test]
    fn test_debug_lists_open_watches() {
        let provider = InMemoryProvider::new([Node::new("a")]);
        let _watch = provider.watch(None).unwrap();
        let text = format!("{:?}", provider);
        assert!(text.contains("InMemoryProvider"));
        assert!(text.contains("WatchSender"));
    }

    #[tokio::test]
    async fn test_dropped_watch_is_pruned() {
        let provider = InMemoryProvider::new([]);
        let watch = provider.watch(None).unwrap();
        assert_eq!(provider.open_watches(), 1);
        drop(watch);
        assert_eq!(provider.open_watches(), 0);
    }

    #[tokio::test]
    async fn test_watch_replays_changes_after_cursor() {
        let provider = InMemoryProvider::new([Node::new("a")]);
        let cursor = provider.snapshot().await.unwrap().cursor;

        provider.add_node(Node::new("b"));
        provider.bookmark();
        let mut watch = provider.watch(cursor.clone()).unwrap();
        provider.remove_node(&NodeId::from("a"));

        let replayed = watch.next().await.unwrap().unwrap();
        assert_eq!(replayed.change, Some(MembershipChange::Added(Node::new("b"))));
        let bookmark = watch.next().await.unwrap().unwrap();
        assert_eq!(bookmark.change, None);
        let live = watch.next().await.unwrap().unwrap();
        assert_eq!(live.change, Some(MembershipChange::Removed(Node::new("a"))));
        assert_eq!(live.cursor, Some(provider.version()));
        assert_eq!(provider.watch_cursors(), vec![cursor]);
    }

    #[tokio::test]
    async fn test_compacted_cursor_expires() {
        let provider = InMemoryProvider::new([]);
        for i in 0..RETAINED_CHANGES + 2 {
            provider.add_node(Node::new(format!("n{}", i)));
        }
        let mut watch = provider.watch(Some("1".into())).unwrap();
        assert!(matches!(watch.next().await, Some(Err(SwarmError::CursorExpired))));
        assert_eq!(provider.open_watches(), 0);
    }
}
