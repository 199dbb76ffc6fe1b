//! Cluster events
//!
//! Listeners registered per event kind are called synchronously, in
//! registration order, at the point the event is emitted. The same events are
//! also published on a broadcast channel for async consumers.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::error;

use crate::cluster::Node;
use crate::error::SwarmError;

#[derive(Debug, Clone)]
pub enum SwarmEvent {
    /// First successful membership snapshot. Emitted once.
    Ready(Vec<Node>),
    NodeAdded(Node),
    NodeRemoved(Node),
    /// Failures that have no caller to report to.
    Error(SwarmError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ready,
    Error,
    NodeAdded,
    NodeRemoved,
}

impl SwarmEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SwarmEvent::Ready(_) => EventKind::Ready,
            SwarmEvent::NodeAdded(_) => EventKind::NodeAdded,
            SwarmEvent::NodeRemoved(_) => EventKind::NodeRemoved,
            SwarmEvent::Error(_) => EventKind::Error,
        }
    }
}

pub type EventListener = Arc<dyn Fn(&SwarmEvent) + Send + Sync>;

pub struct EventBus {
    listeners: RwLock<Vec<(EventKind, EventListener)>>,
    tx: broadcast::Sender<SwarmEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(Vec::new()),
            tx,
        }
    }

    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&SwarmEvent) + Send + Sync + 'static,
    {
        self.listeners.write().push((kind, Arc::new(listener)));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SwarmEvent) {
        let kind = event.kind();
        // Clone the matching listeners out so a listener may register others.
        let matching: Vec<EventListener> = self
            .listeners
            .read()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, l)| l.clone())
            .collect();

        if matching.is_empty() && kind == EventKind::Error && self.tx.receiver_count() == 0 {
            if let SwarmEvent::Error(e) = &event {
                error!("Unhandled swarm error: {}", e);
            }
        }

        for listener in matching {
            listener(&event);
        }
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.read().len())
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_listeners_receive_their_kind_only() {
        let bus = EventBus::default();
        let added = Arc::new(AtomicUsize::new(0));
        let counter = added.clone();
        bus.on(EventKind::NodeAdded, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(SwarmEvent::NodeAdded(Node::new("a")));
        bus.emit(SwarmEvent::NodeRemoved(Node::new("a")));
        bus.emit(SwarmEvent::NodeAdded(Node::new("b")));

        assert_eq!(added.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_subscribers_see_all_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(SwarmEvent::Ready(vec![Node::new("a")]));
        bus.emit(SwarmEvent::Error(SwarmError::provider("boom")));

        assert!(matches!(rx.recv().await.unwrap(), SwarmEvent::Ready(nodes) if nodes.len() == 1));
        assert!(matches!(rx.recv().await.unwrap(), SwarmEvent::Error(_)));
    }
}
