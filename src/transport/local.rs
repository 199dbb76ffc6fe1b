use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::{TopicRouter, Transport};
use crate::cluster::NodeId;
use crate::error::{Result, SwarmError};

/// In-process network joining the routers of several nodes by id.
#[derive(Debug, Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<NodeId, Arc<TopicRouter>>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a transport for `id` and makes it reachable.
    pub fn transport(
        self: &Arc<Self>,
        id: impl Into<NodeId>,
        max_processing_time: Duration,
    ) -> LocalTransport {
        let id = id.into();
        let router = Arc::new(TopicRouter::new(max_processing_time));
        self.attach(id.clone(), router.clone());
        LocalTransport {
            id,
            router,
            network: self.clone(),
        }
    }

    pub fn attach(&self, id: NodeId, router: Arc<TopicRouter>) {
        self.nodes.write().insert(id, router);
    }

    /// Makes `id` unreachable, as if its process went away.
    pub fn detach(&self, id: &NodeId) -> bool {
        self.nodes.write().remove(id).is_some()
    }

    fn route(&self, id: &NodeId) -> Option<Arc<TopicRouter>> {
        self.nodes.read().get(id).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct LocalTransport {
    id: NodeId,
    router: Arc<TopicRouter>,
    network: Arc<LocalNetwork>,
}

impl LocalTransport {
    pub fn id(&self) -> &NodeId {
        &self.id
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn router(&self) -> Arc<TopicRouter> {
        self.router.clone()
    }

    async fn send(&self, node: &NodeId, topic: &str, payload: Value) -> Result<Option<Value>> {
        let router = self
            .network
            .route(node)
            .ok_or_else(|| SwarmError::transport(format!("{} unreachable", node)))?;

        // Failures cross the wire as a status and a message.
        router
            .dispatch(topic, payload, Some(self.id.to_string()))
            .await
            .map_err(|e| SwarmError::Remote {
                node: node.clone(),
                status: e.status_code(),
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Message;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_reaches_peer_router() {
        let network = LocalNetwork::new();
        let a = network.transport("a", Duration::from_secs(1));
        let b = network.transport("b", Duration::from_secs(1));
        b.router().on("ping", |m: Message| async move {
            Ok(Some(json!({ "from": m.from, "echo": m.payload })))
        });

        let reply = a.send(&NodeId::from("b"), "ping", json!(1)).await.unwrap();
        assert_eq!(reply, Some(json!({"from": "a", "echo": 1})));
    }

    #[tokio::test]
    async fn test_detached_node_is_unreachable() {
        let network = LocalNetwork::new();
        let a = network.transport("a", Duration::from_secs(1));
        network.transport("b", Duration::from_secs(1));
        assert!(network.detach(&NodeId::from("b")));

        let err = a.send(&NodeId::from("b"), "ping", Value::Null).await.unwrap_err();
        assert!(matches!(err, SwarmError::Transport(_)));
    }

    #[tokio::test]
    async fn test_remote_failure_carries_status() {
        let network = LocalNetwork::new();
        let a = network.transport("a", Duration::from_secs(1));
        let b = network.transport("b", Duration::from_secs(1));
        b.router().on("t", |_m: Message| async {
            Err(SwarmError::TaskNotFound("x".into()))
        });

        let err = a.send(&NodeId::from("b"), "t", Value::Null).await.unwrap_err();
        assert!(matches!(err, SwarmError::Remote { status: 404, .. }));
    }
}
