//! Node to node messaging
//!
//! A transport delivers a payload to a topic on another node and hands back
//! the response. Inbound messages are routed through a [`TopicRouter`].

mod http;
mod local;
mod router;

pub use http::HttpTransport;
pub use local::{LocalNetwork, LocalTransport};
pub use router::{Message, MessageHandler, TopicRouter};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::cluster::NodeId;
use crate::error::Result;

/// Topic reserved for scheduler to scheduler task dispatch.
pub const TASK_TOPIC: &str = "_task";

/// Body of a message on [`TASK_TOPIC`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Handlers for messages addressed to this node.
    fn router(&self) -> Arc<TopicRouter>;

    /// Delivers `payload` to `topic` on `node`. Strings travel as text,
    /// everything else as JSON. `None` when the node answered with no content.
    async fn send(&self, node: &NodeId, topic: &str, payload: Value) -> Result<Option<Value>>;

    /// Starts accepting inbound messages until `shutdown` fires.
    async fn start(&self, _shutdown: CancellationToken) -> Result<()> {
        Ok(())
    }
}
