//! Inbound topic routing

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SwarmError};

/// One inbound message as seen by a topic handler.
#[derive(Debug, Clone)]
pub struct Message {
    /// Every topic of the request path, in order.
    pub topics: Vec<String>,
    pub payload: Value,
    /// Remote address or node id of the sender, when known.
    pub from: Option<String>,
}

pub type MessageHandler =
    Arc<dyn Fn(Message) -> BoxFuture<'static, Result<Option<Value>>> + Send + Sync>;

/// Maps topics to handlers. A path `a/b` reaches the handlers of both `a`
/// and `b`.
pub struct TopicRouter {
    handlers: RwLock<HashMap<String, Vec<MessageHandler>>>,
    max_processing_time: Duration,
}

impl TopicRouter {
    pub fn new(max_processing_time: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            max_processing_time,
        }
    }

    pub fn on<F, Fut>(&self, topic: impl Into<String>, handler: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(move |message| handler(message).boxed());
        self.handlers
            .write()
            .entry(topic.into())
            .or_default()
            .push(handler);
    }

    pub fn on_many<I, T, F, Fut>(&self, topics: I, handler: F)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
        F: Fn(Message) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        for topic in topics {
            self.on(topic, handler.clone());
        }
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.handlers.read().contains_key(topic)
    }

    pub fn split_path(path: &str) -> Vec<String> {
        path.trim_matches('/')
            .split('/')
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Runs every handler of every topic in `path` concurrently. No handler
    /// means no content; several results come back as a JSON array.
    pub async fn dispatch(
        &self,
        path: &str,
        payload: Value,
        from: Option<String>,
    ) -> Result<Option<Value>> {
        let topics = Self::split_path(path);
        let matching: Vec<MessageHandler> = {
            let handlers = self.handlers.read();
            topics
                .iter()
                .filter_map(|t| handlers.get(t))
                .flatten()
                .cloned()
                .collect()
        };
        debug!(topic = path, handlers = matching.len(), from = ?from, "Message received");
        if matching.is_empty() {
            return Ok(None);
        }

        let message = Message {
            topics,
            payload,
            from,
        };
        let calls = matching.iter().map(|handler| handler(message.clone()));
        let results = tokio::time::timeout(self.max_processing_time, try_join_all(calls))
            .await
            .map_err(|_| SwarmError::Timeout {
                task: path.to_string(),
                after: self.max_processing_time,
            })??;

        let mut values: Vec<Value> = results.into_iter().flatten().collect();
        Ok(match values.len() {
            0 => None,
            1 => values.pop(),
            _ => Some(Value::Array(values)),
        })
    }
}

impl std::fmt::Debug for TopicRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut topics: Vec<String> = self.handlers.read().keys().cloned().collect();
        topics.sort();
        f.debug_struct("TopicRouter")
            .field("topics", &topics)
            .field("max_processing_time", &self.max_processing_time)
            .finish()
    }
}
