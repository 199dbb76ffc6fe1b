use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::cluster::NodeId;

/// Errors surfaced by the swarm.
///
/// Foreign errors are captured as strings so the type stays `Clone`: a single
/// handler outcome is fanned out to every caller sharing an invocation.
#[derive(Debug, Error, Clone)]
pub enum SwarmError {
    #[error("No such task {0}")]
    TaskNotFound(String),

    #[error("Ring not ready")]
    RingNotReady,

    #[error("Max execution queue size reached for task {task} (limit {limit})")]
    QueueFull { task: String, limit: usize },

    #[error("Task {task} timed out after {after:?}")]
    Timeout { task: String, after: Duration },

    #[error("Task {task} failed: {message}")]
    Handler { task: String, message: String },

    #[error("Unable to register task {task}: {reason}")]
    Registration { task: String, reason: String },

    #[error("Dispatching task {task} to {node} failed: {source}")]
    Dispatch {
        task: String,
        node: NodeId,
        #[source]
        source: Box<SwarmError>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Node {node} answered with status {status}: {message}")]
    Remote {
        node: NodeId,
        status: u16,
        message: String,
    },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Membership provider error: {0}")]
    Provider(String),

    #[error("Membership cursor expired")]
    CursorExpired,

    #[error("Local node {0} was removed from the cluster")]
    SelfRemoved(NodeId),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("YAML error: {0}")]
    Yaml(String),
}

pub type Result<T> = std::result::Result<T, SwarmError>;

impl SwarmError {
    pub fn transport(msg: impl Into<String>) -> Self {
        SwarmError::Transport(msg.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        SwarmError::Provider(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        SwarmError::Config(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        SwarmError::BadRequest(msg.into())
    }

    /// HTTP status used when this error answers an inbound message.
    pub fn status_code(&self) -> u16 {
        match self {
            SwarmError::TaskNotFound(_) => 404,
            SwarmError::BadRequest(_) | SwarmError::Json(_) => 400,
            SwarmError::QueueFull { .. } => 429,
            SwarmError::RingNotReady => 503,
            SwarmError::Timeout { .. } => 504,
            SwarmError::Remote { status, .. } => *status,
            _ => 500,
        }
    }

    /// Whether a provider failure is worth retrying with the usual backoff.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            SwarmError::Config(_) | SwarmError::SelfRemoved(_) | SwarmError::Registration { .. }
        )
    }
}

impl From<io::Error> for SwarmError {
    fn from(e: io::Error) -> Self {
        SwarmError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for SwarmError {
    fn from(e: serde_json::Error) -> Self {
        SwarmError::Json(e.to_string())
    }
}

impl From<serde_yaml::Error> for SwarmError {
    fn from(e: serde_yaml::Error) -> Self {
        SwarmError::Yaml(e.to_string())
    }
}

impl From<reqwest::Error> for SwarmError {
    fn from(e: reqwest::Error) -> Self {
        SwarmError::Transport(e.to_string())
    }
}
