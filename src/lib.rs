pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod swarm;
pub mod tasks;
pub mod transport;

// Re-export common types
pub use cluster::{LocalIdentity, Node, NodeId};
pub use config::SwarmConfig;
pub use error::{Result, SwarmError};
pub use events::{EventKind, SwarmEvent};
pub use swarm::{Swarm, SwarmBuilder};
pub use tasks::{handler, Scheduler, SingleTrigger, TaskDefinition, TaskOptions};
