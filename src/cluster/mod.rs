//! Cluster membership, routing and election

pub mod election;
pub mod membership;
pub mod node;
pub mod provider;
pub mod reconciler;
pub mod retry;
pub mod ring;

pub use election::Election;
pub use membership::{ChangeSet, MembershipSet, Topology};
pub use node::{LocalIdentity, Node, NodeId};
pub use provider::{
    InMemoryProvider, KubernetesProvider, MembershipChange, MembershipProvider, MembershipWatch,
    Snapshot, StandaloneProvider, WatchEvent, WatchSender,
};
pub use reconciler::{Reconciler, ResyncOutcome};
pub use retry::RetryPolicy;
pub use ring::{HashRing, DEFAULT_REPLICAS};
