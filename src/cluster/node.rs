//! Cluster node identity

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Unique node key. Nodes are addressed by it, so it doubles as the address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A cluster member. Immutable once known; identity is the id alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Node {
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

/// The ids under which the local process is known to the cluster.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    id: NodeId,
    aliases: HashSet<NodeId>,
}

impl LocalIdentity {
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            aliases: HashSet::new(),
        }
    }

    pub fn with_aliases<I, T>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<NodeId>,
    {
        self.aliases.extend(aliases.into_iter().map(Into::into));
        self
    }

    /// Primary id, used when the local node announces itself.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn is_me(&self, node: &NodeId) -> bool {
        &self.id == node || self.aliases.contains(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_identity_ignores_metadata() {
        let a = Node::new("10.0.0.1").with_metadata("pod", "web-1");
        let b = Node::new("10.0.0.1");
        assert_eq!(a, b);
    }

    #[test]
    fn test_local_identity_aliases() {
        let me = LocalIdentity::new("10.0.0.1").with_aliases(["127.0.0.1"]);
        assert!(me.is_me(&NodeId::from("10.0.0.1")));
        assert!(me.is_me(&NodeId::from("127.0.0.1")));
        assert!(!me.is_me(&NodeId::from("10.0.0.2")));
    }
}
