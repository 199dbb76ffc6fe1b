//! Consistent hash ring
//!
//! Each member is placed on the ring `replicas` times so keys spread evenly and
//! a membership change only moves the keys adjacent to the affected points.
//! Placement uses the `hashring` crate's fixed-key SipHash, so every process
//! built from the same sources agrees on ownership.

use std::collections::BTreeSet;

use super::node::NodeId;

pub const DEFAULT_REPLICAS: u32 = 40;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct VirtualNode {
    id: NodeId,
    replica: u32,
}

pub struct HashRing {
    ring: hashring::HashRing<VirtualNode>,
    members: BTreeSet<NodeId>,
    replicas: u32,
}

impl HashRing {
    pub fn new(replicas: u32) -> Self {
        Self {
            ring: hashring::HashRing::new(),
            members: BTreeSet::new(),
            replicas: replicas.max(1),
        }
    }

    pub fn build<I>(ids: I, replicas: u32) -> Self
    where
        I: IntoIterator<Item = NodeId>,
    {
        let mut ring = Self::new(replicas);
        for id in ids {
            ring.add(id);
        }
        ring
    }

    /// Returns false when the id was already a member.
    pub fn add(&mut self, id: NodeId) -> bool {
        if self.members.contains(&id) {
            return false;
        }
        for replica in 0..self.replicas {
            self.ring.add(VirtualNode {
                id: id.clone(),
                replica,
            });
        }
        self.members.insert(id);
        true
    }

    /// Returns false when the id was not a member.
    pub fn remove(&mut self, id: &NodeId) -> bool {
        if !self.members.remove(id) {
            return false;
        }
        for replica in 0..self.replicas {
            self.ring.remove(&VirtualNode {
                id: id.clone(),
                replica,
            });
        }
        true
    }

    pub fn get(&self, key: &str) -> Option<&NodeId> {
        self.ring.get(&key).map(|vnode| &vnode.id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.contains(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl std::fmt::Debug for HashRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashRing")
            .field("members", &self.members)
            .field("replicas", &self.replicas)
            .finish()
    }
}
