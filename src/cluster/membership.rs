//! Membership set and the routing topology derived from it

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use super::node::{Node, NodeId};
use super::ring::HashRing;
use crate::error::{Result, SwarmError};

/// The set of nodes last confirmed live.
#[derive(Debug, Default, Clone)]
pub struct MembershipSet {
    nodes: HashMap<NodeId, Node>,
}

/// Outcome of comparing a snapshot against the current set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: Vec<Node>,
    pub removed: Vec<Node>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl MembershipSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_nodes<I: IntoIterator<Item = Node>>(nodes: I) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
        }
    }

    /// Single pass over the snapshot marks survivors and collects newcomers;
    /// whatever was not marked is gone. Duplicate ids in the snapshot count once.
    pub fn diff(&self, snapshot: &[Node]) -> ChangeSet {
        let mut keep: HashSet<&NodeId> = HashSet::with_capacity(snapshot.len());
        let mut changes = ChangeSet::default();

        for node in snapshot {
            if self.nodes.contains_key(&node.id) {
                keep.insert(&node.id);
            } else if keep.insert(&node.id) {
                changes.added.push(node.clone());
            }
        }

        changes.removed = self
            .nodes
            .values()
            .filter(|n| !keep.contains(&n.id))
            .cloned()
            .collect();
        changes
    }

    pub fn insert(&mut self, node: Node) -> bool {
        if self.nodes.contains_key(&node.id) {
            return false;
        }
        self.nodes.insert(node.id.clone(), node);
        true
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Node> {
        self.nodes.remove(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug)]
struct TopologyState {
    members: MembershipSet,
    ring: Option<HashRing>,
}

/// Membership set and hash ring behind one lock, so readers never see a ring
/// that disagrees with the set. Written by the reconciler, read by the
/// scheduler and the facade.
#[derive(Debug)]
pub struct Topology {
    state: RwLock<TopologyState>,
    replicas: u32,
}

impl Topology {
    pub fn new(replicas: u32) -> Self {
        Self {
            state: RwLock::new(TopologyState {
                members: MembershipSet::new(),
                ring: None,
            }),
            replicas,
        }
    }

    /// Applies a full diff. Additions go in before removals.
    pub fn apply(&self, changes: &ChangeSet) {
        let mut state = self.state.write();
        let TopologyState { members, ring } = &mut *state;
        for node in &changes.added {
            if members.insert(node.clone()) {
                if let Some(ring) = ring.as_mut() {
                    ring.add(node.id.clone());
                }
            }
        }
        for node in &changes.removed {
            if members.remove(&node.id).is_some() {
                if let Some(ring) = ring.as_mut() {
                    ring.remove(&node.id);
                }
            }
        }
    }

    /// Returns false when the node was already known.
    pub fn add(&self, node: Node) -> bool {
        let mut state = self.state.write();
        let id = node.id.clone();
        if !state.members.insert(node) {
            return false;
        }
        if let Some(ring) = state.ring.as_mut() {
            ring.add(id);
        }
        true
    }

    pub fn remove(&self, id: &NodeId) -> Option<Node> {
        let mut state = self.state.write();
        let removed = state.members.remove(id)?;
        if let Some(ring) = state.ring.as_mut() {
            ring.remove(id);
        }
        Some(removed)
    }

    /// Builds the ring from the current members unless one already exists.
    /// Returns true when a ring was built by this call.
    pub fn initialize_ring(&self) -> bool {
        let mut state = self.state.write();
        if state.ring.is_some() {
            return false;
        }
        let ring = HashRing::build(state.members.ids().cloned(), self.replicas);
        state.ring = Some(ring);
        true
    }

    /// Resolves the node owning `key`.
    ///
    /// An absent or empty ring gets one lazy rebuild from the current members
    /// before the lookup is declared impossible.
    pub fn owner_of(&self, key: &str) -> Result<Option<NodeId>> {
        {
            let state = self.state.read();
            if let Some(ring) = state.ring.as_ref().filter(|r| !r.is_empty()) {
                return Ok(ring.get(key).cloned());
            }
        }

        let mut state = self.state.write();
        let needs_build = state.ring.as_ref().map_or(true, HashRing::is_empty);
        if needs_build && !state.members.is_empty() {
            let ring = HashRing::build(state.members.ids().cloned(), self.replicas);
            state.ring = Some(ring);
        }
        match state.ring.as_ref() {
            Some(ring) if !ring.is_empty() => Ok(ring.get(key).cloned()),
            _ => Err(SwarmError::RingNotReady),
        }
    }

    pub fn members(&self) -> Vec<Node> {
        self.state.read().members.nodes().cloned().collect()
    }

    pub fn member_ids(&self) -> Vec<NodeId> {
        self.state.read().members.ids().cloned().collect()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.state.read().members.contains(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<Node> {
        self.state.read().members.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().members.is_empty()
    }

    pub fn ring_ready(&self) -> bool {
        self.state.read().ring.as_ref().is_some_and(|r| !r.is_empty())
    }

    pub fn diff(&self, snapshot: &[Node]) -> ChangeSet {
        self.state.read().members.diff(snapshot)
    }
}
