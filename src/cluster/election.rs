//! Deterministic master pick
//!
//! The master is the smallest member id. There is no quorum and no term: two
//! partitions that cannot see each other will each elect their own minimum.

use parking_lot::RwLock;
use tracing::info;

use super::node::NodeId;

#[derive(Debug, Default)]
pub struct Election {
    master: RwLock<Option<NodeId>>,
}

impl Election {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes the master from `members` and returns it.
    pub fn elect<'a, I>(&self, members: I) -> Option<NodeId>
    where
        I: IntoIterator<Item = &'a NodeId>,
    {
        let elected = members.into_iter().min().cloned();
        let mut master = self.master.write();
        if *master != elected {
            info!(master = ?elected, "Master elected");
            *master = elected.clone();
        }
        elected
    }

    /// Re-elects only when the departed node was the master.
    pub fn on_removed<'a, I>(&self, removed: &NodeId, members: I) -> bool
    where
        I: IntoIterator<Item = &'a NodeId>,
    {
        if self.master.read().as_ref() != Some(removed) {
            return false;
        }
        self.elect(members);
        true
    }

    pub fn master(&self) -> Option<NodeId> {
        self.master.read().clone()
    }

    pub fn is_master(&self, id: &NodeId) -> bool {
        self.master.read().as_ref() == Some(id)
    }
}
