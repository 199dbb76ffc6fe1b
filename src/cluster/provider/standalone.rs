use async_trait::async_trait;

use super::{MembershipProvider, Snapshot};
use crate::cluster::node::{LocalIdentity, Node};
use crate::error::Result;

/// Single-node cluster made of the local process alone.
#[derive(Debug, Clone)]
pub struct StandaloneProvider {
    local: LocalIdentity,
}

impl StandaloneProvider {
    pub fn new(local: LocalIdentity) -> Self {
        Self { local }
    }
}

#[async_trait]
impl MembershipProvider for StandaloneProvider {
    fn name(&self) -> &'static str {
        "standalone"
    }

    async fn snapshot(&self) -> Result<Snapshot> {
        Ok(Snapshot {
            nodes: vec![Node::new(self.local.id().clone())],
            cursor: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_is_local_node() {
        let provider = StandaloneProvider::new(LocalIdentity::new("10.1.2.3"));
        let snapshot = provider.snapshot().await.unwrap();
        assert_eq!(snapshot.nodes, vec![Node::new("10.1.2.3")]);
        assert!(provider.watch(None).is_none());
    }
}
