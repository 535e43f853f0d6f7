//! Cluster membership interface (§1, §4.4): an opaque `BroadcastMessage`
//! sink and `OnNodeMessage` source. The gossip transport itself is an
//! external collaborator; the core only needs somewhere to hand encoded
//! frames to and a way to feed remote frames back into the router.

use async_trait::async_trait;

#[async_trait]
pub trait ClusterSink: Send + Sync {
    /// Hands an encoded frame to the gossip layer for replication to peers.
    async fn broadcast(&self, frame: Vec<u8>);
}

/// A `ClusterSink` that drops everything; used when clustering is disabled.
pub struct NullCluster;

#[async_trait]
impl ClusterSink for NullCluster {
    async fn broadcast(&self, _frame: Vec<u8>) {}
}
