//! Raft-based coordinator implementing [`MetadataCoordinator`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::commands::{MetadataOp, MetadataResponse};
use super::node::RaftNode;
use crate::cluster::error::BrokerResult;
use crate::cluster::retry::with_coordinator_policy;
use crate::cluster::traits::MetadataCoordinator;
use crate::types::NodeId;

/// Coordinator backed by a [`RaftNode`].
pub struct RaftCoordinator {
    node: Arc<RaftNode>,
}

impl RaftCoordinator {
    pub fn new(node: Arc<RaftNode>) -> Self {
        Self { node }
    }

    pub fn node(&self) -> &Arc<RaftNode> {
        &self.node
    }
}

#[async_trait]
impl MetadataCoordinator for RaftCoordinator {
    fn node_id(&self) -> NodeId {
        self.node.node_id()
    }

    /// Retries while leadership settles.
    async fn propose(&self, op: MetadataOp) -> BrokerResult<MetadataResponse> {
        let name = op.name();
        let node = self.node.clone();
        let result = with_coordinator_policy(
            || {
                let node = node.clone();
                let op = op.clone();
                async move { node.write(op).await }
            },
            |e| {
                debug!(op = name, error = %e, "Retrying metadata proposal");
                e.is_retriable()
            },
        )
        .await;
        if let Err(e) = &result {
            warn!(op = name, error = %e, "Metadata proposal failed");
        }
        result
    }

    async fn members(&self) -> Vec<NodeId> {
        let mut members = self.node.members();
        members.sort_unstable();
        members
    }

    async fn shutdown(&self) -> BrokerResult<()> {
        self.node.shutdown().await
    }
}
