//! Coordinator trait for cluster-wide metadata.
//!
//! Every topology change goes through a [`MetadataCoordinator`], which
//! replicates the operation and applies it, in one total order, to the
//! [`MetadataStateMachine`](super::MetadataStateMachine) of every node.
//!
//! # Available Implementations
//!
//! - [`RaftCoordinator`](super::raft::RaftCoordinator): openraft backend for
//!   multi-process clusters
//! - [`LocalCoordinator`](super::LocalCoordinator): a member of a
//!   [`LocalCluster`](super::LocalCluster), the in-process sequencer used by
//!   single-process deployments and tests

use async_trait::async_trait;

use super::error::BrokerResult;
use super::raft::{MetadataOp, MetadataResponse};
use crate::types::NodeId;

/// Replicates metadata operations.
#[async_trait]
pub trait MetadataCoordinator: Send + Sync {
    /// This node's id.
    fn node_id(&self) -> NodeId;

    /// Replicate `op` and return its response once it has been applied on
    /// this node.
    ///
    /// Must not be awaited from inside a topology listener.
    async fn propose(&self, op: MetadataOp) -> BrokerResult<MetadataResponse>;

    /// Current cluster members, sorted.
    async fn members(&self) -> Vec<NodeId>;

    /// Leave the cluster.
    async fn shutdown(&self) -> BrokerResult<()> {
        Ok(())
    }
}
