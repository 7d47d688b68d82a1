//! In-process metadata sequencer.
//!
//! A [`LocalCluster`] stands in for the consensus engine when every node runs
//! in one process: proposals are serialized by a single lock and applied to
//! every registered state machine in the same order. Operations are kept in
//! a log so that a node joining later replays the full history first.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::error::{BrokerError, BrokerResult};
use super::raft::{MetadataOp, MetadataResponse, MetadataStateMachine};
use super::traits::MetadataCoordinator;
use crate::types::NodeId;

#[derive(Default)]
struct Sequencer {
    /// Every operation applied so far, in order.
    log: Vec<MetadataOp>,
    nodes: BTreeMap<NodeId, Weak<MetadataStateMachine>>,
}

/// Shared total-order sequencer. Clones refer to the same cluster.
#[derive(Clone, Default)]
pub struct LocalCluster {
    sequencer: Arc<Mutex<Sequencer>>,
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCluster").finish_non_exhaustive()
    }
}

impl LocalCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle used by `node_id` to propose. Proposals fail until the node
    /// has joined.
    pub fn coordinator(&self, node_id: NodeId) -> LocalCoordinator {
        LocalCoordinator {
            node_id,
            cluster: self.clone(),
        }
    }

    /// Register a node. Replays every earlier operation into `sm` before the
    /// node sees new ones.
    pub async fn join(&self, node_id: NodeId, sm: Arc<MetadataStateMachine>) -> BrokerResult<()> {
        let mut sequencer = self.sequencer.lock().await;
        if let Some(existing) = sequencer.nodes.get(&node_id)
            && existing.strong_count() > 0
        {
            return Err(BrokerError::Config(format!(
                "node {} already joined the local cluster",
                node_id
            )));
        }
        for op in sequencer.log.clone() {
            sm.apply(op).await?;
        }
        sequencer.nodes.insert(node_id, Arc::downgrade(&sm));
        info!(node_id, replayed = sequencer.log.len(), "Node joined local cluster");
        Ok(())
    }

    /// Live members, sorted.
    pub async fn members(&self) -> Vec<NodeId> {
        let sequencer = self.sequencer.lock().await;
        sequencer
            .nodes
            .iter()
            .filter(|(_, sm)| sm.strong_count() > 0)
            .map(|(id, _)| *id)
            .collect()
    }

    async fn leave(&self, node_id: NodeId) {
        self.sequencer.lock().await.nodes.remove(&node_id);
        info!(node_id, "Node left local cluster");
    }

    async fn propose(&self, from: NodeId, op: MetadataOp) -> BrokerResult<MetadataResponse> {
        let mut sequencer = self.sequencer.lock().await;
        sequencer.nodes.retain(|_, sm| sm.strong_count() > 0);
        if !sequencer.nodes.contains_key(&from) {
            return Err(BrokerError::Raft(format!(
                "node {} is not a member of the cluster",
                from
            )));
        }

        let name = op.name();
        sequencer.log.push(op.clone());
        let nodes: Vec<_> = sequencer
            .nodes
            .iter()
            .filter_map(|(id, sm)| sm.upgrade().map(|sm| (*id, sm)))
            .collect();

        let mut own = None;
        for (id, sm) in nodes {
            let result = sm.apply(op.clone()).await;
            if let Err(e) = &result {
                error!(node_id = id, op = name, error = %e, "Node failed to apply operation");
            }
            if id == from {
                own = Some(result);
            }
        }
        debug!(op = name, index = sequencer.log.len(), "Sequenced metadata operation");

        match own {
            Some(result) => Ok(result?),
            None => Err(BrokerError::Raft(format!("node {} left during proposal", from))),
        }
    }
}

/// One node's handle on a [`LocalCluster`].
#[derive(Clone, Debug)]
pub struct LocalCoordinator {
    node_id: NodeId,
    cluster: LocalCluster,
}

#[async_trait]
impl MetadataCoordinator for LocalCoordinator {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    async fn propose(&self, op: MetadataOp) -> BrokerResult<MetadataResponse> {
        self.cluster.propose(self.node_id, op).await
    }

    async fn members(&self) -> Vec<NodeId> {
        self.cluster.members().await
    }

    async fn shutdown(&self) -> BrokerResult<()> {
        self.cluster.leave(self.node_id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::raft::domains::stream::tests::descriptor;

    #[tokio::test]
    async fn test_all_nodes_converge() {
        let cluster = LocalCluster::new();
        let a = Arc::new(MetadataStateMachine::new());
        let b = Arc::new(MetadataStateMachine::new());
        cluster.join(1, a.clone()).await.unwrap();
        cluster.join(2, b.clone()).await.unwrap();
        let ca = cluster.coordinator(1);

        let resp = ca
            .propose(MetadataOp::CreateStream {
                stream: descriptor("orders", 2, &[1, 2]),
            })
            .await
            .unwrap();
        assert!(matches!(resp, MetadataResponse::StreamCreated { .. }));
        assert_eq!(a.streams().await, b.streams().await);
        assert_eq!(cluster.members().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_late_joiner_replays_history() {
        let cluster = LocalCluster::new();
        let a = Arc::new(MetadataStateMachine::new());
        cluster.join(1, a.clone()).await.unwrap();
        let ca = cluster.coordinator(1);
        ca.propose(MetadataOp::CreateStream {
            stream: descriptor("orders", 1, &[1]),
        })
        .await
        .unwrap();

        let b = Arc::new(MetadataStateMachine::new());
        cluster.join(2, b.clone()).await.unwrap();
        assert!(b.stream("orders").await.is_some());
    }

    #[tokio::test]
    async fn test_propose_before_join_fails() {
        let cluster = LocalCluster::new();
        let err = cluster.coordinator(7).propose(MetadataOp::Noop).await.unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_duplicate_join_rejected() {
        let cluster = LocalCluster::new();
        let a = Arc::new(MetadataStateMachine::new());
        cluster.join(1, a.clone()).await.unwrap();
        assert!(cluster.join(1, a).await.is_err());
    }

    #[tokio::test]
    async fn test_left_node_cannot_propose() {
        let cluster = LocalCluster::new();
        let a = Arc::new(MetadataStateMachine::new());
        cluster.join(1, a.clone()).await.unwrap();
        let ca = cluster.coordinator(1);
        ca.shutdown().await.unwrap();
        assert!(ca.propose(MetadataOp::Noop).await.is_err());
        assert!(cluster.members().await.is_empty());
    }
}
