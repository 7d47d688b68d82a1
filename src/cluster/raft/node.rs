//! Raft node wrapper providing a simpler interface.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use object_store::ObjectStore;
use openraft::storage::Adaptor;
use openraft::{BasicNode, Raft};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::commands::{MetadataOp, MetadataResponse};
use super::config::RaftConfig;
use super::network::{RaftNetworkFactoryImpl, RaftRpcServer, forward_client_write};
use super::state_machine::MetadataStateMachine;
use super::storage::RaftStore;
use super::types::{RaftNodeId, TypeConfig};
use crate::cluster::error::{BrokerError, BrokerResult};
use crate::cluster::metrics;
use crate::protocol::raft_subject;
use crate::transport::Transport;

/// A Raft node replicating metadata operations.
pub struct RaftNode {
    raft: Arc<Raft<TypeConfig>>,
    state_machine: Arc<MetadataStateMachine>,
    transport: Arc<dyn Transport>,
    node_id: RaftNodeId,
    namespace: String,
    config: RaftConfig,
    shutdown: CancellationToken,
    /// Limits proposals in flight.
    proposal_semaphore: Arc<Semaphore>,
}

impl RaftNode {
    /// Create and start a Raft node.
    ///
    /// Restores the latest snapshot under `snapshot_prefix` into
    /// `state_machine` before joining, then serves RPCs on the node's raft
    /// subject.
    pub async fn new(
        node_id: RaftNodeId,
        namespace: &str,
        config: RaftConfig,
        state_machine: Arc<MetadataStateMachine>,
        transport: Arc<dyn Transport>,
        object_store: Arc<dyn ObjectStore>,
        snapshot_prefix: &str,
    ) -> BrokerResult<Self> {
        if let Err(errors) = config.validate() {
            return Err(BrokerError::Config(format!(
                "invalid raft config: {}",
                errors.join(", ")
            )));
        }

        let store = RaftStore::new(state_machine.clone(), object_store, snapshot_prefix);
        match store.load_snapshot_from_store().await {
            Ok(true) => info!(node_id, "Restored metadata from snapshot"),
            Ok(false) => info!(node_id, "No existing snapshot found, starting fresh"),
            Err(e) => {
                warn!(node_id, error = %e, "Failed to load snapshot, starting with empty state")
            }
        }

        let network = RaftNetworkFactoryImpl::new(transport.clone(), config.rpc_timeout);
        let (log_store, sm_store) = Adaptor::new(store);
        let raft = Raft::new(
            node_id,
            Arc::new(config.to_openraft_config()),
            network,
            log_store,
            sm_store,
        )
        .await
        .map_err(|e| BrokerError::Raft(format!("failed to create raft node: {}", e)))?;
        let raft = Arc::new(raft);

        let shutdown = CancellationToken::new();
        let subject = raft_subject(namespace, node_id);
        let server = RaftRpcServer::new(raft.clone(), transport.clone(), subject.clone());
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(server_shutdown).await {
                error!(error = %e, "Raft RPC server error");
            }
        });

        info!(node_id, subject = %subject, snapshot_path = snapshot_prefix, "Raft node started");

        Ok(Self {
            raft,
            state_machine,
            transport,
            node_id,
            namespace: namespace.to_string(),
            proposal_semaphore: Arc::new(Semaphore::new(config.max_pending_proposals)),
            config,
            shutdown,
        })
    }

    fn node(&self, id: RaftNodeId) -> BasicNode {
        BasicNode {
            addr: raft_subject(&self.namespace, id),
        }
    }

    /// Bootstrap the cluster with the configured initial members, or with
    /// this node alone when none are configured.
    pub async fn initialize_cluster(&self) -> BrokerResult<()> {
        let mut members = BTreeMap::new();
        members.insert(self.node_id, self.node(self.node_id));
        for id in &self.config.initial_members {
            members.insert(*id, self.node(*id));
        }
        let count = members.len();

        self.raft
            .initialize(members)
            .await
            .map_err(|e| BrokerError::Raft(format!("failed to initialize cluster: {}", e)))?;

        info!(node_id = self.node_id, members = count, "Cluster initialized");
        Ok(())
    }

    /// Add a node as a learner. Waits until it has caught up.
    pub async fn add_learner(&self, node_id: RaftNodeId) -> BrokerResult<()> {
        self.raft
            .add_learner(node_id, self.node(node_id), true)
            .await
            .map_err(|e| BrokerError::Raft(format!("failed to add learner: {}", e)))?;
        info!(node_id, "Added learner to cluster");
        Ok(())
    }

    /// Replace the voter set.
    pub async fn change_membership(
        &self,
        members: impl IntoIterator<Item = RaftNodeId>,
    ) -> BrokerResult<()> {
        let members: BTreeSet<_> = members.into_iter().collect();
        self.raft
            .change_membership(members.clone(), false)
            .await
            .map_err(|e| BrokerError::Raft(format!("failed to change membership: {}", e)))?;
        info!(voters = ?members, "Membership changed");
        Ok(())
    }

    /// Replicate an operation and return its response once applied.
    ///
    /// Waits up to `proposal_timeout` for a backpressure slot. A non-leader
    /// forwards the write to the current leader.
    pub async fn write(&self, op: MetadataOp) -> BrokerResult<MetadataResponse> {
        let _permit = match timeout(self.config.proposal_timeout, self.proposal_semaphore.acquire())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(BrokerError::Raft("proposal semaphore closed".to_string()));
            }
            Err(_) => {
                metrics::record_proposal("backpressure_timeout", 0.0);
                return Err(BrokerError::Raft(format!(
                    "proposal backpressure timeout: {} proposals pending",
                    self.config.max_pending_proposals
                )));
            }
        };

        let start = Instant::now();
        let result = self.raft.client_write(op.clone()).await;
        let status = if result.is_ok() { "success" } else { "error" };
        metrics::record_proposal(status, start.elapsed().as_secs_f64());

        match result {
            Ok(response) => Ok(response.data),
            Err(e) => {
                let message = e.to_string();
                if !message.contains("forward") && !message.contains("ForwardToLeader") {
                    return Err(BrokerError::Raft(format!("raft write failed: {}", message)));
                }
                let (term, leader) = {
                    let metrics = self.raft.metrics();
                    let m = metrics.borrow();
                    (m.current_term, m.current_leader)
                };
                let Some(leader) = leader.filter(|l| *l != self.node_id) else {
                    return Err(BrokerError::Raft(format!("no raft leader: {}", message)));
                };
                debug!(node_id = self.node_id, leader, term, "Forwarding write to leader");
                forward_client_write(
                    &self.transport,
                    &raft_subject(&self.namespace, leader),
                    op,
                    term,
                    0,
                    self.config.proposal_timeout,
                )
                .await
            }
        }
    }

    pub fn current_leader(&self) -> Option<RaftNodeId> {
        self.raft.metrics().borrow().current_leader
    }

    pub fn is_leader(&self) -> bool {
        self.current_leader() == Some(self.node_id)
    }

    /// Voting and learning members of the current membership.
    pub fn members(&self) -> Vec<RaftNodeId> {
        let metrics = self.raft.metrics();
        let m = metrics.borrow();
        m.membership_config.membership().nodes().map(|(id, _)| *id).collect()
    }

    pub fn is_initialized(&self) -> bool {
        let metrics = self.raft.metrics();
        let m = metrics.borrow();
        m.membership_config.membership().voter_ids().next().is_some()
    }

    pub fn state_machine(&self) -> Arc<MetadataStateMachine> {
        self.state_machine.clone()
    }

    pub fn node_id(&self) -> RaftNodeId {
        self.node_id
    }

    pub fn pending_proposals(&self) -> usize {
        self.config.max_pending_proposals - self.proposal_semaphore.available_permits()
    }

    pub async fn shutdown(&self) -> BrokerResult<()> {
        self.shutdown.cancel();
        self.raft
            .shutdown()
            .await
            .map_err(|e| BrokerError::Raft(format!("failed to shut down raft: {}", e)))?;
        info!(node_id = self.node_id, "Raft node shut down");
        Ok(())
    }
}
