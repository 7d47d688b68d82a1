//! Node runtime.
//!
//! A [`Broker`] owns everything one node runs: the metadata state machine,
//! the coordinator that replicates metadata operations, and the registry of
//! local partition replicas. It is the state machine's [`TopologyListener`]:
//! every applied operation is turned into local side effects (opening logs,
//! switching partition roles, deleting data) before the next one is applied.
//!
//! # Background work
//!
//! A monitor runs every `auto_pause_check_interval` and, for partitions led
//! by this node, proposes
//! - `ShrinkIsr` for followers that have not caught up within
//!   `replica_max_lag_time`
//! - `PausePartitions` for partitions idle past their stream's
//!   `auto_pause_time`

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use object_store::ObjectStore;
use once_cell::sync::OnceCell;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::BrokerConfig;
use super::error::{BrokerError, BrokerResult, FatalError};
use super::local_cluster::LocalCluster;
use super::partition::Partition;
use super::raft::{
    MetadataOp, MetadataResponse, MetadataStateMachine, PartitionDescriptor, RaftCoordinator,
    RaftNode, StreamDescriptor, TopologyEvent, TopologyListener,
};
use super::traits::MetadataCoordinator;
use crate::transport::Transport;
use crate::types::{NodeId, PartitionId};

/// Shared by a broker and all of its partitions.
pub(crate) struct NodeContext {
    pub node_id: NodeId,
    pub config: BrokerConfig,
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn ObjectStore>,
    coordinator: OnceCell<Arc<dyn MetadataCoordinator>>,
}

impl NodeContext {
    fn new(config: BrokerConfig, transport: Arc<dyn Transport>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            node_id: config.node_id,
            config,
            transport,
            store,
            coordinator: OnceCell::new(),
        }
    }

    fn set_coordinator(&self, coordinator: Arc<dyn MetadataCoordinator>) {
        if self.coordinator.set(coordinator).is_err() {
            warn!(node_id = self.node_id, "Coordinator already set, ignoring");
        }
    }

    pub fn coordinator(&self) -> BrokerResult<&Arc<dyn MetadataCoordinator>> {
        self.coordinator
            .get()
            .ok_or_else(|| BrokerError::Internal("broker has no coordinator".to_string()))
    }

    pub async fn propose(&self, op: MetadataOp) -> BrokerResult<MetadataResponse> {
        self.coordinator()?.propose(op).await
    }

    /// Propose from a background task, logging the outcome.
    pub async fn propose_logged(&self, op: MetadataOp) {
        let name = op.name();
        match self.propose(op).await {
            Ok(MetadataResponse::Rejected { reason }) => {
                debug!(node_id = self.node_id, op = name, reason = %reason, "Proposal rejected")
            }
            Ok(response) => {
                debug!(node_id = self.node_id, op = name, ?response, "Proposal applied")
            }
            Err(e) => warn!(node_id = self.node_id, op = name, error = %e, "Proposal failed"),
        }
    }
}

/// One broker node.
pub struct Broker {
    ctx: Arc<NodeContext>,
    metadata: Arc<MetadataStateMachine>,
    partitions: DashMap<(String, PartitionId), Arc<Partition>>,
    /// Transient per-stream resume-all flags set by pause operations.
    resume_all: DashMap<String, bool>,
    raft: OnceCell<Arc<RaftNode>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("node_id", &self.ctx.node_id)
            .field("partitions", &self.partitions.len())
            .finish()
    }
}

impl Broker {
    fn build(
        config: BrokerConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ObjectStore>,
    ) -> BrokerResult<Arc<Self>> {
        config
            .validate()
            .map_err(|errors| BrokerError::Config(errors.join(", ")))?;

        let metadata = Arc::new(MetadataStateMachine::new());
        let broker = Arc::new(Self {
            ctx: Arc::new(NodeContext::new(config, transport, store)),
            metadata,
            partitions: DashMap::new(),
            resume_all: DashMap::new(),
            raft: OnceCell::new(),
            shutdown: CancellationToken::new(),
        });
        let listener: Weak<Broker> = Arc::downgrade(&broker);
        let listener: Weak<dyn TopologyListener> = listener;
        broker.metadata.set_listener(listener);
        Ok(broker)
    }

    /// Start a node that sequences metadata through an in-process
    /// [`LocalCluster`].
    pub async fn start_local(
        config: BrokerConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ObjectStore>,
        cluster: &LocalCluster,
    ) -> BrokerResult<Arc<Self>> {
        let broker = Self::build(config, transport, store)?;
        let node_id = broker.node_id();
        broker
            .ctx
            .set_coordinator(Arc::new(cluster.coordinator(node_id)));
        cluster.join(node_id, broker.metadata.clone()).await?;
        broker.spawn_monitor();
        info!(node_id, "Broker started with local coordination");
        Ok(broker)
    }

    /// Start a node that replicates metadata through Raft.
    ///
    /// With `bootstrap`, an uninitialized node initializes the cluster with
    /// the configured initial members.
    pub async fn start_raft(
        config: BrokerConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ObjectStore>,
        bootstrap: bool,
    ) -> BrokerResult<Arc<Self>> {
        let broker = Self::build(config.clone(), transport.clone(), store.clone())?;
        let node = Arc::new(
            RaftNode::new(
                config.node_id,
                &config.namespace,
                config.raft.clone(),
                broker.metadata.clone(),
                transport,
                store,
                &config.snapshot_path(),
            )
            .await?,
        );
        if bootstrap && !node.is_initialized() {
            node.initialize_cluster().await?;
        }
        broker
            .ctx
            .set_coordinator(Arc::new(RaftCoordinator::new(node.clone())));
        broker.attach_raft(node)?;
        broker.spawn_monitor();
        info!(node_id = config.node_id, bootstrap, "Broker started with raft coordination");
        Ok(broker)
    }

    fn attach_raft(&self, node: Arc<RaftNode>) -> BrokerResult<()> {
        self.raft.set(node).map_err(|_| {
            warn!(node_id = self.node_id(), "Raft node already attached");
            BrokerError::Internal(format!("raft node {} started twice", self.node_id()))
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.ctx.node_id
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.ctx.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.ctx.transport
    }

    pub fn metadata(&self) -> &Arc<MetadataStateMachine> {
        &self.metadata
    }

    pub fn coordinator(&self) -> BrokerResult<&Arc<dyn MetadataCoordinator>> {
        self.ctx.coordinator()
    }

    /// The Raft node, when started with [`Broker::start_raft`].
    pub fn raft(&self) -> Option<&Arc<RaftNode>> {
        self.raft.get()
    }

    /// Fatal metadata failures. Holds `Some` once this node must stop.
    pub fn fatal_errors(&self) -> watch::Receiver<Option<FatalError>> {
        self.metadata.fatal_errors()
    }

    pub async fn propose(&self, op: MetadataOp) -> BrokerResult<MetadataResponse> {
        self.ctx.propose(op).await
    }

    /// The local replica of a partition, if this node holds one.
    pub fn partition(&self, stream: &str, id: PartitionId) -> Option<Arc<Partition>> {
        self.partitions
            .get(&(stream.to_string(), id))
            .map(|p| p.value().clone())
    }

    pub fn partitions(&self) -> Vec<Arc<Partition>> {
        self.partitions.iter().map(|p| p.value().clone()).collect()
    }

    /// Whether a publish or resuming subscribe should resume every paused
    /// partition of the stream.
    pub fn resume_all(&self, stream: &str) -> bool {
        self.resume_all.get(stream).is_some_and(|all| *all)
    }

    /// Clear the stream's resume-all flag once the resume went through.
    pub fn clear_resume_all(&self, stream: &str) {
        self.resume_all.remove(stream);
    }

    /// Leave the cluster and stop every local partition. Partition data is
    /// kept.
    pub async fn shutdown(&self) -> BrokerResult<()> {
        self.shutdown.cancel();
        if let Ok(coordinator) = self.ctx.coordinator()
            && let Err(e) = coordinator.shutdown().await
        {
            warn!(node_id = self.node_id(), error = %e, "Coordinator shutdown failed");
        }
        for partition in self.partitions() {
            partition.shutdown().await?;
        }
        self.partitions.clear();
        info!(node_id = self.node_id(), "Broker stopped");
        Ok(())
    }

    // ========================================================================
    // Topology
    // ========================================================================

    async fn on_stream_created(&self, stream: StreamDescriptor) -> BrokerResult<()> {
        let node_id = self.node_id();
        for desc in stream.partitions.values() {
            if !desc.is_replica(node_id) {
                continue;
            }
            let partition = self
                .partitions
                .entry((stream.name.clone(), desc.id))
                .or_insert_with(|| Partition::new(self.ctx.clone(), &stream, desc.clone()))
                .clone();
            partition.reconcile(desc.clone()).await?;
        }
        debug!(node_id, stream = %stream.name, "Stream materialized");
        Ok(())
    }

    async fn on_stream_deleted(&self, stream: StreamDescriptor) -> BrokerResult<()> {
        self.resume_all.remove(&stream.name);
        for id in stream.partitions.keys() {
            if let Some((_, partition)) = self.partitions.remove(&(stream.name.clone(), *id)) {
                partition.delete().await?;
            }
        }
        Ok(())
    }

    async fn on_partitions_changed(
        &self,
        stream: String,
        partitions: Vec<PartitionDescriptor>,
        resume_all: Option<bool>,
    ) -> BrokerResult<()> {
        if let Some(all) = resume_all {
            self.resume_all.insert(stream.clone(), all);
        }
        for desc in partitions {
            if let Some(partition) = self.partition(&stream, desc.id) {
                partition.reconcile(desc).await?;
            }
        }
        Ok(())
    }

    async fn on_reset(&self) -> BrokerResult<()> {
        let partitions = self.partitions();
        self.partitions.clear();
        self.resume_all.clear();
        for partition in partitions {
            partition.shutdown().await?;
        }
        info!(node_id = self.node_id(), "Local topology reset");
        Ok(())
    }

    // ========================================================================
    // Monitor
    // ========================================================================

    fn spawn_monitor(self: &Arc<Self>) {
        let broker = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.ctx.config.auto_pause_check_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(broker) = broker.upgrade() else {
                    break;
                };
                broker.check_partitions().await;
            }
        });
    }

    async fn check_partitions(&self) {
        for partition in self.partitions() {
            let mut ops = partition.lagging_followers().await;
            ops.extend(partition.auto_pause_candidate().await);
            for op in ops {
                self.ctx.propose_logged(op).await;
            }
        }
    }
}

#[async_trait]
impl TopologyListener for Broker {
    async fn on_event(&self, event: TopologyEvent) -> BrokerResult<()> {
        match event {
            TopologyEvent::StreamCreated(stream) => self.on_stream_created(stream).await,
            TopologyEvent::StreamDeleted(stream) => self.on_stream_deleted(stream).await,
            TopologyEvent::PartitionsChanged {
                stream,
                partitions,
                resume_all,
            } => {
                self.on_partitions_changed(stream, partitions, resume_all)
                    .await
            }
            TopologyEvent::Reset => self.on_reset().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::raft::domains::stream::tests::descriptor;
    use crate::transport::LocalTransport;
    use object_store::memory::InMemory;

    async fn start(node_id: NodeId, cluster: &LocalCluster) -> Arc<Broker> {
        Broker::start_local(
            BrokerConfig::default().with_node_id(node_id),
            Arc::new(LocalTransport::new()),
            Arc::new(InMemory::new()),
            cluster,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let err = Broker::start_local(
            BrokerConfig::default().with_namespace(""),
            Arc::new(LocalTransport::new()),
            Arc::new(InMemory::new()),
            &LocalCluster::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BrokerError::Config(_)));
    }

    #[tokio::test]
    async fn test_only_replicas_materialize_partitions() {
        let cluster = LocalCluster::new();
        let broker = start(1, &cluster).await;

        let mut stream = descriptor("orders", 2, &[1]);
        if let Some(p) = stream.partitions.get_mut(&1) {
            p.replicas = vec![7];
            p.leader = 7;
            p.isr = vec![7];
        }
        broker
            .propose(MetadataOp::CreateStream { stream })
            .await
            .unwrap();

        let local = broker.partition("orders", 0).unwrap();
        assert!(local.is_leader().await);
        assert_eq!(local.role_name().await, "leader");
        assert!(broker.partition("orders", 1).is_none());
    }

    #[tokio::test]
    async fn test_pause_stores_resume_all_flag() {
        let cluster = LocalCluster::new();
        let broker = start(1, &cluster).await;
        broker
            .propose(MetadataOp::CreateStream {
                stream: descriptor("orders", 1, &[1]),
            })
            .await
            .unwrap();
        broker
            .propose(MetadataOp::PausePartitions {
                stream: "orders".to_string(),
                partitions: vec![],
                resume_all: true,
            })
            .await
            .unwrap();

        let partition = broker.partition("orders", 0).unwrap();
        assert!(partition.is_paused().await);
        assert!(partition.log().await.is_none());
        assert!(broker.resume_all("orders"));
        assert!(broker.resume_all("orders"));
        broker.clear_resume_all("orders");
        assert!(!broker.resume_all("orders"));
    }

    #[tokio::test]
    async fn test_delete_removes_partitions() {
        let cluster = LocalCluster::new();
        let broker = start(1, &cluster).await;
        broker
            .propose(MetadataOp::CreateStream {
                stream: descriptor("orders", 2, &[1]),
            })
            .await
            .unwrap();
        assert_eq!(broker.partitions().len(), 2);

        broker
            .propose(MetadataOp::DeleteStream {
                name: "orders".to_string(),
            })
            .await
            .unwrap();
        assert!(broker.partitions().is_empty());
    }

    #[tokio::test]
    async fn test_raft_node_attached_once() {
        let broker = Broker::start_raft(
            BrokerConfig::default().with_node_id(1),
            Arc::new(LocalTransport::new()),
            Arc::new(InMemory::new()),
            false,
        )
        .await
        .unwrap();
        let node = broker.raft().unwrap().clone();

        let err = broker.attach_raft(node.clone()).unwrap_err();
        assert!(matches!(err, BrokerError::Internal(_)));
        assert!(Arc::ptr_eq(broker.raft().unwrap(), &node));
        broker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_leaves_cluster() {
        let cluster = LocalCluster::new();
        let broker = start(1, &cluster).await;
        assert_eq!(cluster.members().await, vec![1]);
        broker.shutdown().await.unwrap();
        assert!(cluster.members().await.is_empty());
        assert!(broker.propose(MetadataOp::Noop).await.is_err());
    }
}
