//! Metadata state machine.
//!
//! Holds the replicated topology and applies operations strictly one at a
//! time. After each operation the local side effects (opening logs, switching
//! partition roles) are dispatched to a [`TopologyListener`] before the next
//! operation is applied, so every node walks through the same sequence of
//! topology states.
//!
//! A failure to apply an operation, or to materialize its side effects, is
//! fatal: the state machine refuses every later operation and publishes the
//! error on [`MetadataStateMachine::fatal_errors`] for the process supervisor.

use std::sync::Weak;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, error, info, warn};

use super::commands::{MetadataOp, MetadataResponse};
use super::domains::{PartitionDescriptor, StreamDescriptor, StreamDomainState};
use crate::cluster::error::{BrokerResult, FatalError};
use crate::cluster::metrics;
use crate::types::PartitionId;

/// A topology change the local node may have to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    StreamCreated(StreamDescriptor),
    StreamDeleted(StreamDescriptor),
    /// Flags, leader or ISR of some partitions changed.
    PartitionsChanged {
        stream: String,
        partitions: Vec<PartitionDescriptor>,
        /// Set by pause operations; the stream keeps it as its transient
        /// resume-all flag.
        resume_all: Option<bool>,
    },
    /// All topology is about to be replaced by a snapshot.
    Reset,
}

impl TopologyEvent {
    fn kind(&self) -> &'static str {
        match self {
            TopologyEvent::StreamCreated(_) => "stream_created",
            TopologyEvent::StreamDeleted(_) => "stream_deleted",
            TopologyEvent::PartitionsChanged { .. } => "partitions_changed",
            TopologyEvent::Reset => "reset",
        }
    }
}

/// Receives topology events in apply order.
///
/// Implementations must not propose metadata operations from inside
/// `on_event`: the applier is busy until the call returns.
#[async_trait]
pub trait TopologyListener: Send + Sync {
    async fn on_event(&self, event: TopologyEvent) -> BrokerResult<()>;
}

/// Serialized form of the topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetadataSnapshot {
    version: u64,
    streams: Vec<StreamDescriptor>,
}

#[derive(Debug, Default)]
struct MetadataState {
    /// Incremented on every applied operation.
    version: u64,
    streams: StreamDomainState,
}

/// The replicated topology of one node.
pub struct MetadataStateMachine {
    state: RwLock<MetadataState>,
    /// Serializes apply, restore and their side effects.
    applier: Mutex<()>,
    listener: OnceCell<Weak<dyn TopologyListener>>,
    fatal: watch::Sender<Option<FatalError>>,
}

impl Default for MetadataStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetadataStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStateMachine")
            .field("fatal", &self.fatal.borrow().is_some())
            .finish()
    }
}

impl MetadataStateMachine {
    pub fn new() -> Self {
        let (fatal, _) = watch::channel(None);
        Self {
            state: RwLock::new(MetadataState::default()),
            applier: Mutex::new(()),
            listener: OnceCell::new(),
            fatal,
        }
    }

    /// Register the listener for local side effects. Only the first call has
    /// an effect.
    pub fn set_listener(&self, listener: Weak<dyn TopologyListener>) {
        if self.listener.set(listener).is_err() {
            warn!("Topology listener already registered, ignoring");
        }
    }

    /// Fatal apply failures. Holds `Some` once the node must stop.
    pub fn fatal_errors(&self) -> watch::Receiver<Option<FatalError>> {
        self.fatal.subscribe()
    }

    pub fn fatal_error(&self) -> Option<FatalError> {
        self.fatal.borrow().clone()
    }

    pub async fn version(&self) -> u64 {
        self.state.read().await.version
    }

    /// Apply one operation and run its side effects.
    pub async fn apply(&self, op: MetadataOp) -> Result<MetadataResponse, FatalError> {
        let _applier = self.applier.lock().await;
        if let Some(err) = self.fatal_error() {
            return Err(err);
        }

        let name = op.name();
        let (response, events) = {
            let mut state = self.state.write().await;
            let applied = state.streams.apply(op).map_err(|e| self.fail(e))?;
            state.version += 1;
            applied
        };
        metrics::METADATA_APPLIED.with_label_values(&[name]).inc();
        debug!(op = name, events = events.len(), "Applied metadata operation");

        for event in events {
            self.dispatch(event).await?;
        }
        Ok(response)
    }

    /// Serialize the complete stream and partition set.
    pub async fn snapshot(&self) -> Result<Vec<u8>, FatalError> {
        let state = self.state.read().await;
        let snapshot = MetadataSnapshot {
            version: state.version,
            streams: state.streams.streams.values().cloned().collect(),
        };
        bincode::serialize(&snapshot)
            .map_err(|e| FatalError(format!("failed to serialize metadata snapshot: {}", e)))
    }

    /// Replace all topology with a snapshot.
    ///
    /// Streams are replayed through the same create path as live operations,
    /// so a restored node ends in the same state as one that applied every
    /// operation.
    pub async fn restore(&self, bytes: &[u8]) -> Result<(), FatalError> {
        let snapshot: MetadataSnapshot = bincode::deserialize(bytes)
            .map_err(|e| self.fail(FatalError(format!("malformed metadata snapshot: {}", e))))?;

        let _applier = self.applier.lock().await;
        if let Some(err) = self.fatal_error() {
            return Err(err);
        }

        *self.state.write().await = MetadataState::default();
        self.dispatch(TopologyEvent::Reset).await?;

        let count = snapshot.streams.len();
        for stream in snapshot.streams {
            let events = {
                let mut state = self.state.write().await;
                let (_, events) = state
                    .streams
                    .apply(MetadataOp::CreateStream { stream })
                    .map_err(|e| self.fail(e))?;
                events
            };
            for event in events {
                self.dispatch(event).await?;
            }
        }
        self.state.write().await.version = snapshot.version;
        info!(streams = count, version = snapshot.version, "Restored metadata snapshot");
        Ok(())
    }

    pub async fn streams(&self) -> Vec<StreamDescriptor> {
        self.state
            .read()
            .await
            .streams
            .streams
            .values()
            .cloned()
            .collect()
    }

    pub async fn stream(&self, name: &str) -> Option<StreamDescriptor> {
        self.state.read().await.streams.stream(name).cloned()
    }

    pub async fn partition(&self, stream: &str, id: PartitionId) -> Option<PartitionDescriptor> {
        self.state.read().await.streams.partition(stream, id).cloned()
    }

    async fn dispatch(&self, event: TopologyEvent) -> Result<(), FatalError> {
        let Some(listener) = self.listener.get().and_then(Weak::upgrade) else {
            return Ok(());
        };
        let kind = event.kind();
        listener.on_event(event).await.map_err(|e| {
            self.fail(FatalError(format!(
                "failed to apply {} locally: {}",
                kind, e
            )))
        })
    }

    fn fail(&self, err: FatalError) -> FatalError {
        error!(error = %err, "Metadata state machine failed, node must stop");
        metrics::METADATA_FATAL.inc();
        self.fatal.send_replace(Some(err.clone()));
        err
    }
}
