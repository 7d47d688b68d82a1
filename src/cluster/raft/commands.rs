//! Metadata operations and their responses.
//!
//! Operations are the inputs to the metadata state machine. They are replicated
//! through consensus and applied in the same order on every node.

use serde::{Deserialize, Serialize};

use super::domains::stream::{PartitionDescriptor, StreamDescriptor};
use crate::types::{NodeId, PartitionId};

/// An operation on the cluster topology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MetadataOp {
    /// No-op (used by the consensus engine for leader commits).
    Noop,

    /// Create a stream with fully assigned partitions.
    CreateStream { stream: StreamDescriptor },

    DeleteStream { name: String },

    /// Pause partitions. An empty list means every partition of the stream.
    PausePartitions {
        stream: String,
        partitions: Vec<PartitionId>,
        resume_all: bool,
    },

    /// Change the readonly flag. An empty list means every partition.
    SetReadonly {
        stream: String,
        partitions: Vec<PartitionId>,
        readonly: bool,
    },

    /// Resume paused partitions. An empty list means every paused partition.
    ResumePartitions {
        stream: String,
        partitions: Vec<PartitionId>,
    },

    /// Record a new leader for a partition. Bumps the leader epoch.
    ChangeLeader {
        stream: String,
        partition: PartitionId,
        leader: NodeId,
    },

    /// Remove a lagging replica from the ISR.
    ShrinkIsr {
        stream: String,
        partition: PartitionId,
        replica: NodeId,
        leader_epoch: u64,
    },

    /// Add a caught up replica to the ISR.
    ExpandIsr {
        stream: String,
        partition: PartitionId,
        replica: NodeId,
        leader_epoch: u64,
    },
}

impl MetadataOp {
    /// Short name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            MetadataOp::Noop => "noop",
            MetadataOp::CreateStream { .. } => "create_stream",
            MetadataOp::DeleteStream { .. } => "delete_stream",
            MetadataOp::PausePartitions { .. } => "pause_partitions",
            MetadataOp::SetReadonly { .. } => "set_readonly",
            MetadataOp::ResumePartitions { .. } => "resume_partitions",
            MetadataOp::ChangeLeader { .. } => "change_leader",
            MetadataOp::ShrinkIsr { .. } => "shrink_isr",
            MetadataOp::ExpandIsr { .. } => "expand_isr",
        }
    }
}

/// Result of applying a [`MetadataOp`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MetadataResponse {
    Ok,

    StreamCreated { name: String },

    /// A stream with the same name already exists; nothing changed.
    StreamExists { name: String },

    StreamDeleted { name: String },

    /// Partitions whose flags changed, in their new state.
    PartitionsUpdated {
        stream: String,
        partitions: Vec<PartitionDescriptor>,
    },

    LeaderChanged {
        stream: String,
        partition: PartitionId,
        leader: NodeId,
        epoch: u64,
    },

    IsrUpdated {
        stream: String,
        partition: PartitionId,
        isr: Vec<NodeId>,
    },

    NotFound {
        stream: String,
        partition: Option<PartitionId>,
    },

    /// The operation was valid but does not apply to the current state
    /// (stale epoch, replica outside the replica set).
    Rejected { reason: String },
}
