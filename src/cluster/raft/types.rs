//! Type definitions for the Raft consensus layer.

use openraft::BasicNode;
use std::io::Cursor;

use super::commands::{MetadataOp, MetadataResponse};

/// Node ID type for Raft nodes. Same as the broker node id.
pub type RaftNodeId = crate::types::NodeId;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = MetadataOp,
        R = MetadataResponse,
        NodeId = RaftNodeId,
        Node = BasicNode,
        SnapshotData = Cursor<Vec<u8>>,
);
