//! Raft consensus layer for cluster metadata.
//!
//! Replicates [`MetadataOp`]s through openraft and applies them, in log
//! order, to the [`MetadataStateMachine`] of every node.
//!
//! # Architecture
//!
//! ```text
//!   RaftCoordinator ──► RaftNode ──► openraft ──► RaftStore ──► MetadataStateMachine
//!                          │            ▲                              │
//!                          ▼            │                              ▼
//!                     RaftRpcServer ◄── transport ──► peers      TopologyListener
//! ```
//!
//! Snapshots of the topology are persisted to the object store, so a
//! restarted node restores its streams before it rejoins.

mod commands;
mod config;
mod coordinator;
pub mod domains;
mod network;
mod node;
mod state_machine;
mod storage;
mod types;

pub use commands::{MetadataOp, MetadataResponse};
pub use config::RaftConfig;
pub use coordinator::RaftCoordinator;
pub use domains::{PartitionDescriptor, StreamDescriptor, StreamDomainState};
pub use network::{
    RaftNetworkFactoryImpl, RaftRpcMessage, RaftRpcResponse, RaftRpcServer, RpcErrorInfo,
    RpcErrorKind, forward_client_write,
};
pub use node::RaftNode;
pub use state_machine::{MetadataStateMachine, TopologyEvent, TopologyListener};
pub use storage::RaftStore;
pub use types::{RaftNodeId, TypeConfig};
