//! Replicated log broker.
//!
//! Every node runs one [`Broker`]. Topology (streams, partition replica sets,
//! leaders, ISR, pause and readonly flags) lives in the replicated
//! [`MetadataStateMachine`]; partition data lives in per-partition
//! [`CommitLog`]s backed by SlateDB on an object store.
//!
//! # Architecture
//!
//! ```text
//!                ┌──────────────┐
//!                │  ApiHandler  │  publish / subscribe / admin
//!                └──────┬───────┘
//!          admin ops    │    messages on partition subjects
//!        ┌──────────────┴───────────────┐
//!        ▼                              ▼
//!  ┌────────────┐               ┌──────────────┐
//!  │ consensus  │               │  Transport   │
//!  └─────┬──────┘               └──────┬───────┘
//!        ▼                             ▼
//!  ┌────────────────────┐       ┌──────────────┐   replicate   ┌──────────────┐
//!  │MetadataStateMachine│──────►│  Partition   │◄─────────────►│  Partition   │
//!  └────────────────────┘ roles │   (leader)   │               │  (follower)  │
//!                               └──────┬───────┘               └──────┬───────┘
//!                                      ▼                              ▼
//!                                 CommitLog                      CommitLog
//! ```
//!
//! Consensus is either openraft ([`RaftCoordinator`]) or, for single-process
//! deployments and tests, the in-process [`LocalCluster`] sequencer.

mod broker;
mod catchup;
pub mod commit_log;
mod config;
mod error;
mod handler;
mod keys;
mod local_cluster;
pub mod metrics;
mod partition;
mod partition_state;
pub mod raft;
mod replicator;
pub mod retry;
mod subscription;
mod traits;

pub use broker::Broker;
pub use catchup::CatchUpAgent;
pub use commit_log::{CommitLog, CommitLogOptions, CommitLogResult, RetentionPolicy};
pub use config::BrokerConfig;
pub use error::{BrokerError, BrokerResult, CommitLogError, FatalError};
pub use handler::ApiHandler;
pub use local_cluster::{LocalCluster, LocalCoordinator};
pub use partition::Partition;
pub use partition_state::PartitionRole;
pub use raft::{
    MetadataOp, MetadataResponse, MetadataStateMachine, PartitionDescriptor, RaftConfig,
    RaftCoordinator, RaftNode, StreamDescriptor, TopologyEvent,
};
pub use subscription::MessageStream;
pub use traits::MetadataCoordinator;
