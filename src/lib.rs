//! # Logbridge
//! Durable, replicated, offset-addressable log streams layered on top of a
//! subject-based publish/subscribe transport.
//!
//! Producers publish to a stream subject and optionally wait for an
//! acknowledgment that the message was durably appended to the partition log.
//! Consumers subscribe to a partition from an arbitrary start position and keep
//! tailing it live until they cancel.
//!
//! # Architecture
//!
//! ```text
//!   producer ──► Gateway ──► transport subject ──► Partition leader ──► CommitLog
//!                                                        │    ▲
//!                                     replication inbox  │    │ pull requests
//!                                                        ▼    │
//!                                                   Follower catch-up agents
//!
//!   admin ──► Gateway ──► consensus (openraft) ──► MetadataStateMachine ──► Broker
//!                                                    (create/pause/...)     (roles)
//! ```
//!
//! - [`cluster::raft`] replicates metadata operations and feeds them, in the
//!   same order on every node, into the [`cluster::MetadataStateMachine`].
//! - [`cluster::Broker`] reacts to topology changes by opening partition logs
//!   and switching each local partition between leader and follower roles.
//! - [`cluster::ApiHandler`] is the publish/subscribe gateway.
//! - [`transport`] is the pub/sub bus; [`transport::LocalTransport`] is an
//!   in-process implementation.
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use logbridge::cluster::{ApiHandler, Broker, BrokerConfig, LocalCluster};
//! use logbridge::transport::LocalTransport;
//! use logbridge::types::{CallContext, CreateStreamRequest};
//! use object_store::memory::InMemory;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(LocalTransport::new());
//!     let store = Arc::new(InMemory::new());
//!     let cluster = LocalCluster::new();
//!     let broker = Broker::start_local(BrokerConfig::default(), transport, store, &cluster).await?;
//!     let api = ApiHandler::new(broker);
//!     api.create_stream(&CallContext::new(), CreateStreamRequest::new("orders", "orders"))
//!         .await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod error;
pub mod protocol;
pub mod types;

pub mod cluster;
pub mod constants;
pub mod telemetry;
pub mod transport;

pub mod prelude {
    //! Common imports for embedding a broker.
    pub use crate::cluster::{
        ApiHandler, Broker, BrokerConfig, BrokerError, BrokerResult, LocalCluster, RaftConfig,
    };
    pub use crate::error::{Code, Result, Status};
    pub use crate::transport::{LocalTransport, Transport};
    pub use crate::types::{
        Ack, AckPolicy, CallContext, CreateStreamRequest, Message, NodeId, Offset, PartitionId,
        PublishRequest, PublishResponse, StartPosition, StreamConfig, SubscribeRequest,
    };

    pub use bytes;
}
