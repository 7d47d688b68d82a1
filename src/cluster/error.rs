//! Broker error types.
//!
//! # Error Handling Patterns
//!
//! ## Fail-Fast (Propagate Errors)
//!
//! - Metadata proposals and stream administration
//! - Appends on the ingestion path
//! - Opening partition logs while applying a metadata operation (escalated
//!   to [`FatalError`])
//!
//! ## Best-Effort (Log and Continue)
//!
//! - Replication requests from unknown replicas
//! - Ack publishing after a successful append
//! - Retention and auto-pause background passes
//!
//! Every error converts to a caller-facing [`Status`] via
//! [`BrokerError::to_status`].

use thiserror::Error;

use crate::error::{Code, Status};
use crate::protocol::ProtocolError;
use crate::transport::TransportError;
use crate::types::{Offset, PartitionId};

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Terminal and storage errors from a partition commit log.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommitLogError {
    /// The log was deleted (partition removed).
    #[error("commit log deleted")]
    Deleted,

    /// The log was closed (partition paused or node shutting down).
    #[error("commit log closed")]
    Closed,

    /// The log is readonly: appends fail and readers at the tail stop.
    #[error("commit log is readonly")]
    Readonly,

    /// The blocking read was canceled by the caller.
    #[error("read canceled")]
    Canceled,

    /// A replicated entry does not directly follow the local tail.
    #[error("offset gap: expected {expected}, got {actual}")]
    OffsetGap { expected: Offset, actual: Offset },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt entry at offset {offset}: {message}")]
    Corrupt { offset: Offset, message: String },
}

impl From<slatedb::Error> for CommitLogError {
    fn from(e: slatedb::Error) -> Self {
        CommitLogError::Storage(e.to_string())
    }
}

impl From<object_store::Error> for CommitLogError {
    fn from(e: object_store::Error) -> Self {
        CommitLogError::Storage(e.to_string())
    }
}

/// A metadata operation could not be applied locally.
///
/// The node must stop participating: continuing would let its topology diverge
/// from the rest of the cluster.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("fatal metadata apply failure: {0}")]
pub struct FatalError(pub String);

/// Errors that can occur in the broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("partition not found: {stream}/{partition}")]
    PartitionNotFound {
        stream: String,
        partition: PartitionId,
    },

    #[error("stream already exists: {0}")]
    StreamExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("partition {stream}/{partition} is readonly")]
    Readonly {
        stream: String,
        partition: PartitionId,
    },

    #[error("partition {stream}/{partition} is paused")]
    Paused {
        stream: String,
        partition: PartitionId,
    },

    #[error("not the leader of {stream}/{partition}")]
    NotLeader {
        stream: String,
        partition: PartitionId,
    },

    #[error("commit log error: {0}")]
    CommitLog(#[from] CommitLogError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("raft error: {0}")]
    Raft(String),

    #[error("metadata proposal rejected: {0}")]
    Rejected(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Fatal(#[from] FatalError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<bincode::Error> for BrokerError {
    fn from(e: bincode::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

impl From<slatedb::Error> for BrokerError {
    fn from(e: slatedb::Error) -> Self {
        BrokerError::CommitLog(e.into())
    }
}

impl BrokerError {
    /// Map onto the caller-facing status taxonomy.
    pub fn to_status(&self) -> Status {
        let code = match self {
            BrokerError::StreamNotFound(_) | BrokerError::PartitionNotFound { .. } => {
                Code::NotFound
            }
            BrokerError::StreamExists(_) => Code::AlreadyExists,
            BrokerError::InvalidArgument(_) => Code::InvalidArgument,
            BrokerError::Readonly { .. }
            | BrokerError::Paused { .. }
            | BrokerError::NotLeader { .. } => Code::FailedPrecondition,
            BrokerError::CommitLog(CommitLogError::Deleted) => Code::NotFound,
            BrokerError::CommitLog(CommitLogError::Readonly) => Code::ResourceExhausted,
            BrokerError::CommitLog(CommitLogError::Canceled) => Code::Canceled,
            BrokerError::Transport(TransportError::Timeout { .. }) => Code::DeadlineExceeded,
            _ => Code::Internal,
        };
        Status::new(code, self.to_string())
    }

    /// Whether a retry of the same operation may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BrokerError::Transport(_) | BrokerError::Raft(_)
        )
    }
}

impl From<BrokerError> for Status {
    fn from(e: BrokerError) -> Self {
        e.to_status()
    }
}
