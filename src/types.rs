//! Public value types exchanged with the gateway.
//!
//! These mirror the logical request/response shapes of the external API:
//! stream administration, publish (sync, fire-and-forget, async), subscribe
//! and metadata reads.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{PublishAsyncError, Status};

/// Identifier of a node (broker) in the cluster.
pub type NodeId = u64;

/// Partition identifier, unique within a stream.
pub type PartitionId = i32;

/// Log offset. `-1` means "before the first entry".
pub type Offset = i64;

/// Message headers.
pub type Headers = HashMap<String, Bytes>;

/// Current wall clock time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Current wall clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Acknowledgment policy requested by a producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckPolicy {
    /// Ack once the leader durably appended the message.
    #[default]
    Leader,
    /// Ack once the message is committed (replicated to the whole ISR).
    All,
    /// Never ack.
    None,
}

impl AckPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckPolicy::Leader => "leader",
            AckPolicy::All => "all",
            AckPolicy::None => "none",
        }
    }
}

/// Where a new subscription starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum StartPosition {
    /// Only messages appended after the subscription starts.
    #[default]
    NewOnly = 0,
    /// The given absolute offset.
    Offset = 1,
    /// The first offset whose timestamp is at or after the given timestamp.
    Timestamp = 2,
    /// The oldest retained offset.
    Earliest = 3,
    /// The newest offset.
    Latest = 4,
}

impl TryFrom<i32> for StartPosition {
    type Error = Status;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StartPosition::NewOnly),
            1 => Ok(StartPosition::Offset),
            2 => Ok(StartPosition::Timestamp),
            3 => Ok(StartPosition::Earliest),
            4 => Ok(StartPosition::Latest),
            other => Err(Status::invalid_argument(format!(
                "Unknown StartPosition {}",
                other
            ))),
        }
    }
}

/// Per-stream configuration.
///
/// Unset values fall back to broker defaults. Segment and compaction settings
/// are carried for API compatibility; the SlateDB-backed log compacts on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub retention_max_age: Option<Duration>,
    pub cleaner_interval: Option<Duration>,
    pub segment_max_bytes: Option<i64>,
    pub segment_max_age: Option<Duration>,
    pub compact_max_workers: Option<i32>,
    pub retention_max_bytes: Option<i64>,
    pub retention_max_messages: Option<i64>,
    pub compact_enabled: Option<bool>,
    /// Pause a partition after it received no messages for this long.
    pub auto_pause_time: Option<Duration>,
    /// Skip auto-pause while the partition has live subscribers.
    pub auto_pause_disable_if_subscribers: Option<bool>,
    /// Minimum ISR size required before `AckPolicy::All` publishes are acked.
    pub min_isr: Option<i32>,
}

/// A message delivered to a subscriber.
///
/// The first item on every subscription is `Message::default()`, signaling that
/// the subscription is live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub offset: Offset,
    pub key: Bytes,
    pub value: Bytes,
    /// Nanoseconds since the Unix epoch, assigned by the partition leader.
    pub timestamp: i64,
    pub stream: String,
    pub partition: PartitionId,
    /// Subject the message was originally published on.
    pub subject: String,
    /// Reply-to subject of the original publish, if any.
    pub reply_subject: Option<String>,
    pub headers: Headers,
}

impl Message {
    /// The empty frame sent when a subscription becomes live.
    pub fn is_empty_frame(&self) -> bool {
        self == &Message::default()
    }
}

/// Delivery receipt for a committed message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub stream: String,
    pub partition_subject: String,
    pub msg_subject: String,
    pub offset: Offset,
    pub ack_inbox: String,
    pub correlation_id: String,
    pub ack_policy: AckPolicy,
    /// Nanoseconds since the Unix epoch when the entry was appended.
    pub commit_timestamp: i64,
}

/// Deadline and cancellation scope for a single gateway call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
}

impl CallContext {
    /// A context with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    /// Use the given token for cancellation.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn has_deadline(&self) -> bool {
        self.deadline.is_some()
    }

    /// Time left until the deadline, zero if already expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// =============================================================================
// Administration
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateStreamRequest {
    pub subject: String,
    pub name: String,
    /// Consumer group used for the ingestion queue subscription.
    /// Defaults to the stream name.
    pub group: Option<String>,
    /// Defaults to 1 when zero.
    pub replication_factor: i32,
    /// Defaults to 1 when zero.
    pub partitions: i32,
    pub config: StreamConfig,
}

impl CreateStreamRequest {
    pub fn new(subject: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_partitions(mut self, partitions: i32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_replication_factor(mut self, replication_factor: i32) -> Self {
        self.replication_factor = replication_factor;
        self
    }

    pub fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseStreamRequest {
    pub name: String,
    /// Partitions to pause. Empty means all partitions.
    pub partitions: Vec<PartitionId>,
    /// Resume every paused partition of the stream when any one of them is
    /// published to.
    pub resume_all: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetStreamReadonlyRequest {
    pub name: String,
    /// Partitions to change. Empty means all partitions.
    pub partitions: Vec<PartitionId>,
    pub readonly: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeStreamRequest {
    pub name: String,
    /// Partitions to resume. Empty means every paused partition.
    pub partitions: Vec<PartitionId>,
}

// =============================================================================
// Publish
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub key: Bytes,
    pub value: Bytes,
    pub stream: String,
    pub partition: PartitionId,
    pub headers: Headers,
    /// Where the ack is published. A fresh inbox is used when unset.
    pub ack_inbox: Option<String>,
    pub correlation_id: String,
    pub ack_policy: AckPolicy,
}

impl PublishRequest {
    pub fn new(stream: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            stream: stream.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_partition(mut self, partition: PartitionId) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_ack_policy(mut self, ack_policy: AckPolicy) -> Self {
        self.ack_policy = ack_policy;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishToSubjectRequest {
    pub subject: String,
    pub key: Bytes,
    pub value: Bytes,
    pub headers: Headers,
    pub ack_inbox: Option<String>,
    pub correlation_id: String,
    pub ack_policy: AckPolicy,
}

/// Response of a synchronous publish. `ack` is `None` for fire-and-forget.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    pub ack: Option<Ack>,
}

/// A frame on an async publish session: either an ack or a correlated error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAsyncResponse {
    pub correlation_id: String,
    pub ack: Option<Ack>,
    pub error: Option<PublishAsyncError>,
}

// =============================================================================
// Subscribe
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub stream: String,
    pub partition: PartitionId,
    pub start_position: StartPosition,
    pub start_offset: Offset,
    /// Nanoseconds since the Unix epoch.
    pub start_timestamp: i64,
    /// Allow reading from a follower replica of the partition.
    pub read_isr_replica: bool,
    /// Resume the partition first if it is paused.
    pub resume: bool,
}

impl SubscribeRequest {
    pub fn new(stream: impl Into<String>, partition: PartitionId) -> Self {
        Self {
            stream: stream.into(),
            partition,
            ..Default::default()
        }
    }

    pub fn from_offset(mut self, offset: Offset) -> Self {
        self.start_position = StartPosition::Offset;
        self.start_offset = offset;
        self
    }

    pub fn from_timestamp(mut self, timestamp: i64) -> Self {
        self.start_position = StartPosition::Timestamp;
        self.start_timestamp = timestamp;
        self
    }

    pub fn with_start_position(mut self, position: StartPosition) -> Self {
        self.start_position = position;
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_read_isr_replica(mut self, read_isr_replica: bool) -> Self {
        self.read_isr_replica = read_isr_replica;
        self
    }
}

// =============================================================================
// Metadata
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMetadata {
    pub id: PartitionId,
    pub subject: String,
    pub leader: NodeId,
    pub replicas: Vec<NodeId>,
    pub isr: Vec<NodeId>,
    pub paused: bool,
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub name: String,
    pub subject: String,
    /// Set when a requested stream does not exist.
    pub error: Option<crate::error::Code>,
    pub partitions: BTreeMap<PartitionId, PartitionMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchMetadataResponse {
    pub nodes: Vec<NodeId>,
    pub streams: Vec<StreamMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchPartitionMetadataResponse {
    pub metadata: PartitionMetadata,
    pub high_watermark: Offset,
    pub newest_offset: Offset,
}
