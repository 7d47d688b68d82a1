//! Centralized defaults and limits.
//!
//! # Categories
//!
//! - **Stream Defaults**: values applied to incomplete create requests
//! - **Replication**: catch-up pacing and ISR bookkeeping
//! - **Channels**: bounded queue sizes between tasks
//! - **Storage**: commit log write behavior

use std::time::Duration;

// =============================================================================
// Stream Defaults
// =============================================================================

/// Replication factor used when a create request leaves it at zero.
pub const DEFAULT_REPLICATION_FACTOR: i32 = 1;

/// Partition count used when a create request leaves it at zero.
pub const DEFAULT_PARTITIONS: i32 = 1;

/// Upper bound on partitions per stream.
pub const MAX_PARTITIONS_PER_STREAM: i32 = 1024;

/// Header recording the subject a message was published on.
pub const SUBJECT_HEADER: &str = "subject";

/// Header recording the reply-to subject of the original publish.
pub const REPLY_HEADER: &str = "reply";

// =============================================================================
// Replication
// =============================================================================

/// How long a follower waits for a replication response before retrying.
pub const DEFAULT_REPLICA_FETCH_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a leader holds a replication request open when the follower is
/// already caught up.
pub const DEFAULT_REPLICA_MAX_IDLE_WAIT: Duration = Duration::from_millis(500);

/// How long an ISR member may go without catching up before it is removed.
pub const DEFAULT_REPLICA_MAX_LAG_TIME: Duration = Duration::from_secs(10);

/// Maximum entries a follower may trail the leader's tail and still be
/// admitted to the ISR.
pub const DEFAULT_ISR_MAX_LAG_ENTRIES: i64 = 0;

/// Pending replication requests buffered per follower.
pub const REPLICATION_QUEUE_CAPACITY: usize = 16;

// =============================================================================
// Channels
// =============================================================================

/// Per-subscriber queue depth on the local transport.
pub const DEFAULT_TRANSPORT_QUEUE_CAPACITY: usize = 8192;

/// Delivery channel depth between a tailing task and its caller.
pub const DEFAULT_SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

/// Response channel depth for async publish sessions.
pub const DEFAULT_PUBLISH_ASYNC_CHANNEL_CAPACITY: usize = 256;

/// How long an async publish session keeps collecting acks after the caller
/// closed its send side.
pub const ASYNC_ACK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Storage
// =============================================================================

/// SlateDB WAL flush interval for partition logs.
pub const DEFAULT_LOG_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// How often retention is enforced when a stream sets no cleaner interval.
pub const DEFAULT_CLEANER_INTERVAL: Duration = Duration::from_secs(300);

/// How often the auto-pause monitor inspects partitions.
pub const DEFAULT_AUTO_PAUSE_CHECK_INTERVAL: Duration = Duration::from_secs(1);
