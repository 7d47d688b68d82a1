//! Wire formats carried over the pub/sub transport and stored in partition logs.
//!
//! # Envelope
//!
//! Structured payloads are framed as:
//!
//! ```text
//! +---------+---------+----------------------+
//! | "LBRG"  | version | bincode body         |
//! | 4 bytes | 1 byte  | variable             |
//! +---------+---------+----------------------+
//! ```
//!
//! Payloads published on an ingestion subject without the cookie are still
//! accepted: the raw bytes become the entry value.
//!
//! # Subjects
//!
//! | Purpose | Subject |
//! |---------|---------|
//! | Partition ingestion | `{stream subject}` for partition 0, `{stream subject}.{N}` otherwise |
//! | Replication control | `{namespace}.{subject hash}.{stream}.{N}.replicate` |
//! | Raft RPC | `{namespace}.raft.{node id}` |

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AckPolicy, Headers, NodeId, Offset, PartitionId};

/// Magic bytes identifying an envelope.
pub const ENVELOPE_COOKIE: &[u8; 4] = b"LBRG";

/// Current envelope version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Size of the envelope header (cookie + version).
pub const ENVELOPE_HEADER_LEN: usize = 5;

/// Errors decoding transport payloads.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("payload is not an envelope")]
    NotAnEnvelope,

    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Frame a value into an envelope.
pub fn encode_envelope<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    let body = bincode::serialize(value)?;
    let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER_LEN + body.len());
    buf.put_slice(ENVELOPE_COOKIE);
    buf.put_u8(ENVELOPE_VERSION);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Decode an envelope. Fails with [`ProtocolError::NotAnEnvelope`] when the
/// cookie is missing.
pub fn decode_envelope<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() < ENVELOPE_HEADER_LEN || &data[0..4] != ENVELOPE_COOKIE {
        return Err(ProtocolError::NotAnEnvelope);
    }
    let version = data[4];
    if version != ENVELOPE_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    Ok(bincode::deserialize(&data[ENVELOPE_HEADER_LEN..])?)
}

/// A message published to a partition's ingestion subject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestMessage {
    pub key: Bytes,
    pub value: Bytes,
    pub stream: String,
    pub headers: Headers,
    pub ack_inbox: Option<String>,
    pub correlation_id: String,
    pub ack_policy: AckPolicy,
}

/// A single log entry as stored in a partition log and shipped to followers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub key: Bytes,
    pub value: Bytes,
    pub headers: Headers,
    /// Nanoseconds since the Unix epoch, assigned by the leader.
    pub timestamp: i64,
    /// Epoch of the leader that appended the entry.
    pub leader_epoch: u64,
}

impl LogEntry {
    /// Approximate stored size, used for byte-based retention.
    pub fn size_hint(&self) -> usize {
        let headers: usize = self.headers.iter().map(|(k, v)| k.len() + v.len()).sum();
        self.key.len() + self.value.len() + headers + 16
    }
}

/// Follower → leader: "send me everything after `high_watermark`".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationRequest {
    pub replica_id: NodeId,
    /// Last offset the follower holds locally.
    pub high_watermark: Offset,
    /// Leader epoch the follower believes is current.
    pub leader_epoch: u64,
}

/// An entry with its offset, as returned by a replication response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedEntry {
    pub offset: Offset,
    pub entry: LogEntry,
}

/// Leader → follower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationResponse {
    pub leader_epoch: u64,
    /// Leader's committed high-watermark.
    pub leader_hw: Offset,
    /// Entries strictly after the requested high-watermark, in offset order.
    pub entries: Vec<ReplicatedEntry>,
}

/// Ingestion subject for a partition of a stream.
pub fn partition_subject(stream_subject: &str, partition: PartitionId) -> String {
    if partition > 0 {
        format!("{}.{}", stream_subject, partition)
    } else {
        stream_subject.to_string()
    }
}

/// Replication control subject for a partition.
pub fn replication_subject(
    namespace: &str,
    stream_subject: &str,
    stream: &str,
    partition: PartitionId,
) -> String {
    format!(
        "{}.{:016x}.{}.{}.replicate",
        namespace,
        subject_hash(stream_subject),
        stream,
        partition
    )
}

/// Raft RPC subject of a node.
pub fn raft_subject(namespace: &str, node_id: NodeId) -> String {
    format!("{}.raft.{}", namespace, node_id)
}

/// FNV-1a hash of a subject; stable across processes.
fn subject_hash(subject: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    subject.bytes().fold(OFFSET_BASIS, |hash, b| {
        (hash ^ u64::from(b)).wrapping_mul(PRIME)
    })
}
