//! Metadata reads. Served from the local replica of the topology, with no
//! consensus round trip.

use super::ApiHandler;
use crate::cluster::error::BrokerError;
use crate::cluster::raft::StreamDescriptor;
use crate::error::{Code, Result};
use crate::types::{
    FetchMetadataResponse, FetchPartitionMetadataResponse, PartitionId, StreamMetadata,
};

/// Handle a topology read. An empty `streams` list returns every stream;
/// unknown names come back with a `NotFound` error entry.
pub(super) async fn handle_fetch_metadata(
    handler: &ApiHandler,
    streams: &[String],
) -> Result<FetchMetadataResponse> {
    let mut nodes = handler.broker.coordinator()?.members().await;
    nodes.sort_unstable();

    let metadata = handler.broker.metadata();
    let streams = if streams.is_empty() {
        metadata.streams().await.iter().map(to_metadata).collect()
    } else {
        let mut found = Vec::with_capacity(streams.len());
        for name in streams {
            found.push(match metadata.stream(name).await {
                Some(stream) => to_metadata(&stream),
                None => StreamMetadata {
                    name: name.clone(),
                    subject: String::new(),
                    error: Some(Code::NotFound),
                    partitions: Default::default(),
                },
            });
        }
        found
    };

    Ok(FetchMetadataResponse { nodes, streams })
}

/// Handle a partition read. Only the partition leader answers, since only it
/// knows the committed high-watermark.
pub(super) async fn handle_fetch_partition_metadata(
    handler: &ApiHandler,
    stream: &str,
    partition: PartitionId,
) -> Result<FetchPartitionMetadataResponse> {
    let desc = handler.resolve_partition(stream, partition).await?;
    let not_leader = || BrokerError::NotLeader {
        stream: stream.to_string(),
        partition,
    };

    let Some(local) = handler.broker.partition(stream, partition) else {
        return Err(not_leader().into());
    };
    if !local.is_leader().await {
        return Err(not_leader().into());
    }
    let Some(log) = local.log().await else {
        return Err(not_leader().into());
    };

    Ok(FetchPartitionMetadataResponse {
        metadata: desc.to_metadata(),
        high_watermark: log.high_watermark(),
        newest_offset: log.newest_offset(),
    })
}

fn to_metadata(stream: &StreamDescriptor) -> StreamMetadata {
    StreamMetadata {
        name: stream.name.clone(),
        subject: stream.subject.clone(),
        error: None,
        partitions: stream
            .partitions
            .iter()
            .map(|(id, p)| (*id, p.to_metadata()))
            .collect(),
    }
}
