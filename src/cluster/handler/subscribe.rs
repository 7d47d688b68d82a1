//! Tailing subscriptions.

use tracing::debug;

use super::ApiHandler;
use crate::cluster::commit_log::CommitLog;
use crate::cluster::error::BrokerError;
use crate::cluster::subscription::{self, MessageStream};
use crate::error::{Result, Status};
use crate::types::{CallContext, Offset, StartPosition, SubscribeRequest};

/// Handle a subscribe request.
pub(super) async fn handle_subscribe(
    handler: &ApiHandler,
    ctx: &CallContext,
    request: SubscribeRequest,
) -> Result<MessageStream> {
    if request.stream.is_empty() {
        return Err(Status::invalid_argument("stream must not be empty"));
    }
    let (stream, id) = (request.stream.as_str(), request.partition);

    let mut desc = handler.resolve_partition(stream, id).await?;
    if request.resume && handler.resume_stream_for(stream, &desc).await? {
        desc = handler.resolve_partition(stream, id).await?;
    }
    if desc.paused {
        return Err(BrokerError::Paused {
            stream: stream.to_string(),
            partition: id,
        }
        .into());
    }

    let node_id = handler.broker.node_id();
    let serves_reads = desc.leader == node_id || (request.read_isr_replica && desc.in_isr(node_id));
    let Some(partition) = handler.broker.partition(stream, id).filter(|_| serves_reads) else {
        return Err(BrokerError::NotLeader {
            stream: stream.to_string(),
            partition: id,
        }
        .into());
    };
    let Some(log) = partition.log().await else {
        return Err(BrokerError::Paused {
            stream: stream.to_string(),
            partition: id,
        }
        .into());
    };

    let start = start_offset(&log, &request).await?;
    let end_offset = log.newest_offset();
    debug!(
        stream,
        partition = id,
        position = ?request.start_position,
        start,
        "Opening subscription"
    );
    Ok(subscription::open(
        partition,
        &log,
        start,
        end_offset,
        handler.broker.config().subscriber_channel_capacity,
        &ctx.cancel,
    ))
}

/// Resolve the requested start position to an offset. Never negative.
async fn start_offset(log: &CommitLog, request: &SubscribeRequest) -> Result<Offset> {
    let offset = match request.start_position {
        StartPosition::Offset => request.start_offset,
        StartPosition::Timestamp => log
            .offset_for_timestamp(request.start_timestamp)
            .await
            .map_err(BrokerError::from)?,
        StartPosition::Earliest => log.oldest_offset(),
        StartPosition::Latest => log.newest_offset(),
        StartPosition::NewOnly => log.newest_offset() + 1,
    };
    Ok(offset.max(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::commit_log::{CommitLogOptions, entry};
    use object_store::memory::InMemory;
    use std::sync::Arc;

    async fn open_log(name: &str) -> Arc<CommitLog> {
        CommitLog::open(name, Arc::new(InMemory::new()), name, CommitLogOptions::default())
            .await
            .unwrap()
    }

    fn request(position: StartPosition) -> SubscribeRequest {
        SubscribeRequest::new("orders", 0).with_start_position(position)
    }

    #[tokio::test]
    async fn test_empty_log_positions_resolve_to_zero() {
        let log = open_log("start-empty").await;
        for position in [
            StartPosition::NewOnly,
            StartPosition::Earliest,
            StartPosition::Latest,
            StartPosition::Timestamp,
        ] {
            assert_eq!(start_offset(&log, &request(position)).await.unwrap(), 0);
        }
        assert_eq!(
            start_offset(&log, &request(StartPosition::Offset).from_offset(-5))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_positions_on_populated_log() {
        let log = open_log("start-populated").await;
        for value in ["a", "b", "c"] {
            log.append(entry(value)).await.unwrap();
        }

        assert_eq!(start_offset(&log, &request(StartPosition::Earliest)).await.unwrap(), 0);
        assert_eq!(start_offset(&log, &request(StartPosition::Latest)).await.unwrap(), 2);
        assert_eq!(start_offset(&log, &request(StartPosition::NewOnly)).await.unwrap(), 3);
        assert_eq!(
            start_offset(&log, &SubscribeRequest::new("orders", 0).from_offset(1))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            start_offset(&log, &SubscribeRequest::new("orders", 0).from_timestamp(0))
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            start_offset(&log, &SubscribeRequest::new("orders", 0).from_timestamp(i64::MAX))
                .await
                .unwrap(),
            3
        );
    }
}
