//! Publish/subscribe gateway.
//!
//! The caller-facing API of a broker node. This module is split into
//! submodules by call category:
//! - `admin` - stream creation, deletion, pause, resume, readonly and leader
//!   changes (all routed through the metadata coordinator)
//! - `publish` - synchronous, fire-and-forget and async publishing
//! - `subscribe` - tailing subscriptions
//! - `metadata` - topology and partition metadata reads
//!
//! Every call fails with a [`Status`]; broker errors are mapped with
//! [`BrokerError::to_status`](super::BrokerError::to_status).

mod admin;
mod metadata;
mod publish;
mod subscribe;

use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;

use super::broker::Broker;
use super::raft::{MetadataResponse, PartitionDescriptor};
use super::subscription::MessageStream;
use crate::error::{Result, Status};
use crate::types::{
    CallContext, CreateStreamRequest, FetchMetadataResponse, FetchPartitionMetadataResponse,
    NodeId, PartitionId, PauseStreamRequest, PublishAsyncResponse, PublishRequest,
    PublishResponse, PublishToSubjectRequest, ResumeStreamRequest, SetStreamReadonlyRequest,
    SubscribeRequest,
};

/// Gateway bound to one broker node. Clones share the node.
#[derive(Clone, Debug)]
pub struct ApiHandler {
    pub(crate) broker: Arc<Broker>,
}

impl ApiHandler {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    // ========================================================================
    // Administration
    // ========================================================================

    /// Create a stream, assigning replicas across the current members.
    pub async fn create_stream(&self, ctx: &CallContext, request: CreateStreamRequest) -> Result<()> {
        check_context(ctx)?;
        admin::handle_create_stream(self, request).await
    }

    pub async fn delete_stream(&self, ctx: &CallContext, name: &str) -> Result<()> {
        check_context(ctx)?;
        admin::handle_delete_stream(self, name).await
    }

    /// Pause partitions; none listed means every partition of the stream.
    pub async fn pause_stream(&self, ctx: &CallContext, request: PauseStreamRequest) -> Result<()> {
        check_context(ctx)?;
        admin::handle_pause_stream(self, request).await
    }

    pub async fn set_stream_readonly(
        &self,
        ctx: &CallContext,
        request: SetStreamReadonlyRequest,
    ) -> Result<()> {
        check_context(ctx)?;
        admin::handle_set_stream_readonly(self, request).await
    }

    /// Resume paused partitions; none listed means every paused partition.
    pub async fn resume_stream(&self, ctx: &CallContext, request: ResumeStreamRequest) -> Result<()> {
        check_context(ctx)?;
        admin::handle_resume_stream(self, request).await
    }

    /// Make `leader` the leader of a partition. It must be in the ISR.
    pub async fn change_leader(
        &self,
        ctx: &CallContext,
        stream: &str,
        partition: PartitionId,
        leader: NodeId,
    ) -> Result<()> {
        check_context(ctx)?;
        admin::handle_change_leader(self, stream, partition, leader).await
    }

    // ========================================================================
    // Publish
    // ========================================================================

    /// Publish one message to a stream partition.
    ///
    /// Waits for the ack only when the context has a deadline and the ack
    /// policy is not [`AckPolicy::None`](crate::types::AckPolicy::None).
    pub async fn publish(&self, ctx: &CallContext, request: PublishRequest) -> Result<PublishResponse> {
        check_context(ctx)?;
        publish::handle_publish(self, ctx, request).await
    }

    /// Publish one message to an arbitrary subject.
    pub async fn publish_to_subject(
        &self,
        ctx: &CallContext,
        request: PublishToSubjectRequest,
    ) -> Result<PublishResponse> {
        check_context(ctx)?;
        publish::handle_publish_to_subject(self, ctx, request).await
    }

    /// Publish a stream of messages, receiving acks and per-request errors
    /// correlated by `correlation_id`.
    pub async fn publish_async<S>(
        &self,
        ctx: &CallContext,
        requests: S,
    ) -> Result<mpsc::Receiver<PublishAsyncResponse>>
    where
        S: Stream<Item = PublishRequest> + Send + 'static,
    {
        check_context(ctx)?;
        publish::handle_publish_async(self, ctx, requests).await
    }

    // ========================================================================
    // Subscribe
    // ========================================================================

    /// Tail a partition. The first item is the empty frame.
    pub async fn subscribe(&self, ctx: &CallContext, request: SubscribeRequest) -> Result<MessageStream> {
        check_context(ctx)?;
        subscribe::handle_subscribe(self, ctx, request).await
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Cluster topology, optionally limited to `streams`.
    pub async fn fetch_metadata(
        &self,
        ctx: &CallContext,
        streams: &[String],
    ) -> Result<FetchMetadataResponse> {
        check_context(ctx)?;
        metadata::handle_fetch_metadata(self, streams).await
    }

    /// High-watermark and newest offset of a partition led by this node.
    pub async fn fetch_partition_metadata(
        &self,
        ctx: &CallContext,
        stream: &str,
        partition: PartitionId,
    ) -> Result<FetchPartitionMetadataResponse> {
        check_context(ctx)?;
        metadata::handle_fetch_partition_metadata(self, stream, partition).await
    }

    // ========================================================================
    // Shared helpers
    // ========================================================================

    /// Replicated descriptor of a partition.
    pub(crate) async fn resolve_partition(
        &self,
        stream: &str,
        partition: PartitionId,
    ) -> Result<PartitionDescriptor> {
        let Some(desc) = self.broker.metadata().stream(stream).await else {
            return Err(Status::not_found(format!("no such stream: {}", stream)));
        };
        desc.partitions.get(&partition).cloned().ok_or_else(|| {
            Status::not_found(format!("no such partition: {}/{}", stream, partition))
        })
    }

    /// Resume the stream before a publish or resuming subscribe.
    ///
    /// With the stream's resume-all flag set, every paused partition is
    /// resumed, whether or not `partition` itself is paused. The flag is
    /// cleared only once the resume was applied. Otherwise only `partition`
    /// is resumed, if paused. Returns whether anything was proposed.
    pub(crate) async fn resume_stream_for(
        &self,
        stream: &str,
        partition: &PartitionDescriptor,
    ) -> Result<bool> {
        let resume_all = self.broker.resume_all(stream);
        let partitions = if resume_all {
            Vec::new()
        } else if partition.paused {
            vec![partition.id]
        } else {
            return Ok(false);
        };
        admin::handle_resume_stream(
            self,
            ResumeStreamRequest {
                name: stream.to_string(),
                partitions,
            },
        )
        .await?;
        if resume_all {
            self.broker.clear_resume_all(stream);
        }
        Ok(true)
    }
}

fn check_context(ctx: &CallContext) -> Result<()> {
    if ctx.is_canceled() {
        return Err(Status::canceled("call canceled"));
    }
    if ctx.remaining().is_some_and(|d| d.is_zero()) {
        return Err(Status::deadline_exceeded("deadline already passed"));
    }
    Ok(())
}

/// Turn not-found and rejected metadata responses into errors.
fn check_response(response: MetadataResponse) -> Result<MetadataResponse> {
    match response {
        MetadataResponse::NotFound {
            stream,
            partition: None,
        } => Err(Status::not_found(format!("no such stream: {}", stream))),
        MetadataResponse::NotFound {
            stream,
            partition: Some(partition),
        } => Err(Status::not_found(format!(
            "no such partition: {}/{}",
            stream, partition
        ))),
        MetadataResponse::Rejected { reason } => Err(Status::failed_precondition(reason)),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Code;
    use std::time::Duration;

    #[test]
    fn test_check_context() {
        assert!(check_context(&CallContext::new()).is_ok());

        let ctx = CallContext::new();
        ctx.cancel.cancel();
        assert_eq!(check_context(&ctx).unwrap_err().code, Code::Canceled);

        let ctx = CallContext::with_timeout(Duration::ZERO);
        assert_eq!(check_context(&ctx).unwrap_err().code, Code::DeadlineExceeded);
    }

    #[test]
    fn test_check_response() {
        let err = check_response(MetadataResponse::NotFound {
            stream: "orders".into(),
            partition: Some(3),
        })
        .unwrap_err();
        assert_eq!(err.code, Code::NotFound);
        assert!(err.message.contains("orders/3"));

        let err = check_response(MetadataResponse::Rejected {
            reason: "stale epoch".into(),
        })
        .unwrap_err();
        assert_eq!(err.code, Code::FailedPrecondition);

        assert!(check_response(MetadataResponse::Ok).is_ok());
    }
}
