//! Publishing.
//!
//! The gateway never appends to a log itself: it wraps the request in an
//! [`IngestMessage`] envelope and publishes it on the partition's ingestion
//! subject, where the partition leader picks it up. Acks come back on an inbox
//! subject.

use std::pin::pin;
use std::sync::Arc;
use std::time::Instant;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::ApiHandler;
use crate::cluster::error::BrokerError;
use crate::cluster::metrics;
use crate::cluster::raft::PartitionDescriptor;
use crate::constants::ASYNC_ACK_DRAIN_TIMEOUT;
use crate::error::{PublishAsyncError, Result, Status};
use crate::protocol::{IngestMessage, decode_envelope, encode_envelope};
use crate::transport::{Subscription, Transport};
use crate::types::{
    Ack, AckPolicy, CallContext, PartitionId, PublishAsyncResponse, PublishRequest,
    PublishResponse, PublishToSubjectRequest,
};

/// Handle a publish to a stream partition.
pub(super) async fn handle_publish(
    handler: &ApiHandler,
    ctx: &CallContext,
    request: PublishRequest,
) -> Result<PublishResponse> {
    let start = Instant::now();
    let mode = mode(ctx, request.ack_policy);
    let result = async {
        let desc = prepare(handler, &request.stream, request.partition).await?;
        let msg = IngestMessage {
            key: request.key,
            value: request.value,
            stream: request.stream,
            headers: request.headers,
            ack_inbox: request.ack_inbox,
            correlation_id: request.correlation_id,
            ack_policy: request.ack_policy,
        };
        send(handler.broker.transport(), ctx, &desc.subject, msg).await
    }
    .await;
    record(mode, &result, start);
    Ok(PublishResponse { ack: result? })
}

/// Handle a publish to an arbitrary subject. No stream is resolved: whichever
/// partition ingests the subject (if any) appends the message.
pub(super) async fn handle_publish_to_subject(
    handler: &ApiHandler,
    ctx: &CallContext,
    request: PublishToSubjectRequest,
) -> Result<PublishResponse> {
    if request.subject.is_empty() {
        return Err(Status::invalid_argument("subject must not be empty"));
    }
    let start = Instant::now();
    let mode = mode(ctx, request.ack_policy);
    let msg = IngestMessage {
        key: request.key,
        value: request.value,
        stream: String::new(),
        headers: request.headers,
        ack_inbox: request.ack_inbox,
        correlation_id: request.correlation_id,
        ack_policy: request.ack_policy,
    };
    let result = send(handler.broker.transport(), ctx, &request.subject, msg).await;
    record(mode, &result, start);
    Ok(PublishResponse { ack: result? })
}

/// Start an async publish session.
pub(super) async fn handle_publish_async<S>(
    handler: &ApiHandler,
    ctx: &CallContext,
    requests: S,
) -> Result<mpsc::Receiver<PublishAsyncResponse>>
where
    S: Stream<Item = PublishRequest> + Send + 'static,
{
    let transport = handler.broker.transport().clone();
    let inbox = transport.new_inbox();
    let acks = transport
        .subscribe(&inbox)
        .await
        .map_err(BrokerError::from)?;
    let capacity = handler.broker.config().publish_async_channel_capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);

    let session = AsyncSession {
        handler: handler.clone(),
        transport,
        inbox,
        tx,
        cancel: ctx.cancel.child_token(),
    };
    debug!(inbox = %session.inbox, "Async publish session started");
    tokio::spawn(session.run(requests, acks));
    Ok(rx)
}

/// Resolve the target partition, rejecting readonly partitions and resuming
/// paused ones (or the whole stream when its resume-all flag is set).
async fn prepare(
    handler: &ApiHandler,
    stream: &str,
    partition: PartitionId,
) -> Result<PartitionDescriptor> {
    if stream.is_empty() {
        return Err(Status::invalid_argument("stream must not be empty"));
    }
    let desc = handler.resolve_partition(stream, partition).await?;
    if desc.readonly {
        return Err(BrokerError::Readonly {
            stream: stream.to_string(),
            partition,
        }
        .into());
    }
    if handler.resume_stream_for(stream, &desc).await? {
        debug!(stream, partition, "Resumed stream for publish");
    }
    Ok(desc)
}

/// Publish `msg` on `subject`, waiting for its ack when the call has a
/// deadline and the policy asks for one.
async fn send(
    transport: &Arc<dyn Transport>,
    ctx: &CallContext,
    subject: &str,
    mut msg: IngestMessage,
) -> Result<Option<Ack>> {
    msg.ack_inbox = msg.ack_inbox.filter(|inbox| !inbox.is_empty());
    let Some(timeout) = ctx.remaining().filter(|_| msg.ack_policy != AckPolicy::None) else {
        let payload = encode_envelope(&msg).map_err(BrokerError::from)?;
        transport
            .publish(subject, payload)
            .await
            .map_err(BrokerError::from)?;
        return Ok(None);
    };

    let inbox = msg
        .ack_inbox
        .get_or_insert_with(|| transport.new_inbox())
        .clone();
    // Subscribe before publishing so a fast ack is not missed.
    let mut acks = transport
        .subscribe(&inbox)
        .await
        .map_err(BrokerError::from)?;
    let payload = encode_envelope(&msg).map_err(BrokerError::from)?;
    transport
        .publish(subject, payload)
        .await
        .map_err(BrokerError::from)?;

    let correlation_id = msg.correlation_id;
    tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => Err(Status::canceled("publish canceled")),
        waited = tokio::time::timeout(timeout, wait_for_ack(&mut acks, &correlation_id)) => {
            match waited {
                Ok(result) => result.map(Some),
                Err(_) => Err(Status::deadline_exceeded(format!(
                    "no ack received on {} within {:?}",
                    subject, timeout
                ))),
            }
        }
    }
}

async fn wait_for_ack(acks: &mut Subscription, correlation_id: &str) -> Result<Ack> {
    while let Some(reply) = acks.next().await {
        match decode_envelope::<Ack>(&reply.payload) {
            Ok(ack) if correlation_id.is_empty() || ack.correlation_id == correlation_id => {
                return Ok(ack);
            }
            Ok(ack) => trace!(correlation_id = %ack.correlation_id, "Skipping uncorrelated ack"),
            Err(e) => debug!(error = %e, "Ignoring malformed ack"),
        }
    }
    Err(Status::internal("ack subscription closed"))
}

fn mode(ctx: &CallContext, policy: AckPolicy) -> &'static str {
    if ctx.has_deadline() && policy != AckPolicy::None {
        "sync"
    } else {
        "fire_and_forget"
    }
}

fn record<T>(mode: &str, result: &Result<T>, start: Instant) {
    let status = match result {
        Ok(_) => "ok",
        Err(e) => e.code.as_str(),
    };
    metrics::record_publish(mode, status, start.elapsed().as_secs_f64());
}

/// One async publish session: a single ack inbox shared by every request.
struct AsyncSession {
    handler: ApiHandler,
    transport: Arc<dyn Transport>,
    inbox: String,
    tx: mpsc::Sender<PublishAsyncResponse>,
    cancel: CancellationToken,
}

impl AsyncSession {
    async fn run<S>(self, requests: S, mut acks: Subscription)
    where
        S: Stream<Item = PublishRequest> + Send,
    {
        let mut requests = pin!(requests);
        let mut input_open = true;
        let mut outstanding = 0usize;
        let mut drain = pin!(tokio::time::sleep(ASYNC_ACK_DRAIN_TIMEOUT));

        loop {
            if !input_open && outstanding == 0 {
                break;
            }
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = self.tx.closed() => break,
                reply = acks.next() => {
                    let Some(reply) = reply else { break };
                    let ack = match decode_envelope::<Ack>(&reply.payload) {
                        Ok(ack) => ack,
                        Err(e) => {
                            debug!(inbox = %self.inbox, error = %e, "Ignoring malformed ack");
                            continue;
                        }
                    };
                    outstanding = outstanding.saturating_sub(1);
                    let frame = PublishAsyncResponse {
                        correlation_id: ack.correlation_id.clone(),
                        ack: Some(ack),
                        error: None,
                    };
                    if !self.forward(frame).await {
                        break;
                    }
                }
                request = requests.next(), if input_open => match request {
                    Some(request) => {
                        let published = tokio::select! {
                            biased;
                            () = self.cancel.cancelled() => break,
                            published = self.publish_one(request) => published,
                        };
                        match published {
                            Ok(true) => outstanding += 1,
                            Ok(false) => {}
                            Err(frame) => {
                                if !self.forward(frame).await {
                                    break;
                                }
                            }
                        }
                    }
                    None => {
                        input_open = false;
                        drain
                            .as_mut()
                            .reset(tokio::time::Instant::now() + ASYNC_ACK_DRAIN_TIMEOUT);
                    }
                },
                () = &mut drain, if !input_open => {
                    debug!(inbox = %self.inbox, outstanding, "Gave up waiting for acks");
                    break;
                }
            }
        }
        debug!(inbox = %self.inbox, "Async publish session ended");
    }

    /// Publish one request. `Ok(true)` when an ack is expected; failures are
    /// returned as an error frame for the caller.
    async fn publish_one(
        &self,
        request: PublishRequest,
    ) -> std::result::Result<bool, PublishAsyncResponse> {
        let start = Instant::now();
        let correlation_id = request.correlation_id.clone();
        let result = async {
            let desc = prepare(&self.handler, &request.stream, request.partition).await?;
            let expects_ack = request.ack_policy != AckPolicy::None;
            let msg = IngestMessage {
                key: request.key,
                value: request.value,
                stream: request.stream,
                headers: request.headers,
                ack_inbox: expects_ack.then(|| self.inbox.clone()),
                correlation_id: request.correlation_id,
                ack_policy: request.ack_policy,
            };
            let payload = encode_envelope(&msg).map_err(BrokerError::from)?;
            self.transport
                .publish(&desc.subject, payload)
                .await
                .map_err(BrokerError::from)?;
            Ok::<_, Status>(expects_ack)
        }
        .await;
        record("async", &result, start);

        result.map_err(|status| {
            debug!(correlation_id = %correlation_id, error = %status, "Async publish rejected");
            PublishAsyncResponse {
                correlation_id,
                ack: None,
                error: Some(PublishAsyncError::from(status)),
            }
        })
    }

    /// Hand a frame to the caller. `false` once the caller is gone or the
    /// session was canceled.
    async fn forward(&self, frame: PublishAsyncResponse) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            sent = self.tx.send(frame) => sent.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;
    use bytes::Bytes;
    use std::time::Duration;

    fn message(policy: AckPolicy) -> IngestMessage {
        IngestMessage {
            value: Bytes::from_static(b"hello"),
            correlation_id: "c1".to_string(),
            ack_policy: policy,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fire_and_forget_without_deadline() {
        let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new());
        let mut sub = transport.subscribe("orders").await.unwrap();

        let ack = send(&transport, &CallContext::new(), "orders", message(AckPolicy::Leader))
            .await
            .unwrap();
        assert!(ack.is_none());

        let delivered = sub.next().await.unwrap();
        let msg: IngestMessage = decode_envelope(&delivered.payload).unwrap();
        assert_eq!(msg.value, Bytes::from_static(b"hello"));
        assert!(msg.ack_inbox.is_none());
    }

    #[tokio::test]
    async fn test_sync_publish_waits_for_correlated_ack() {
        let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new());
        let mut sub = transport.subscribe("orders").await.unwrap();
        let responder = transport.clone();
        tokio::spawn(async move {
            let delivered = sub.next().await.unwrap();
            let msg: IngestMessage = decode_envelope(&delivered.payload).unwrap();
            let inbox = msg.ack_inbox.unwrap();
            for correlation_id in ["other", "c1"] {
                let ack = Ack {
                    offset: 4,
                    correlation_id: correlation_id.to_string(),
                    ack_inbox: inbox.clone(),
                    ..Default::default()
                };
                responder
                    .publish(&inbox, encode_envelope(&ack).unwrap())
                    .await
                    .unwrap();
            }
        });

        let ctx = CallContext::with_timeout(Duration::from_secs(5));
        let ack = send(&transport, &ctx, "orders", message(AckPolicy::Leader))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.correlation_id, "c1");
        assert_eq!(ack.offset, 4);
    }

    #[tokio::test]
    async fn test_sync_publish_times_out_without_ack() {
        let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new());
        let ctx = CallContext::with_timeout(Duration::from_millis(50));
        let err = send(&transport, &ctx, "orders", message(AckPolicy::All))
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::Code::DeadlineExceeded);
    }

    #[test]
    fn test_mode_selection() {
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        assert_eq!(mode(&ctx, AckPolicy::Leader), "sync");
        assert_eq!(mode(&ctx, AckPolicy::None), "fire_and_forget");
        assert_eq!(mode(&CallContext::new(), AckPolicy::All), "fire_and_forget");
    }
}
