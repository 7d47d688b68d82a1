//! End-to-end tests of the publish/subscribe gateway on single-node and
//! in-process multi-node clusters.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream;
use object_store::ObjectStore;
use object_store::memory::InMemory;
use tokio::sync::mpsc::error::TryRecvError;

use logbridge::cluster::{ApiHandler, Broker, BrokerConfig, LocalCluster, MessageStream};
use logbridge::error::{Code, PublishAsyncErrorCode};
use logbridge::transport::{LocalTransport, Transport};
use logbridge::types::{
    AckPolicy, CallContext, CreateStreamRequest, Message, PauseStreamRequest, PublishRequest,
    PublishToSubjectRequest, ResumeStreamRequest, SetStreamReadonlyRequest, StartPosition,
    SubscribeRequest,
};

// ============================================================================
// Test Utilities
// ============================================================================

const WAIT: Duration = Duration::from_secs(5);

fn test_config(node_id: u64) -> BrokerConfig {
    BrokerConfig::default()
        .with_node_id(node_id)
        .with_replica_max_idle_wait(Duration::from_millis(50))
}

/// Nodes sharing one transport, one object store and one sequencer.
struct TestCluster {
    handlers: Vec<ApiHandler>,
}

impl TestCluster {
    async fn start(nodes: u64) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new());
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let cluster = LocalCluster::new();
        let mut handlers = Vec::new();
        for node_id in 1..=nodes {
            let broker = Broker::start_local(
                test_config(node_id),
                transport.clone(),
                store.clone(),
                &cluster,
            )
            .await
            .expect("broker should start");
            handlers.push(ApiHandler::new(broker));
        }
        Self { handlers }
    }

    fn node(&self, node_id: u64) -> &ApiHandler {
        &self.handlers[(node_id - 1) as usize]
    }
}

async fn single_node() -> ApiHandler {
    TestCluster::start(1).await.handlers.remove(0)
}

fn sync_ctx() -> CallContext {
    CallContext::with_timeout(WAIT)
}

async fn create(api: &ApiHandler, name: &str, partitions: i32) {
    api.create_stream(
        &CallContext::new(),
        CreateStreamRequest::new(name, name).with_partitions(partitions),
    )
    .await
    .expect("create stream");
}

async fn publish_sync(api: &ApiHandler, stream: &str, partition: i32, value: &'static str) -> i64 {
    let response = api
        .publish(
            &sync_ctx(),
            PublishRequest::new(stream, value).with_partition(partition),
        )
        .await
        .expect("publish");
    response.ack.expect("sync publish returns an ack").offset
}

async fn subscribe(api: &ApiHandler, request: SubscribeRequest) -> MessageStream {
    let mut messages = api
        .subscribe(&CallContext::new(), request)
        .await
        .expect("subscribe");
    let first = next(&mut messages).await.expect("empty frame");
    assert!(first.is_empty_frame());
    messages
}

async fn next(messages: &mut MessageStream) -> Result<Message, logbridge::error::Status> {
    tokio::time::timeout(WAIT, messages.next())
        .await
        .expect("timed out waiting for a message")
        .expect("subscription ended")
}

// ============================================================================
// Administration
// ============================================================================

#[tokio::test]
async fn test_create_stream_assigns_replicas() {
    let cluster = TestCluster::start(3).await;
    let api = cluster.node(1);
    api.create_stream(
        &CallContext::new(),
        CreateStreamRequest::new("orders", "orders")
            .with_partitions(3)
            .with_replication_factor(2),
    )
    .await
    .unwrap();

    let metadata = api
        .fetch_metadata(&CallContext::new(), &["orders".to_string()])
        .await
        .unwrap();
    assert_eq!(metadata.nodes, vec![1, 2, 3]);
    assert_eq!(metadata.streams.len(), 1);
    let stream = &metadata.streams[0];
    assert!(stream.error.is_none());
    assert_eq!(stream.partitions.len(), 3);
    for partition in stream.partitions.values() {
        assert_eq!(partition.replicas.len(), 2);
        assert_eq!(partition.leader, partition.replicas[0]);
        assert_eq!(partition.isr, partition.replicas);
    }
    assert_eq!(stream.partitions[&0].subject, "orders");
    assert_eq!(stream.partitions[&2].subject, "orders.2");

    // Every replica materialized its partition; nobody else did.
    for node_id in 1..=3 {
        let broker = cluster.node(node_id).broker();
        for (id, partition) in &stream.partitions {
            assert_eq!(
                broker.partition("orders", *id).is_some(),
                partition.replicas.contains(&node_id)
            );
        }
    }
}

#[tokio::test]
async fn test_create_stream_errors() {
    let api = single_node().await;
    create(&api, "orders", 1).await;

    let err = api
        .create_stream(&CallContext::new(), CreateStreamRequest::new("orders", "orders"))
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::AlreadyExists);

    let err = api
        .create_stream(
            &CallContext::new(),
            CreateStreamRequest::new("other", "other").with_replication_factor(2),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument);

    let err = api
        .create_stream(&CallContext::new(), CreateStreamRequest::new("", "nameless"))
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument);
}

#[tokio::test]
async fn test_unknown_stream_metadata_and_errors() {
    let api = single_node().await;

    let metadata = api
        .fetch_metadata(&CallContext::new(), &["missing".to_string()])
        .await
        .unwrap();
    assert_eq!(metadata.streams[0].error, Some(Code::NotFound));

    let err = api
        .delete_stream(&CallContext::new(), "missing")
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::NotFound);

    let err = api
        .publish(&sync_ctx(), PublishRequest::new("missing", "x"))
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::NotFound);

    let err = api
        .subscribe(&CallContext::new(), SubscribeRequest::new("missing", 0))
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::NotFound);
}

#[tokio::test]
async fn test_canceled_context_rejected() {
    let api = single_node().await;
    let ctx = CallContext::new();
    ctx.cancel.cancel();
    let err = api
        .create_stream(&ctx, CreateStreamRequest::new("orders", "orders"))
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::Canceled);
}

// ============================================================================
// Publish and subscribe
// ============================================================================

#[tokio::test]
async fn test_new_only_subscriber_sees_later_publish() {
    let api = single_node().await;
    create(&api, "orders", 1).await;

    let mut messages = subscribe(&api, SubscribeRequest::new("orders", 0)).await;
    let offset = publish_sync(&api, "orders", 0, "hello").await;
    assert_eq!(offset, 0);

    let msg = next(&mut messages).await.unwrap();
    assert_eq!(msg.offset, 0);
    assert_eq!(msg.value, Bytes::from_static(b"hello"));
    assert_eq!(msg.stream, "orders");
    assert_eq!(msg.subject, "orders");
    assert!(msg.timestamp > 0);
}

#[tokio::test]
async fn test_fire_and_forget_publish_is_appended() {
    let api = single_node().await;
    create(&api, "orders", 1).await;

    let response = api
        .publish(&CallContext::new(), PublishRequest::new("orders", "a"))
        .await
        .unwrap();
    assert!(response.ack.is_none());

    let mut messages = subscribe(
        &api,
        SubscribeRequest::new("orders", 0).with_start_position(StartPosition::Earliest),
    )
    .await;
    let msg = next(&mut messages).await.unwrap();
    assert_eq!(msg.offset, 0);
    assert_eq!(msg.value, Bytes::from_static(b"a"));
}

#[tokio::test]
async fn test_sync_publish_ack_fields() {
    let api = single_node().await;
    create(&api, "orders", 1).await;

    for (expected, policy) in [(0, AckPolicy::Leader), (1, AckPolicy::All)] {
        let ack = api
            .publish(
                &sync_ctx(),
                PublishRequest::new("orders", "v")
                    .with_ack_policy(policy)
                    .with_correlation_id(format!("c{}", expected)),
            )
            .await
            .unwrap()
            .ack
            .unwrap();
        assert_eq!(ack.offset, expected);
        assert_eq!(ack.stream, "orders");
        assert_eq!(ack.partition_subject, "orders");
        assert_eq!(ack.correlation_id, format!("c{}", expected));
        assert_eq!(ack.ack_policy, policy);
        assert!(ack.commit_timestamp > 0);
    }

    // AckPolicy::None never waits, even with a deadline.
    let response = api
        .publish(
            &sync_ctx(),
            PublishRequest::new("orders", "v").with_ack_policy(AckPolicy::None),
        )
        .await
        .unwrap();
    assert!(response.ack.is_none());
}

#[tokio::test]
async fn test_publish_to_subject() {
    let api = single_node().await;
    create(&api, "orders", 2).await;

    let ack = api
        .publish_to_subject(
            &sync_ctx(),
            PublishToSubjectRequest {
                subject: "orders.1".to_string(),
                value: Bytes::from_static(b"raw"),
                correlation_id: "s1".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .ack
        .unwrap();
    assert_eq!(ack.partition_subject, "orders.1");
    assert_eq!(ack.offset, 0);
}

#[tokio::test]
async fn test_start_positions() {
    let api = single_node().await;
    create(&api, "orders", 1).await;
    for value in ["a", "b", "c"] {
        publish_sync(&api, "orders", 0, value).await;
    }

    let mut earliest = subscribe(
        &api,
        SubscribeRequest::new("orders", 0).with_start_position(StartPosition::Earliest),
    )
    .await;
    assert_eq!(next(&mut earliest).await.unwrap().offset, 0);

    let mut latest = subscribe(
        &api,
        SubscribeRequest::new("orders", 0).with_start_position(StartPosition::Latest),
    )
    .await;
    assert_eq!(next(&mut latest).await.unwrap().offset, 2);

    let mut from_offset = subscribe(&api, SubscribeRequest::new("orders", 0).from_offset(1)).await;
    let msg = next(&mut from_offset).await.unwrap();
    assert_eq!(msg.offset, 1);
    assert_eq!(msg.value, Bytes::from_static(b"b"));

    let mut from_timestamp =
        subscribe(&api, SubscribeRequest::new("orders", 0).from_timestamp(msg.timestamp)).await;
    assert_eq!(next(&mut from_timestamp).await.unwrap().offset, 1);
}

#[tokio::test]
async fn test_empty_partition_start_positions() {
    let api = single_node().await;

    for (name, position) in [
        ("earliest", StartPosition::Earliest),
        ("latest", StartPosition::Latest),
        ("new-only", StartPosition::NewOnly),
    ] {
        create(&api, name, 1).await;
        let mut messages = subscribe(
            &api,
            SubscribeRequest::new(name, 0).with_start_position(position),
        )
        .await;
        assert_eq!(publish_sync(&api, name, 0, "first").await, 0);
        let msg = next(&mut messages).await.unwrap();
        assert_eq!(msg.offset, 0, "position {:?}", position);
    }
}

// ============================================================================
// Readonly, pause and delete
// ============================================================================

#[tokio::test]
async fn test_readonly_partition_drains_then_ends() {
    let api = single_node().await;
    create(&api, "orders", 1).await;
    publish_sync(&api, "orders", 0, "last").await;

    api.set_stream_readonly(
        &CallContext::new(),
        SetStreamReadonlyRequest {
            name: "orders".to_string(),
            partitions: vec![],
            readonly: true,
        },
    )
    .await
    .unwrap();

    let err = api
        .publish(&sync_ctx(), PublishRequest::new("orders", "rejected"))
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);

    let mut messages = subscribe(
        &api,
        SubscribeRequest::new("orders", 0).with_start_position(StartPosition::Earliest),
    )
    .await;
    let msg = next(&mut messages).await.unwrap();
    assert_eq!(msg.value, Bytes::from_static(b"last"));
    let err = next(&mut messages).await.unwrap_err();
    assert_eq!(err.code, Code::ResourceExhausted);
}

#[tokio::test]
async fn test_partition_turned_readonly_ends_at_subscribe_time_newest() {
    let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new());
    let mut config = test_config(1);
    config.subscriber_channel_capacity = 1;
    let broker = Broker::start_local(
        config,
        transport,
        Arc::new(InMemory::new()),
        &LocalCluster::new(),
    )
    .await
    .unwrap();
    let api = ApiHandler::new(broker);
    create(&api, "orders", 1).await;
    publish_sync(&api, "orders", 0, "a").await;
    publish_sync(&api, "orders", 0, "b").await;

    // The single-slot channel holds the tailing task back until we read.
    let mut messages = api
        .subscribe(
            &CallContext::new(),
            SubscribeRequest::new("orders", 0).with_start_position(StartPosition::Earliest),
        )
        .await
        .unwrap();
    publish_sync(&api, "orders", 0, "c").await;
    api.set_stream_readonly(
        &CallContext::new(),
        SetStreamReadonlyRequest {
            name: "orders".to_string(),
            partitions: vec![],
            readonly: true,
        },
    )
    .await
    .unwrap();

    assert!(next(&mut messages).await.unwrap().is_empty_frame());
    assert_eq!(next(&mut messages).await.unwrap().value, Bytes::from_static(b"a"));
    assert_eq!(next(&mut messages).await.unwrap().value, Bytes::from_static(b"b"));
    let err = next(&mut messages).await.unwrap_err();
    assert_eq!(err.code, Code::ResourceExhausted);
}

#[tokio::test]
async fn test_publish_resumes_only_target_partition() {
    let api = single_node().await;
    create(&api, "orders", 2).await;
    api.pause_stream(
        &CallContext::new(),
        PauseStreamRequest {
            name: "orders".to_string(),
            partitions: vec![],
            resume_all: false,
        },
    )
    .await
    .unwrap();

    let err = api
        .subscribe(&CallContext::new(), SubscribeRequest::new("orders", 1))
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);

    assert_eq!(publish_sync(&api, "orders", 0, "wake").await, 0);

    let metadata = api
        .fetch_metadata(&CallContext::new(), &["orders".to_string()])
        .await
        .unwrap();
    let partitions = &metadata.streams[0].partitions;
    assert!(!partitions[&0].paused);
    assert!(partitions[&1].paused);
}

#[tokio::test]
async fn test_publish_resumes_all_partitions() {
    let api = single_node().await;
    create(&api, "orders", 2).await;
    api.pause_stream(
        &CallContext::new(),
        PauseStreamRequest {
            name: "orders".to_string(),
            partitions: vec![],
            resume_all: true,
        },
    )
    .await
    .unwrap();

    publish_sync(&api, "orders", 1, "wake").await;

    let metadata = api
        .fetch_metadata(&CallContext::new(), &[])
        .await
        .unwrap();
    assert!(metadata.streams[0].partitions.values().all(|p| !p.paused));
}

async fn pause_first_resume_all(api: &ApiHandler) {
    api.pause_stream(
        &CallContext::new(),
        PauseStreamRequest {
            name: "orders".to_string(),
            partitions: vec![0],
            resume_all: true,
        },
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_publish_to_live_partition_resumes_all() {
    let api = single_node().await;
    create(&api, "orders", 2).await;
    pause_first_resume_all(&api).await;
    assert!(api.broker().resume_all("orders"));

    assert_eq!(publish_sync(&api, "orders", 1, "live").await, 0);

    let metadata = api
        .fetch_metadata(&CallContext::new(), &[])
        .await
        .unwrap();
    assert!(metadata.streams[0].partitions.values().all(|p| !p.paused));
    assert!(!api.broker().resume_all("orders"));
}

#[tokio::test]
async fn test_resuming_subscribe_to_live_partition_resumes_all() {
    let api = single_node().await;
    create(&api, "orders", 2).await;
    pause_first_resume_all(&api).await;

    let _messages = subscribe(&api, SubscribeRequest::new("orders", 1).with_resume(true)).await;

    let partition = api.broker().partition("orders", 0).unwrap();
    assert!(!partition.is_paused().await);
    assert!(!api.broker().resume_all("orders"));
}

#[tokio::test]
async fn test_failed_resume_keeps_resume_all_flag() {
    let api = single_node().await;
    create(&api, "orders", 2).await;
    pause_first_resume_all(&api).await;

    // A node that left the cluster cannot propose the resume.
    api.broker().shutdown().await.unwrap();
    assert!(
        api.publish(&sync_ctx(), PublishRequest::new("orders", "x").with_partition(1))
            .await
            .is_err()
    );
    assert!(api.broker().resume_all("orders"));
}

#[tokio::test]
async fn test_subscribe_with_resume_and_explicit_resume() {
    let api = single_node().await;
    create(&api, "orders", 2).await;
    publish_sync(&api, "orders", 0, "kept").await;
    api.pause_stream(
        &CallContext::new(),
        PauseStreamRequest {
            name: "orders".to_string(),
            partitions: vec![0],
            resume_all: false,
        },
    )
    .await
    .unwrap();

    let mut messages = subscribe(
        &api,
        SubscribeRequest::new("orders", 0)
            .with_start_position(StartPosition::Earliest)
            .with_resume(true),
    )
    .await;
    let msg = next(&mut messages).await.unwrap();
    assert_eq!(msg.value, Bytes::from_static(b"kept"));

    api.pause_stream(
        &CallContext::new(),
        PauseStreamRequest {
            name: "orders".to_string(),
            partitions: vec![1],
            resume_all: false,
        },
    )
    .await
    .unwrap();
    api.resume_stream(
        &CallContext::new(),
        ResumeStreamRequest {
            name: "orders".to_string(),
            partitions: vec![],
        },
    )
    .await
    .unwrap();
    let metadata = api
        .fetch_metadata(&CallContext::new(), &[])
        .await
        .unwrap();
    assert!(metadata.streams[0].partitions.values().all(|p| !p.paused));
}

#[tokio::test]
async fn test_pausing_ends_subscriptions() {
    let api = single_node().await;
    create(&api, "orders", 1).await;
    let mut messages = subscribe(&api, SubscribeRequest::new("orders", 0)).await;

    api.pause_stream(
        &CallContext::new(),
        PauseStreamRequest {
            name: "orders".to_string(),
            partitions: vec![],
            resume_all: false,
        },
    )
    .await
    .unwrap();

    let err = next(&mut messages).await.unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
}

#[tokio::test]
async fn test_delete_ends_subscriptions() {
    let api = single_node().await;
    create(&api, "orders", 1).await;
    let mut messages = subscribe(&api, SubscribeRequest::new("orders", 0)).await;

    api.delete_stream(&CallContext::new(), "orders").await.unwrap();

    let err = next(&mut messages).await.unwrap_err();
    assert_eq!(err.code, Code::NotFound);
    assert!(api.broker().partition("orders", 0).is_none());
}

#[tokio::test]
async fn test_dropping_stream_stops_subscription() {
    let api = single_node().await;
    create(&api, "orders", 1).await;
    let partition = api.broker().partition("orders", 0).unwrap();

    let messages = subscribe(&api, SubscribeRequest::new("orders", 0)).await;
    assert_eq!(partition.subscriber_count(), 1);
    drop(messages);

    tokio::time::timeout(WAIT, async {
        while partition.subscriber_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscription task did not stop");
}

// ============================================================================
// Async publish
// ============================================================================

#[tokio::test]
async fn test_publish_async_correlates_acks_and_errors() {
    let api = single_node().await;
    create(&api, "orders", 1).await;

    let requests = vec![
        PublishRequest::new("orders", "a").with_correlation_id("c1"),
        PublishRequest::new("missing", "b").with_correlation_id("c2"),
        PublishRequest::new("orders", "c").with_correlation_id("c3"),
    ];
    let mut responses = api
        .publish_async(&CallContext::new(), stream::iter(requests))
        .await
        .unwrap();

    let mut acked = Vec::new();
    let mut failed = Vec::new();
    while let Some(frame) = tokio::time::timeout(WAIT, responses.recv())
        .await
        .expect("timed out waiting for async frames")
    {
        match (frame.ack, frame.error) {
            (Some(ack), None) => acked.push((ack.correlation_id, ack.offset)),
            (None, Some(error)) => failed.push((frame.correlation_id, error.code)),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    acked.sort();
    assert_eq!(acked, vec![("c1".to_string(), 0), ("c3".to_string(), 1)]);
    assert_eq!(
        failed,
        vec![("c2".to_string(), PublishAsyncErrorCode::NotFound)]
    );
}

#[tokio::test]
async fn test_publish_async_cancel_with_unread_responses() {
    let api = single_node().await;
    let ctx = CallContext::new();

    let requests = (0..10_000).map(|i| {
        PublishRequest::new("missing", "x").with_correlation_id(format!("c{}", i))
    });
    let mut responses = api
        .publish_async(&ctx, stream::iter(requests))
        .await
        .unwrap();

    // Let the error frames fill the response channel, then cancel without
    // reading.
    tokio::time::sleep(Duration::from_millis(200)).await;
    ctx.cancel.cancel();

    tokio::time::timeout(WAIT, async {
        loop {
            match responses.try_recv() {
                Ok(_) => {}
                Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await
    .expect("async session kept running after cancel");
}

// ============================================================================
// Partition metadata
// ============================================================================

#[tokio::test]
async fn test_fetch_partition_metadata() {
    let api = single_node().await;
    create(&api, "orders", 1).await;
    publish_sync(&api, "orders", 0, "a").await;
    publish_sync(&api, "orders", 0, "b").await;

    let metadata = api
        .fetch_partition_metadata(&CallContext::new(), "orders", 0)
        .await
        .unwrap();
    assert_eq!(metadata.high_watermark, 1);
    assert_eq!(metadata.newest_offset, 1);
    assert_eq!(metadata.metadata.leader, 1);

    let err = api
        .fetch_partition_metadata(&CallContext::new(), "orders", 9)
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::NotFound);
}
