//! Partition replication across brokers sharing an in-process transport.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use object_store::ObjectStore;
use object_store::memory::InMemory;

use logbridge::cluster::{ApiHandler, Broker, BrokerConfig, LocalCluster, MessageStream};
use logbridge::error::Code;
use logbridge::transport::{LocalTransport, Transport};
use logbridge::types::{
    AckPolicy, CallContext, CreateStreamRequest, Message, PublishRequest, StartPosition,
    StreamConfig, SubscribeRequest,
};

const WAIT: Duration = Duration::from_secs(10);

async fn start_cluster(nodes: u64) -> Vec<ApiHandler> {
    start_cluster_with(nodes, |config| config).await
}

async fn start_cluster_with(
    nodes: u64,
    customize: impl Fn(BrokerConfig) -> BrokerConfig,
) -> Vec<ApiHandler> {
    let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new());
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let cluster = LocalCluster::new();
    let mut handlers = Vec::new();
    for node_id in 1..=nodes {
        let config = customize(
            BrokerConfig::default()
                .with_node_id(node_id)
                .with_replica_max_idle_wait(Duration::from_millis(50))
                .with_auto_pause_check_interval(Duration::from_millis(100)),
        );
        let broker = Broker::start_local(config, transport.clone(), store.clone(), &cluster)
            .await
            .expect("broker should start");
        handlers.push(ApiHandler::new(broker));
    }
    handlers
}

async fn create_replicated(api: &ApiHandler) {
    api.create_stream(
        &CallContext::new(),
        CreateStreamRequest::new("orders", "orders").with_replication_factor(2),
    )
    .await
    .expect("create stream");
}

async fn publish_all(api: &ApiHandler, value: &'static str) -> i64 {
    api.publish(
        &CallContext::with_timeout(WAIT),
        PublishRequest::new("orders", value).with_ack_policy(AckPolicy::All),
    )
    .await
    .expect("publish")
    .ack
    .expect("ack")
    .offset
}

/// Wait until the node's local replica holds `newest` with the given
/// high-watermark.
async fn wait_for_replica(api: &ApiHandler, newest: i64, high_watermark: i64) {
    let partition = api.broker().partition("orders", 0).expect("local replica");
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(log) = partition.log().await
                && log.newest_offset() == newest
                && log.high_watermark() == high_watermark
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("replica did not catch up");
}

async fn next(messages: &mut MessageStream) -> Message {
    tokio::time::timeout(WAIT, messages.next())
        .await
        .expect("timed out waiting for a message")
        .expect("subscription ended")
        .expect("message")
}

#[tokio::test]
async fn test_ack_all_waits_for_follower() {
    let nodes = start_cluster(2).await;
    create_replicated(&nodes[0]).await;

    assert_eq!(publish_all(&nodes[0], "a").await, 0);
    assert_eq!(publish_all(&nodes[0], "b").await, 1);

    let metadata = nodes[0]
        .fetch_partition_metadata(&CallContext::new(), "orders", 0)
        .await
        .unwrap();
    assert_eq!(metadata.high_watermark, 1);
    assert_eq!(metadata.metadata.isr, vec![1, 2]);

    wait_for_replica(&nodes[1], 1, 1).await;
    let follower_log = nodes[1]
        .broker()
        .partition("orders", 0)
        .unwrap()
        .log()
        .await
        .unwrap();
    assert_eq!(
        follower_log.read(1).await.unwrap().unwrap().value,
        Bytes::from_static(b"b")
    );
}

#[tokio::test]
async fn test_follower_metadata_requires_leader() {
    let nodes = start_cluster(2).await;
    create_replicated(&nodes[0]).await;

    let err = nodes[1]
        .fetch_partition_metadata(&CallContext::new(), "orders", 0)
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
}

#[tokio::test]
async fn test_read_from_isr_replica() {
    let nodes = start_cluster(2).await;
    create_replicated(&nodes[0]).await;
    publish_all(&nodes[0], "a").await;
    wait_for_replica(&nodes[1], 0, 0).await;

    let err = nodes[1]
        .subscribe(&CallContext::new(), SubscribeRequest::new("orders", 0))
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);

    let mut messages = nodes[1]
        .subscribe(
            &CallContext::new(),
            SubscribeRequest::new("orders", 0)
                .with_start_position(StartPosition::Earliest)
                .with_read_isr_replica(true),
        )
        .await
        .unwrap();
    assert!(next(&mut messages).await.is_empty_frame());
    let msg = next(&mut messages).await;
    assert_eq!(msg.offset, 0);
    assert_eq!(msg.value, Bytes::from_static(b"a"));
}

#[tokio::test]
async fn test_change_leader_keeps_log() {
    let nodes = start_cluster(2).await;
    create_replicated(&nodes[0]).await;
    publish_all(&nodes[0], "before").await;
    wait_for_replica(&nodes[1], 0, 0).await;

    nodes[0]
        .change_leader(&CallContext::new(), "orders", 0, 2)
        .await
        .unwrap();

    let new_leader = nodes[1].broker().partition("orders", 0).unwrap();
    assert!(new_leader.is_leader().await);
    assert_eq!(new_leader.descriptor().await.leader_epoch, 1);
    assert!(!nodes[0].broker().partition("orders", 0).unwrap().is_leader().await);

    // Let the old leader's ingestion subscription wind down.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(publish_all(&nodes[0], "after").await, 1);
    wait_for_replica(&nodes[0], 1, 1).await;

    let mut messages = nodes[1]
        .subscribe(
            &CallContext::new(),
            SubscribeRequest::new("orders", 0).with_start_position(StartPosition::Earliest),
        )
        .await
        .unwrap();
    assert!(next(&mut messages).await.is_empty_frame());
    assert_eq!(next(&mut messages).await.value, Bytes::from_static(b"before"));
    assert_eq!(next(&mut messages).await.value, Bytes::from_static(b"after"));
}

#[tokio::test]
async fn test_change_leader_outside_isr_rejected() {
    let nodes = start_cluster(3).await;
    create_replicated(&nodes[0]).await;

    // Partition 0 is replicated on nodes 1 and 2 only.
    let err = nodes[0]
        .change_leader(&CallContext::new(), "orders", 0, 3)
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
}

#[tokio::test]
async fn test_lagging_follower_leaves_isr() {
    let nodes = start_cluster_with(2, |config| {
        config.with_replica_max_lag_time(Duration::from_millis(300))
    })
    .await;
    create_replicated(&nodes[0]).await;
    nodes[1].broker().shutdown().await.unwrap();

    tokio::time::timeout(WAIT, async {
        loop {
            let desc = nodes[0]
                .broker()
                .metadata()
                .partition("orders", 0)
                .await
                .unwrap();
            if desc.isr == vec![1] {
                assert_eq!(desc.replicas, vec![1, 2]);
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("ISR was not shrunk");

    // Commits no longer wait for the stopped follower.
    assert_eq!(publish_all(&nodes[0], "a").await, 0);
}

async fn create_auto_pausing(api: &ApiHandler, name: &str, disable_if_subscribers: bool) {
    let config = StreamConfig {
        auto_pause_time: Some(Duration::from_millis(200)),
        auto_pause_disable_if_subscribers: Some(disable_if_subscribers),
        ..Default::default()
    };
    api.create_stream(
        &CallContext::new(),
        CreateStreamRequest::new(name, name).with_config(config),
    )
    .await
    .expect("create stream");
}

#[tokio::test]
async fn test_idle_partition_is_auto_paused() {
    let nodes = start_cluster(1).await;
    create_auto_pausing(&nodes[0], "idle", false).await;

    let partition = nodes[0].broker().partition("idle", 0).unwrap();
    tokio::time::timeout(WAIT, async {
        while !partition.is_paused().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("partition was not auto-paused");
    assert!(partition.log().await.is_none());

    // Publishing resumes it.
    let offset = nodes[0]
        .publish(
            &CallContext::with_timeout(WAIT),
            PublishRequest::new("idle", "wake"),
        )
        .await
        .unwrap()
        .ack
        .unwrap()
        .offset;
    assert_eq!(offset, 0);
    assert!(!partition.is_paused().await);
}

#[tokio::test]
async fn test_auto_pause_skipped_while_subscribed() {
    let nodes = start_cluster(1).await;
    create_auto_pausing(&nodes[0], "watched", true).await;

    let mut messages = nodes[0]
        .subscribe(&CallContext::new(), SubscribeRequest::new("watched", 0))
        .await
        .unwrap();
    assert!(next(&mut messages).await.is_empty_frame());

    tokio::time::sleep(Duration::from_millis(700)).await;
    let partition = nodes[0].broker().partition("watched", 0).unwrap();
    assert!(!partition.is_paused().await);
    assert_eq!(partition.subscriber_count(), 1);
}
