//! Leader-side replication.
//!
//! Followers pull: each request carries the newest offset the follower holds
//! and the leader answers with every entry after it, in offset order. A
//! follower that is already at the tail is held for up to
//! `replica_max_idle_wait` so that new entries reach it without a request
//! storm.
//!
//! ```text
//!   replication subject ──► dispatcher ──► Replicator(follower 2) ──► reply inbox
//!                                    └───► Replicator(follower 3) ──► reply inbox
//! ```
//!
//! The dispatcher and every replicator live in the leader role's scope and end
//! with it; the subscription is dropped with the dispatcher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::commit_log::{CommitLog, CommitLogResult};
use super::error::BrokerResult;
use super::metrics;
use super::partition::Partition;
use super::raft::PartitionDescriptor;
use crate::constants::REPLICATION_QUEUE_CAPACITY;
use crate::protocol::{ReplicationRequest, ReplicationResponse, decode_envelope, encode_envelope};
use crate::transport::Subscription;
use crate::types::{NodeId, Offset};

struct ReplicationCall {
    request: ReplicationRequest,
    reply: String,
}

/// Subscribe to the partition's replication subject and start one replicator
/// per follower.
pub(crate) async fn start(
    partition: Arc<Partition>,
    log: Arc<CommitLog>,
    desc: &PartitionDescriptor,
    scope: CancellationToken,
) -> BrokerResult<()> {
    let subject = partition.replication_subject();
    let subscription = partition.context().transport.subscribe(&subject).await?;

    let mut replicators = HashMap::new();
    for replica in desc
        .replicas
        .iter()
        .copied()
        .filter(|r| *r != partition.node_id())
    {
        let (tx, rx) = mpsc::channel(REPLICATION_QUEUE_CAPACITY);
        let replicator = Replicator {
            partition: partition.clone(),
            log: log.clone(),
            replica,
            epoch: desc.leader_epoch,
            idle_wait: partition.context().config.replica_max_idle_wait,
        };
        tokio::spawn(replicator.run(rx, scope.clone()));
        replicators.insert(replica, tx);
    }

    debug!(
        stream = partition.stream(),
        partition = partition.id(),
        subject = %subject,
        followers = replicators.len(),
        "Started replicators"
    );
    tokio::spawn(dispatch(subscription, replicators, scope));
    Ok(())
}

async fn dispatch(
    mut subscription: Subscription,
    replicators: HashMap<NodeId, mpsc::Sender<ReplicationCall>>,
    scope: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            biased;
            () = scope.cancelled() => break,
            msg = subscription.next() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let Some(reply) = msg.reply else {
            trace!(subject = %msg.subject, "Replication request without reply subject");
            continue;
        };
        let request: ReplicationRequest = match decode_envelope(&msg.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(subject = %msg.subject, error = %e, "Malformed replication request");
                metrics::REPLICATION_REQUESTS
                    .with_label_values(&["malformed"])
                    .inc();
                continue;
            }
        };
        let Some(tx) = replicators.get(&request.replica_id) else {
            warn!(
                subject = %msg.subject,
                replica = request.replica_id,
                "Replication request from unknown replica"
            );
            metrics::REPLICATION_REQUESTS
                .with_label_values(&["unknown_replica"])
                .inc();
            continue;
        };
        if tx.try_send(ReplicationCall { request, reply }).is_err() {
            metrics::REPLICATION_REQUESTS
                .with_label_values(&["dropped"])
                .inc();
        }
    }
    trace!(subject = subscription.subject(), "Replication dispatcher stopped");
}

/// Serves catch-up requests from one follower.
pub(crate) struct Replicator {
    partition: Arc<Partition>,
    log: Arc<CommitLog>,
    replica: NodeId,
    epoch: u64,
    idle_wait: Duration,
}

impl Replicator {
    async fn run(self, mut rx: mpsc::Receiver<ReplicationCall>, scope: CancellationToken) {
        loop {
            let call = tokio::select! {
                biased;
                () = scope.cancelled() => break,
                call = rx.recv() => match call {
                    Some(call) => call,
                    None => break,
                },
            };
            let response = match self.serve(&call.request, &scope).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        stream = self.partition.stream(),
                        partition = self.partition.id(),
                        replica = self.replica,
                        error = %e,
                        "Failed to serve replication request"
                    );
                    metrics::REPLICATION_REQUESTS
                        .with_label_values(&["error"])
                        .inc();
                    continue;
                }
            };
            if scope.is_cancelled() {
                break;
            }
            let payload = match encode_envelope(&response) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(replica = self.replica, error = %e, "Failed to encode replication response");
                    continue;
                }
            };
            if let Err(e) = self
                .partition
                .context()
                .transport
                .publish(&call.reply, payload)
                .await
            {
                debug!(replica = self.replica, error = %e, "Failed to send replication response");
            }
        }
        trace!(replica = self.replica, "Replicator stopped");
    }

    async fn serve(
        &self,
        request: &ReplicationRequest,
        scope: &CancellationToken,
    ) -> BrokerResult<ReplicationResponse> {
        if request.leader_epoch != self.epoch {
            debug!(
                replica = self.replica,
                requested = request.leader_epoch,
                epoch = self.epoch,
                "Replication request for another leader epoch"
            );
            metrics::REPLICATION_REQUESTS
                .with_label_values(&["stale_epoch"])
                .inc();
            return Ok(ReplicationResponse {
                leader_epoch: self.epoch,
                leader_hw: self.log.high_watermark(),
                entries: Vec::new(),
            });
        }

        self.partition
            .record_progress(
                &self.log,
                self.replica,
                request.high_watermark,
                self.log.newest_offset(),
                self.epoch,
            )
            .await?;

        let response = catch_up_response(
            &self.log,
            request.high_watermark,
            self.epoch,
            self.idle_wait,
            scope,
        )
        .await?;
        metrics::REPLICATION_REQUESTS
            .with_label_values(&["ok"])
            .inc();
        metrics::REPLICATED_ENTRIES.inc_by(response.entries.len() as u64);
        Ok(response)
    }
}

/// Every entry after `after` up to the current tail, in offset order.
///
/// When there is nothing to send, waits up to `idle_wait` for an append.
pub(crate) async fn catch_up_response(
    log: &CommitLog,
    after: Offset,
    epoch: u64,
    idle_wait: Duration,
    cancel: &CancellationToken,
) -> CommitLogResult<ReplicationResponse> {
    if after >= log.newest_offset() {
        log.wait_for_append(after, idle_wait, cancel).await;
    }
    let entries = log.read_range(after, log.newest_offset(), usize::MAX).await?;
    Ok(ReplicationResponse {
        leader_epoch: epoch,
        leader_hw: log.high_watermark(),
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::commit_log::{CommitLogOptions, entry};
    use bytes::Bytes;
    use object_store::memory::InMemory;

    async fn log_with(values: &[&'static str]) -> Arc<CommitLog> {
        let log = CommitLog::open(
            "replicator-test",
            Arc::new(InMemory::new()),
            "replicator-test",
            CommitLogOptions::default(),
        )
        .await
        .unwrap();
        for value in values {
            log.append(entry(*value)).await.unwrap();
        }
        log
    }

    #[tokio::test]
    async fn test_returns_everything_after_request_in_order() {
        let log = log_with(&["a", "b", "c", "d", "e"]).await;
        log.set_high_watermark(2).await.unwrap();

        let response = catch_up_response(
            &log,
            1,
            3,
            Duration::from_millis(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // Uncommitted entries are shipped too; the follower commits by leader_hw.
        let offsets: Vec<_> = response.entries.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![2, 3, 4]);
        assert_eq!(response.entries[0].entry.value, Bytes::from_static(b"c"));
        assert_eq!(response.leader_hw, 2);
        assert_eq!(response.leader_epoch, 3);
    }

    #[tokio::test]
    async fn test_fresh_follower_gets_whole_log() {
        let log = log_with(&["a", "b"]).await;
        let response = catch_up_response(
            &log,
            -1,
            0,
            Duration::from_millis(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(response.entries.len(), 2);
        assert_eq!(response.entries[0].offset, 0);
    }

    #[tokio::test]
    async fn test_caught_up_follower_waits_for_append() {
        let log = log_with(&["a"]).await;
        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(entry("b")).await.unwrap();
        });

        let response = catch_up_response(
            &log,
            0,
            0,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(response.entries.len(), 1);
        assert_eq!(response.entries[0].offset, 1);
    }

    #[tokio::test]
    async fn test_idle_wait_expires_empty() {
        let log = log_with(&["a"]).await;
        let response = catch_up_response(
            &log,
            0,
            0,
            Duration::from_millis(20),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(response.entries.is_empty());
    }
}
