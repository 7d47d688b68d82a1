//! Runtime of one local partition replica.
//!
//! A [`Partition`] exists on every node listed in the partition's replica set.
//! It owns the partition's commit log and switches between the roles of
//! [`PartitionRole`] whenever the replicated descriptor changes:
//!
//! - **Leader**: queue-subscribes to the ingestion subject, appends every
//!   inbound message, publishes acks and serves follower catch-up requests.
//! - **Follower**: truncates its log to the persisted high-watermark and runs
//!   the catch-up agent against the leader.
//!
//! Role transitions are serialized by the role lock. Appends, reads and
//! replication never take it.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::broker::NodeContext;
use super::catchup::CatchUpAgent;
use super::commit_log::{CommitLog, CommitLogOptions, RetentionPolicy};
use super::error::{BrokerError, BrokerResult, CommitLogError};
use super::metrics;
use super::partition_state::PartitionRole;
use super::raft::{MetadataOp, PartitionDescriptor, StreamDescriptor};
use super::replicator;
use crate::constants::{REPLY_HEADER, SUBJECT_HEADER};
use crate::protocol::{IngestMessage, LogEntry, ProtocolError, decode_envelope, encode_envelope};
use crate::transport::{Subscription, TransportMessage};
use crate::types::{Ack, AckPolicy, NodeId, Offset, PartitionId, StreamConfig, now_millis};

/// Leader-side view of one follower.
#[derive(Debug, Clone)]
pub(crate) struct FollowerProgress {
    /// Newest offset the follower reported holding.
    pub offset: Offset,
    /// Last time the follower was within the ISR lag threshold.
    pub last_caught_up: Instant,
    /// An ExpandIsr proposal for this follower is in flight.
    pub expanding: bool,
}

impl FollowerProgress {
    fn new() -> Self {
        Self {
            offset: -1,
            last_caught_up: Instant::now(),
            expanding: false,
        }
    }
}

/// One local replica of a partition.
pub struct Partition {
    ctx: Arc<NodeContext>,
    stream: String,
    id: PartitionId,
    /// Base subject of the stream, used to derive the replication subject.
    stream_subject: String,
    config: StreamConfig,
    descriptor: RwLock<PartitionDescriptor>,
    /// Latest log handle. Kept after close so a paused partition can still be
    /// deleted.
    log: RwLock<Option<Arc<CommitLog>>>,
    role: Mutex<PartitionRole>,
    followers: DashMap<NodeId, FollowerProgress>,
    /// `AckPolicy::All` acks waiting for the high-watermark.
    pending_acks: Mutex<Vec<Ack>>,
    subscribers: AtomicUsize,
    /// Milliseconds since the epoch of the last append or role change.
    last_activity: AtomicI64,
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("stream", &self.stream)
            .field("id", &self.id)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Partition {
    pub(crate) fn new(
        ctx: Arc<NodeContext>,
        stream: &StreamDescriptor,
        descriptor: PartitionDescriptor,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            stream: stream.name.clone(),
            id: descriptor.id,
            stream_subject: stream.subject.clone(),
            config: stream.config.clone(),
            descriptor: RwLock::new(descriptor),
            log: RwLock::new(None),
            role: Mutex::new(PartitionRole::Idle),
            followers: DashMap::new(),
            pending_acks: Mutex::new(Vec::new()),
            subscribers: AtomicUsize::new(0),
            last_activity: AtomicI64::new(now_millis()),
        })
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub(crate) fn node_id(&self) -> NodeId {
        self.ctx.node_id
    }

    pub(crate) fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub async fn descriptor(&self) -> PartitionDescriptor {
        self.descriptor.read().await.clone()
    }

    pub async fn is_paused(&self) -> bool {
        self.descriptor.read().await.paused
    }

    pub async fn is_readonly(&self) -> bool {
        self.descriptor.read().await.readonly
    }

    /// Whether the replicated topology names this node as leader.
    pub async fn is_leader(&self) -> bool {
        let desc = self.descriptor.read().await;
        desc.leader == self.ctx.node_id && !desc.paused
    }

    /// The open commit log, `None` while the partition is paused.
    pub async fn log(&self) -> Option<Arc<CommitLog>> {
        self.log
            .read()
            .await
            .as_ref()
            .filter(|log| !log.is_closed())
            .cloned()
    }

    pub async fn role_name(&self) -> &'static str {
        self.role.lock().await.role_name()
    }

    pub fn replication_subject(&self) -> String {
        crate::protocol::replication_subject(
            &self.ctx.config.namespace,
            &self.stream_subject,
            &self.stream,
            self.id,
        )
    }

    // ========================================================================
    // Subscribers and activity
    // ========================================================================

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Acquire)
    }

    /// Count a live subscriber until the guard is dropped.
    pub(crate) fn track_subscriber(self: &Arc<Self>) -> SubscriberGuard {
        self.subscribers.fetch_add(1, Ordering::AcqRel);
        metrics::ACTIVE_SUBSCRIBERS.inc();
        SubscriberGuard {
            partition: self.clone(),
        }
    }

    fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Release);
    }

    /// Time since the last append or role change.
    pub fn idle_for(&self) -> Duration {
        let idle = now_millis() - self.last_activity.load(Ordering::Acquire);
        Duration::from_millis(idle.max(0) as u64)
    }

    // ========================================================================
    // Role transitions
    // ========================================================================

    /// Bring the local replica in line with `desc`.
    ///
    /// Called while a metadata operation is applied. Must not propose.
    pub(crate) async fn reconcile(self: &Arc<Self>, desc: PartitionDescriptor) -> BrokerResult<()> {
        let mut role = self.role.lock().await;
        *self.descriptor.write().await = desc.clone();
        let node_id = self.ctx.node_id;

        if desc.paused || !desc.is_replica(node_id) {
            role.exit();
            self.clear_leader_state().await;
            if let Some(log) = self.log.read().await.clone() {
                log.close().await?;
            }
            info!(
                stream = %self.stream,
                partition = self.id,
                paused = desc.paused,
                "Partition stopped"
            );
            return Ok(());
        }

        let log = self.open_log().await?;
        if log.is_readonly() != desc.readonly {
            log.set_readonly(desc.readonly).await?;
            info!(
                stream = %self.stream,
                partition = self.id,
                readonly = desc.readonly,
                "Changed partition readonly flag"
            );
        }

        if role.matches(node_id, desc.leader, desc.leader_epoch) {
            if role.is_leader() {
                // ISR may have changed.
                self.advance_high_watermark(&log).await?;
            }
            return Ok(());
        }

        role.exit();
        self.clear_leader_state().await;
        self.touch();
        *role = if desc.leader == node_id {
            self.become_leader(&log, &desc).await?
        } else {
            self.become_follower(&log, desc.leader, desc.leader_epoch)
                .await?
        };
        Ok(())
    }

    async fn become_leader(
        self: &Arc<Self>,
        log: &Arc<CommitLog>,
        desc: &PartitionDescriptor,
    ) -> BrokerResult<PartitionRole> {
        let mut role = PartitionRole::leader(desc.leader_epoch);
        let Some(scope) = role.scope().cloned() else {
            return Ok(role);
        };

        for replica in desc.replicas.iter().filter(|r| **r != self.ctx.node_id) {
            self.followers.insert(*replica, FollowerProgress::new());
        }

        if let Err(e) = self.start_leader_tasks(log, desc, scope).await {
            role.exit();
            return Err(e);
        }
        self.advance_high_watermark(log).await?;

        info!(
            stream = %self.stream,
            partition = self.id,
            epoch = desc.leader_epoch,
            newest = log.newest_offset(),
            high_watermark = log.high_watermark(),
            "Became partition leader"
        );
        Ok(role)
    }

    async fn start_leader_tasks(
        self: &Arc<Self>,
        log: &Arc<CommitLog>,
        desc: &PartitionDescriptor,
        scope: CancellationToken,
    ) -> BrokerResult<()> {
        let ingestion = self
            .ctx
            .transport
            .queue_subscribe(&desc.subject, &desc.group)
            .await?;
        replicator::start(self.clone(), log.clone(), desc, scope.clone()).await?;

        let partition = self.clone();
        let log = log.clone();
        let epoch = desc.leader_epoch;
        tokio::spawn(async move {
            partition.run_ingestion(log, ingestion, epoch, scope).await;
        });
        Ok(())
    }

    async fn become_follower(
        self: &Arc<Self>,
        log: &Arc<CommitLog>,
        leader: NodeId,
        epoch: u64,
    ) -> BrokerResult<PartitionRole> {
        // Entries past the persisted high-watermark may never have been
        // committed by any leader.
        log.truncate(log.high_watermark()).await?;

        let role = PartitionRole::follower(leader, epoch);
        if let Some(scope) = role.scope() {
            CatchUpAgent::new(
                self.ctx.transport.clone(),
                log.clone(),
                self.replication_subject(),
                self.ctx.node_id,
                epoch,
                self.ctx.config.replica_fetch_timeout,
            )
            .spawn(scope.clone());
        }

        info!(
            stream = %self.stream,
            partition = self.id,
            leader,
            epoch,
            newest = log.newest_offset(),
            "Became partition follower"
        );
        Ok(role)
    }

    async fn clear_leader_state(&self) {
        self.followers.clear();
        self.pending_acks.lock().await.clear();
    }

    async fn open_log(&self) -> BrokerResult<Arc<CommitLog>> {
        let mut slot = self.log.write().await;
        if let Some(log) = slot.as_ref()
            && !log.is_closed()
        {
            return Ok(log.clone());
        }
        let log = self.open_log_handle().await?;
        *slot = Some(log.clone());
        Ok(log)
    }

    async fn open_log_handle(&self) -> BrokerResult<Arc<CommitLog>> {
        let options = CommitLogOptions {
            flush_interval: self.ctx.config.log_flush_interval,
            await_durable: self.ctx.config.log_await_durable,
            retention: RetentionPolicy::from_config(&self.config),
        };
        Ok(CommitLog::open(
            format!("{}/{}", self.stream, self.id),
            self.ctx.store.clone(),
            &self.ctx.config.partition_path(&self.stream, self.id),
            options,
        )
        .await?)
    }

    /// Stop every role task and close the log, keeping its data.
    pub(crate) async fn shutdown(&self) -> BrokerResult<()> {
        let mut role = self.role.lock().await;
        role.exit();
        self.clear_leader_state().await;
        if let Some(log) = self.log.write().await.take() {
            log.close().await?;
        }
        Ok(())
    }

    /// Stop every role task and delete the log with its data.
    pub(crate) async fn delete(&self) -> BrokerResult<()> {
        let mut role = self.role.lock().await;
        role.exit();
        self.clear_leader_state().await;
        let existing = self.log.write().await.take();
        let log = match existing {
            Some(log) => log,
            None => self.open_log_handle().await?,
        };
        log.delete().await?;
        info!(stream = %self.stream, partition = self.id, "Partition deleted");
        Ok(())
    }

    // ========================================================================
    // Ingestion (leader)
    // ========================================================================

    async fn run_ingestion(
        self: Arc<Self>,
        log: Arc<CommitLog>,
        mut subscription: Subscription,
        epoch: u64,
        scope: CancellationToken,
    ) {
        debug!(
            stream = %self.stream,
            partition = self.id,
            subject = subscription.subject(),
            "Ingestion started"
        );
        loop {
            let msg = tokio::select! {
                biased;
                () = scope.cancelled() => break,
                msg = subscription.next() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            match self.ingest(&log, msg, epoch).await {
                Ok(()) => {}
                Err(BrokerError::CommitLog(
                    CommitLogError::Closed | CommitLogError::Deleted,
                )) => break,
                Err(e) => {
                    warn!(stream = %self.stream, partition = self.id, error = %e, "Dropped inbound message");
                }
            }
        }
        debug!(stream = %self.stream, partition = self.id, "Ingestion stopped");
    }

    async fn ingest(&self, log: &CommitLog, msg: TransportMessage, epoch: u64) -> BrokerResult<()> {
        let (entry, request) = decode_ingest(&msg, epoch)?;
        let appended = log.append(entry).await?;
        self.touch();
        metrics::MESSAGES_APPENDED
            .with_label_values(&[self.stream.as_str()])
            .inc();
        debug!(
            stream = %self.stream,
            partition = self.id,
            offset = appended.offset,
            "Appended message"
        );

        self.advance_high_watermark(log).await?;

        let Some(request) = request else {
            return Ok(());
        };
        let Some(ack_inbox) = request.ack_inbox.filter(|inbox| !inbox.is_empty()) else {
            return Ok(());
        };
        let subject = self.descriptor.read().await.subject.clone();
        let ack = Ack {
            stream: self.stream.clone(),
            partition_subject: subject,
            msg_subject: msg.subject,
            offset: appended.offset,
            ack_inbox,
            correlation_id: request.correlation_id,
            ack_policy: request.ack_policy,
            commit_timestamp: appended.timestamp,
        };
        match ack.ack_policy {
            AckPolicy::None => {}
            AckPolicy::Leader => self.publish_ack(&ack).await,
            AckPolicy::All => {
                self.pending_acks.lock().await.push(ack);
                self.release_acks(log).await;
            }
        }
        Ok(())
    }

    async fn publish_ack(&self, ack: &Ack) {
        let payload = match encode_envelope(ack) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(stream = %self.stream, partition = self.id, error = %e, "Failed to encode ack");
                return;
            }
        };
        match self.ctx.transport.publish(&ack.ack_inbox, payload).await {
            Ok(()) => metrics::ACKS_PUBLISHED
                .with_label_values(&[ack.ack_policy.as_str()])
                .inc(),
            Err(e) => {
                warn!(stream = %self.stream, partition = self.id, offset = ack.offset, error = %e, "Failed to publish ack")
            }
        }
    }

    /// Publish `AckPolicy::All` acks that are now committed.
    async fn release_acks(&self, log: &CommitLog) {
        let min_isr = self.config.min_isr.unwrap_or(1).max(1) as usize;
        if self.descriptor.read().await.isr.len() < min_isr {
            return;
        }
        let hw = log.high_watermark();
        let ready: Vec<Ack> = {
            let mut pending = self.pending_acks.lock().await;
            let (ready, waiting) = pending.drain(..).partition(|ack| ack.offset <= hw);
            *pending = waiting;
            ready
        };
        for ack in &ready {
            self.publish_ack(ack).await;
        }
    }

    // ========================================================================
    // Replication bookkeeping (leader)
    // ========================================================================

    /// Move the high-watermark to the newest offset every ISR member holds.
    pub(crate) async fn advance_high_watermark(&self, log: &CommitLog) -> BrokerResult<()> {
        let mut hw = log.newest_offset();
        {
            let desc = self.descriptor.read().await;
            for replica in desc.isr.iter().filter(|r| **r != self.ctx.node_id) {
                let offset = self
                    .followers
                    .get(replica)
                    .map(|p| p.offset)
                    .unwrap_or(-1);
                hw = hw.min(offset);
            }
        }
        if hw > log.high_watermark() {
            log.set_high_watermark(hw).await?;
        }
        self.release_acks(log).await;
        Ok(())
    }

    /// Record the offset a follower reported and admit it to the ISR once it
    /// is within the lag threshold of `leader_newest`.
    pub(crate) async fn record_progress(
        self: &Arc<Self>,
        log: &CommitLog,
        replica: NodeId,
        offset: Offset,
        leader_newest: Offset,
        epoch: u64,
    ) -> BrokerResult<()> {
        let caught_up = offset >= leader_newest - self.ctx.config.isr_max_lag_entries;
        let in_isr = self.descriptor.read().await.in_isr(replica);
        let propose_expand = {
            let mut progress = self
                .followers
                .entry(replica)
                .or_insert_with(FollowerProgress::new);
            progress.offset = offset;
            if caught_up {
                progress.last_caught_up = Instant::now();
            }
            let expand = caught_up && !in_isr && !progress.expanding;
            if expand {
                progress.expanding = true;
            }
            expand
        };

        if propose_expand {
            info!(
                stream = %self.stream,
                partition = self.id,
                replica,
                offset,
                "Follower caught up, expanding ISR"
            );
            metrics::ISR_CHANGES.with_label_values(&["expand"]).inc();
            let partition = self.clone();
            let op = MetadataOp::ExpandIsr {
                stream: self.stream.clone(),
                partition: self.id,
                replica,
                leader_epoch: epoch,
            };
            tokio::spawn(async move {
                partition.ctx.propose_logged(op).await;
                if let Some(mut progress) = partition.followers.get_mut(&replica) {
                    progress.expanding = false;
                }
            });
        }

        self.advance_high_watermark(log).await
    }

    /// ShrinkIsr operations for followers that have lagged too long.
    pub(crate) async fn lagging_followers(&self) -> Vec<MetadataOp> {
        if !self.role.lock().await.is_leader() {
            return Vec::new();
        }
        let desc = self.descriptor.read().await.clone();
        let max_lag = self.ctx.config.replica_max_lag_time;
        desc.isr
            .iter()
            .filter(|r| **r != self.ctx.node_id)
            .filter(|r| {
                self.followers
                    .get(*r)
                    .map(|p| p.last_caught_up.elapsed() > max_lag)
                    .unwrap_or(true)
            })
            .map(|replica| {
                warn!(
                    stream = %self.stream,
                    partition = self.id,
                    replica = *replica,
                    "Follower lagging, shrinking ISR"
                );
                metrics::ISR_CHANGES.with_label_values(&["shrink"]).inc();
                MetadataOp::ShrinkIsr {
                    stream: self.stream.clone(),
                    partition: self.id,
                    replica: *replica,
                    leader_epoch: desc.leader_epoch,
                }
            })
            .collect()
    }

    /// A pause operation when this leader has been idle past the stream's
    /// auto-pause time.
    pub(crate) async fn auto_pause_candidate(&self) -> Option<MetadataOp> {
        let after = self.config.auto_pause_time.filter(|d| !d.is_zero())?;
        if !self.is_leader().await {
            return None;
        }
        if self.config.auto_pause_disable_if_subscribers == Some(true)
            && self.subscriber_count() > 0
        {
            return None;
        }
        if self.idle_for() < after {
            return None;
        }
        info!(
            stream = %self.stream,
            partition = self.id,
            idle = ?self.idle_for(),
            "Auto-pausing idle partition"
        );
        Some(MetadataOp::PausePartitions {
            stream: self.stream.clone(),
            partitions: vec![self.id],
            resume_all: false,
        })
    }
}

/// Decrements the live subscriber count on drop.
pub(crate) struct SubscriberGuard {
    partition: Arc<Partition>,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.partition.subscribers.fetch_sub(1, Ordering::AcqRel);
        metrics::ACTIVE_SUBSCRIBERS.dec();
    }
}

/// Turn an inbound transport message into a log entry.
///
/// Payloads that are not envelopes are stored as the raw value.
fn decode_ingest(
    msg: &TransportMessage,
    epoch: u64,
) -> Result<(LogEntry, Option<IngestMessage>), ProtocolError> {
    let (mut entry, request) = match decode_envelope::<IngestMessage>(&msg.payload) {
        Ok(request) => (
            LogEntry {
                key: request.key.clone(),
                value: request.value.clone(),
                headers: request.headers.clone(),
                ..Default::default()
            },
            Some(request),
        ),
        Err(ProtocolError::NotAnEnvelope) => (
            LogEntry {
                value: msg.payload.clone(),
                ..Default::default()
            },
            None,
        ),
        Err(e) => return Err(e),
    };
    entry.leader_epoch = epoch;
    entry.headers.insert(
        SUBJECT_HEADER.to_string(),
        Bytes::from(msg.subject.clone().into_bytes()),
    );
    if let Some(reply) = &msg.reply {
        entry
            .headers
            .insert(REPLY_HEADER.to_string(), Bytes::from(reply.clone().into_bytes()));
    }
    Ok((entry, request))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_envelope_message() {
        let request = IngestMessage {
            key: Bytes::from_static(b"k"),
            value: Bytes::from_static(b"v"),
            stream: "orders".to_string(),
            ack_inbox: Some("_INBOX.1".to_string()),
            correlation_id: "c1".to_string(),
            ..Default::default()
        };
        let msg = TransportMessage {
            subject: "orders".to_string(),
            reply: Some("replies".to_string()),
            payload: encode_envelope(&request).unwrap(),
        };
        let (entry, decoded) = decode_ingest(&msg, 4).unwrap();
        assert_eq!(entry.key, Bytes::from_static(b"k"));
        assert_eq!(entry.value, Bytes::from_static(b"v"));
        assert_eq!(entry.leader_epoch, 4);
        assert_eq!(entry.headers[SUBJECT_HEADER], Bytes::from_static(b"orders"));
        assert_eq!(entry.headers[REPLY_HEADER], Bytes::from_static(b"replies"));
        assert_eq!(decoded.unwrap().correlation_id, "c1");
    }

    #[test]
    fn test_decode_raw_payload() {
        let msg = TransportMessage {
            subject: "orders.1".to_string(),
            reply: None,
            payload: Bytes::from_static(b"plain"),
        };
        let (entry, decoded) = decode_ingest(&msg, 0).unwrap();
        assert!(decoded.is_none());
        assert_eq!(entry.value, Bytes::from_static(b"plain"));
        assert!(!entry.headers.contains_key(REPLY_HEADER));
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let mut payload = encode_envelope(&IngestMessage::default()).unwrap().to_vec();
        payload[4] = 42;
        let msg = TransportMessage {
            subject: "orders".to_string(),
            reply: None,
            payload: Bytes::from(payload),
        };
        assert!(decode_ingest(&msg, 0).is_err());
    }
}
