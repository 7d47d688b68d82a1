//! Tailing subscriptions.
//!
//! Every subscribe call gets a dedicated task that reads the partition log
//! from the resolved start offset and hands each entry to a bounded delivery
//! channel, blocking at the tail until new entries are committed. The task
//! ends when the caller drops its [`MessageStream`] (or cancels the call) or
//! when the log reports a terminal condition, which is delivered exactly once
//! as an `Err` item:
//!
//! | Condition | Status |
//! |-----------|--------|
//! | log deleted | `NotFound` |
//! | log closed, partition paused | `FailedPrecondition` |
//! | log closed otherwise | `Internal` |
//! | readonly log drained | `ResourceExhausted` |

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace};

use super::commit_log::{CommitLog, ReadEntry, Reader};
use super::error::CommitLogError;
use super::metrics;
use super::partition::{Partition, SubscriberGuard};
use crate::constants::{REPLY_HEADER, SUBJECT_HEADER};
use crate::error::Status;
use crate::types::{Message, Offset, PartitionId};

type Delivery = Result<Message, Status>;

/// Messages of one subscription.
///
/// The first item is always the empty frame ([`Message::is_empty_frame`]).
/// Dropping the stream stops the tailing task.
pub struct MessageStream {
    rx: mpsc::Receiver<Delivery>,
    _stop: DropGuard,
}

impl MessageStream {
    /// Next message, or the terminal status. `None` after the task ended.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

impl Stream for MessageStream {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream").finish_non_exhaustive()
    }
}

/// Start tailing `log` at `start`.
///
/// `end_offset` is the newest offset at subscribe time: once the partition is
/// readonly, the subscription ends right after delivering it.
pub(crate) fn open(
    partition: Arc<Partition>,
    log: &Arc<CommitLog>,
    start: Offset,
    end_offset: Offset,
    capacity: usize,
    parent: &CancellationToken,
) -> MessageStream {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    // Cannot fail: the channel is new and has room.
    let _ = tx.try_send(Ok(Message::default()));

    let cancel = parent.child_token();
    let task = TailingTask {
        stream: partition.stream().to_string(),
        partition_id: partition.id(),
        _subscriber: partition.track_subscriber(),
        partition,
        reader: log.new_reader(start),
        tx,
        end_offset,
        cancel: cancel.clone(),
    };
    debug!(
        stream = %task.stream,
        partition = task.partition_id,
        start,
        "Subscription started"
    );
    tokio::spawn(task.run());

    MessageStream {
        rx,
        _stop: cancel.drop_guard(),
    }
}

struct TailingTask {
    stream: String,
    partition_id: PartitionId,
    partition: Arc<Partition>,
    reader: Reader,
    tx: mpsc::Sender<Delivery>,
    end_offset: Offset,
    cancel: CancellationToken,
    _subscriber: SubscriberGuard,
}

impl TailingTask {
    async fn run(mut self) {
        loop {
            match self.reader.read_next(&self.cancel).await {
                Ok(read) => {
                    let offset = read.offset;
                    let msg = to_message(&self.stream, self.partition_id, read);
                    if !self.deliver(Ok(msg)).await {
                        break;
                    }
                    metrics::MESSAGES_DELIVERED.inc();
                    if offset == self.end_offset && self.partition.is_readonly().await {
                        let status = Status::resource_exhausted(format!(
                            "reached end of readonly partition {}/{}",
                            self.stream, self.partition_id
                        ));
                        self.terminate(status).await;
                        break;
                    }
                }
                Err(e) => {
                    let paused = self.partition.is_paused().await;
                    if let Some(status) = terminal_status(&e, paused) {
                        self.terminate(status).await;
                    }
                    break;
                }
            }
        }
        trace!(
            stream = %self.stream,
            partition = self.partition_id,
            position = self.reader.position(),
            "Subscription ended"
        );
    }

    /// Hand an item to the caller. `false` once the caller is gone.
    async fn deliver(&self, item: Delivery) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }

    async fn terminate(&self, status: Status) {
        debug!(
            stream = %self.stream,
            partition = self.partition_id,
            code = %status.code,
            "Subscription terminated"
        );
        metrics::SUBSCRIPTION_TERMINATIONS
            .with_label_values(&[status.code.as_str()])
            .inc();
        self.deliver(Err(status)).await;
    }
}

/// Status reported for a reader error. `None` when the caller canceled.
fn terminal_status(err: &CommitLogError, paused: bool) -> Option<Status> {
    match err {
        CommitLogError::Canceled => None,
        CommitLogError::Deleted => Some(Status::not_found("partition was deleted")),
        CommitLogError::Closed if paused => Some(Status::failed_precondition("partition is paused")),
        CommitLogError::Closed => Some(Status::internal("partition log was closed")),
        CommitLogError::Readonly => Some(Status::resource_exhausted(
            "reached end of readonly partition",
        )),
        other => Some(Status::internal(other.to_string())),
    }
}

fn to_message(stream: &str, partition: PartitionId, read: ReadEntry) -> Message {
    let mut entry = read.entry;
    let subject = entry
        .headers
        .remove(SUBJECT_HEADER)
        .map(|v| String::from_utf8_lossy(&v).into_owned())
        .unwrap_or_default();
    let reply_subject = entry
        .headers
        .remove(REPLY_HEADER)
        .map(|v| String::from_utf8_lossy(&v).into_owned());
    Message {
        offset: read.offset,
        key: entry.key,
        value: entry.value,
        timestamp: entry.timestamp,
        stream: stream.to_string(),
        partition,
        subject,
        reply_subject,
        headers: entry.headers,
    }
}
