//! Follower catch-up agent.
//!
//! Repeatedly asks the partition leader for everything after the newest local
//! offset, copies the returned entries at their original offsets and follows
//! the leader's high-watermark. Runs until the follower role's scope is
//! canceled; transport failures and stale epochs are retried with backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::commit_log::CommitLog;
use super::error::{BrokerError, BrokerResult, CommitLogError};
use super::retry::ReplicationBackoff;
use crate::protocol::{ReplicationRequest, ReplicationResponse, decode_envelope, encode_envelope};
use crate::transport::Transport;
use crate::types::NodeId;

/// Pulls a partition's log from its leader.
pub struct CatchUpAgent {
    transport: Arc<dyn Transport>,
    log: Arc<CommitLog>,
    subject: String,
    replica_id: NodeId,
    epoch: u64,
    fetch_timeout: Duration,
}

impl CatchUpAgent {
    pub fn new(
        transport: Arc<dyn Transport>,
        log: Arc<CommitLog>,
        subject: String,
        replica_id: NodeId,
        epoch: u64,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            log,
            subject,
            replica_id,
            epoch,
            fetch_timeout,
        }
    }

    pub fn spawn(self, scope: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(scope))
    }

    async fn run(self, scope: CancellationToken) {
        debug!(
            log = self.log.name(),
            subject = %self.subject,
            epoch = self.epoch,
            "Catch-up agent started"
        );
        let mut backoff = ReplicationBackoff::new();
        loop {
            let result = tokio::select! {
                biased;
                () = scope.cancelled() => break,
                result = self.fetch_once() => result,
            };
            match result {
                Ok(copied) => {
                    backoff.reset();
                    if copied > 0 {
                        trace!(log = self.log.name(), copied, "Copied entries from leader");
                    }
                }
                Err(BrokerError::CommitLog(CommitLogError::Closed | CommitLogError::Deleted)) => {
                    break;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    debug!(
                        log = self.log.name(),
                        error = %e,
                        retry_in = ?delay,
                        "Catch-up request failed"
                    );
                    tokio::select! {
                        biased;
                        () = scope.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        debug!(log = self.log.name(), "Catch-up agent stopped");
    }

    /// One request/response round. Returns the number of entries copied.
    async fn fetch_once(&self) -> BrokerResult<usize> {
        let request = ReplicationRequest {
            replica_id: self.replica_id,
            high_watermark: self.log.newest_offset(),
            leader_epoch: self.epoch,
        };
        let reply = self
            .transport
            .request(&self.subject, encode_envelope(&request)?, self.fetch_timeout)
            .await?;
        let response: ReplicationResponse = decode_envelope(&reply.payload)?;
        if response.leader_epoch != self.epoch {
            return Err(BrokerError::Rejected(format!(
                "leader answered for epoch {}, following epoch {}",
                response.leader_epoch, self.epoch
            )));
        }
        self.apply(response).await
    }

    async fn apply(&self, response: ReplicationResponse) -> BrokerResult<usize> {
        let mut copied = 0;
        for replicated in &response.entries {
            match self.log.append_at(replicated.offset, &replicated.entry).await {
                Ok(true) => copied += 1,
                Ok(false) => {}
                Err(CommitLogError::OffsetGap { expected, actual }) if actual > expected => {
                    // The leader no longer retains what we are missing; start
                    // over from its oldest entry.
                    debug!(
                        log = self.log.name(),
                        expected,
                        actual,
                        "Leader retention passed local tail, resetting log"
                    );
                    self.log.truncate(self.log.oldest_offset() - 1).await?;
                    if self
                        .log
                        .append_at(replicated.offset, &replicated.entry)
                        .await?
                    {
                        copied += 1;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        let hw = response.leader_hw.min(self.log.newest_offset());
        if hw > self.log.high_watermark() {
            self.log.set_high_watermark(hw).await?;
        }
        Ok(copied)
    }
}
