//! Retry policies built on `backon`.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `coordinator_policy` | 50ms | 5s | 10 | Metadata proposals |
//! | `replication_policy` | 50ms | 2s | unbounded | Follower catch-up |
//!
//! Every policy includes jitter.
//!
//! # Example
//!
//! ```rust,no_run
//! use logbridge::cluster::retry;
//! use backon::Retryable;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     (|| async { Ok::<_, std::io::Error>(()) })
//!         .retry(retry::coordinator_policy())
//!         .when(|e| e.kind() == std::io::ErrorKind::TimedOut)
//!         .await?;
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder, Retryable};

/// Policy for metadata proposals that fail while leadership settles.
pub fn coordinator_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(10)
        .with_jitter()
}

/// Delay schedule for one round of follower catch-up retries.
///
/// Catch-up never gives up; [`ReplicationBackoff`] starts a new round when this
/// one runs out.
pub fn replication_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(8)
        .with_jitter()
}

/// An endless backoff: repeats [`replication_policy`] rounds and resets after
/// a success.
pub struct ReplicationBackoff {
    current: <ExponentialBuilder as BackoffBuilder>::Backoff,
}

impl Default for ReplicationBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationBackoff {
    pub fn new() -> Self {
        Self {
            current: replication_policy().build(),
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        match self.current.next() {
            Some(delay) => delay,
            None => {
                self.current = replication_policy().build();
                self.current
                    .next()
                    .unwrap_or_else(|| Duration::from_millis(50))
            }
        }
    }

    /// Forget accumulated delay after a successful round trip.
    pub fn reset(&mut self) {
        self.current = replication_policy().build();
    }
}

/// Run `operation` with the coordinator policy while `condition` holds.
pub async fn with_coordinator_policy<F, Fut, T, E, C>(operation: F, condition: C) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::error::Error,
    C: FnMut(&E) -> bool,
{
    operation.retry(coordinator_policy()).when(condition).await
}
