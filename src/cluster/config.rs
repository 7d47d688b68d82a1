//! Broker configuration.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `LOGBRIDGE_NODE_ID` | 0 | This node's id |
//! | `LOGBRIDGE_NAMESPACE` | `logbridge` | Prefix of internal subjects |
//! | `LOGBRIDGE_DATA_PATH` | `logbridge-data` | Object store prefix for partition logs and snapshots |
//! | `LOGBRIDGE_ISR_MAX_LAG_ENTRIES` | 0 | Entries a follower may trail and still join the ISR |
//! | `LOGBRIDGE_REPLICA_MAX_LAG_TIME_MS` | 10000 | Lag after which a follower is removed from the ISR |
//! | `LOGBRIDGE_REPLICA_FETCH_TIMEOUT_MS` | 3000 | Follower request timeout |
//! | `LOGBRIDGE_REPLICA_MAX_IDLE_WAIT_MS` | 500 | Leader long-poll wait for caught up followers |
//! | `LOGBRIDGE_SUBSCRIBER_CHANNEL_CAPACITY` | 64 | Delivery channel depth per subscription |
//! | `LOGBRIDGE_PUBLISH_ASYNC_CHANNEL_CAPACITY` | 256 | Response channel depth per async publish session |
//! | `LOGBRIDGE_AUTO_PAUSE_CHECK_INTERVAL_MS` | 1000 | Auto-pause monitor period |
//! | `LOGBRIDGE_LOG_AWAIT_DURABLE` | true | Wait for object store durability on append |
//! | `LOGBRIDGE_RAFT_MEMBERS` | empty | Comma separated voting member ids |

use std::path::PathBuf;
use std::time::Duration;

use super::raft::RaftConfig;
use crate::constants::{
    DEFAULT_AUTO_PAUSE_CHECK_INTERVAL, DEFAULT_ISR_MAX_LAG_ENTRIES, DEFAULT_LOG_FLUSH_INTERVAL,
    DEFAULT_PUBLISH_ASYNC_CHANNEL_CAPACITY, DEFAULT_REPLICA_FETCH_TIMEOUT,
    DEFAULT_REPLICA_MAX_IDLE_WAIT, DEFAULT_REPLICA_MAX_LAG_TIME,
    DEFAULT_SUBSCRIBER_CHANNEL_CAPACITY,
};
use crate::types::NodeId;

/// Configuration of one broker node.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub node_id: NodeId,

    /// Prefix for replication and Raft subjects.
    pub namespace: String,

    /// Object store prefix under which partition logs live.
    pub data_path: PathBuf,

    // ========================================================================
    // Replication
    // ========================================================================
    /// A follower whose reported offset is within this many entries of the
    /// leader's tail is admitted to the ISR.
    pub isr_max_lag_entries: i64,

    /// An ISR follower that has not caught up for this long is removed.
    pub replica_max_lag_time: Duration,

    /// Follower-side timeout of a single replication request.
    pub replica_fetch_timeout: Duration,

    /// How long the leader holds a request from a caught up follower.
    pub replica_max_idle_wait: Duration,

    // ========================================================================
    // Gateway
    // ========================================================================
    pub subscriber_channel_capacity: usize,
    pub publish_async_channel_capacity: usize,

    /// Period of the auto-pause and ISR lag monitors.
    pub auto_pause_check_interval: Duration,

    // ========================================================================
    // Storage
    // ========================================================================
    /// SlateDB WAL flush interval.
    pub log_flush_interval: Duration,

    /// Wait for object store durability before an append returns.
    pub log_await_durable: bool,

    pub raft: RaftConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            namespace: "logbridge".to_string(),
            data_path: PathBuf::from("logbridge-data"),
            isr_max_lag_entries: DEFAULT_ISR_MAX_LAG_ENTRIES,
            replica_max_lag_time: DEFAULT_REPLICA_MAX_LAG_TIME,
            replica_fetch_timeout: DEFAULT_REPLICA_FETCH_TIMEOUT,
            replica_max_idle_wait: DEFAULT_REPLICA_MAX_IDLE_WAIT,
            subscriber_channel_capacity: DEFAULT_SUBSCRIBER_CHANNEL_CAPACITY,
            publish_async_channel_capacity: DEFAULT_PUBLISH_ASYNC_CHANNEL_CAPACITY,
            auto_pause_check_interval: DEFAULT_AUTO_PAUSE_CHECK_INTERVAL,
            log_flush_interval: DEFAULT_LOG_FLUSH_INTERVAL,
            log_await_durable: true,
            raft: RaftConfig::default(),
        }
    }
}

fn env_millis(name: &str, default: Duration) -> Result<Duration, Box<dyn std::error::Error>> {
    match std::env::var(name) {
        Ok(v) => {
            let ms: u64 = v
                .parse()
                .map_err(|e| format!("Invalid {}: {}", name, e))?;
            Ok(Duration::from_millis(ms))
        }
        Err(_) => Ok(default),
    }
}

impl BrokerConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let defaults = Self::default();

        let node_id: NodeId = std::env::var("LOGBRIDGE_NODE_ID")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .map_err(|e| format!("Invalid LOGBRIDGE_NODE_ID: {}", e))?;

        let namespace =
            std::env::var("LOGBRIDGE_NAMESPACE").unwrap_or_else(|_| defaults.namespace.clone());

        let data_path = std::env::var("LOGBRIDGE_DATA_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| defaults.data_path.clone());

        let isr_max_lag_entries: i64 = match std::env::var("LOGBRIDGE_ISR_MAX_LAG_ENTRIES") {
            Ok(v) => v
                .parse()
                .map_err(|e| format!("Invalid LOGBRIDGE_ISR_MAX_LAG_ENTRIES: {}", e))?,
            Err(_) => defaults.isr_max_lag_entries,
        };

        let subscriber_channel_capacity = std::env::var("LOGBRIDGE_SUBSCRIBER_CHANNEL_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.subscriber_channel_capacity);

        let publish_async_channel_capacity =
            std::env::var("LOGBRIDGE_PUBLISH_ASYNC_CHANNEL_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.publish_async_channel_capacity);

        let log_await_durable = std::env::var("LOGBRIDGE_LOG_AWAIT_DURABLE")
            .map(|v| v.to_lowercase() != "false" && v != "0")
            .unwrap_or(defaults.log_await_durable);

        let initial_members: Vec<NodeId> = std::env::var("LOGBRIDGE_RAFT_MEMBERS")
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.trim().parse().ok())
            .collect();

        Ok(Self {
            node_id,
            namespace,
            data_path,
            isr_max_lag_entries,
            replica_max_lag_time: env_millis(
                "LOGBRIDGE_REPLICA_MAX_LAG_TIME_MS",
                defaults.replica_max_lag_time,
            )?,
            replica_fetch_timeout: env_millis(
                "LOGBRIDGE_REPLICA_FETCH_TIMEOUT_MS",
                defaults.replica_fetch_timeout,
            )?,
            replica_max_idle_wait: env_millis(
                "LOGBRIDGE_REPLICA_MAX_IDLE_WAIT_MS",
                defaults.replica_max_idle_wait,
            )?,
            subscriber_channel_capacity,
            publish_async_channel_capacity,
            auto_pause_check_interval: env_millis(
                "LOGBRIDGE_AUTO_PAUSE_CHECK_INTERVAL_MS",
                defaults.auto_pause_check_interval,
            )?,
            log_await_durable,
            raft: RaftConfig {
                initial_members,
                ..defaults.raft.clone()
            },
            ..defaults
        })
    }

    /// Validate the configuration, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.namespace.is_empty() || self.namespace.contains(char::is_whitespace) {
            errors.push(format!(
                "namespace ({:?}) must be non-empty and contain no whitespace",
                self.namespace
            ));
        }

        if self.isr_max_lag_entries < 0 {
            errors.push(format!(
                "isr_max_lag_entries ({}) must be non-negative",
                self.isr_max_lag_entries
            ));
        }

        if self.replica_fetch_timeout.is_zero() {
            errors.push("replica_fetch_timeout must be greater than 0".to_string());
        }

        // The leader must answer an idle request before the follower gives up.
        if self.replica_max_idle_wait >= self.replica_fetch_timeout {
            errors.push(format!(
                "replica_max_idle_wait ({:?}) must be less than replica_fetch_timeout ({:?})",
                self.replica_max_idle_wait, self.replica_fetch_timeout
            ));
        }

        if self.replica_max_lag_time <= self.replica_fetch_timeout {
            errors.push(format!(
                "replica_max_lag_time ({:?}) must be greater than replica_fetch_timeout ({:?})",
                self.replica_max_lag_time, self.replica_fetch_timeout
            ));
        }

        if self.subscriber_channel_capacity == 0 {
            errors.push("subscriber_channel_capacity must be greater than 0".to_string());
        }

        if self.publish_async_channel_capacity == 0 {
            errors.push("publish_async_channel_capacity must be greater than 0".to_string());
        }

        if self.auto_pause_check_interval.is_zero() {
            errors.push("auto_pause_check_interval must be greater than 0".to_string());
        }

        if let Err(raft_errors) = self.raft.validate() {
            errors.extend(raft_errors.into_iter().map(|e| format!("raft: {}", e)));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_data_path(mut self, data_path: impl Into<PathBuf>) -> Self {
        self.data_path = data_path.into();
        self
    }

    pub fn with_isr_max_lag_entries(mut self, entries: i64) -> Self {
        self.isr_max_lag_entries = entries;
        self
    }

    pub fn with_replica_max_lag_time(mut self, lag: Duration) -> Self {
        self.replica_max_lag_time = lag;
        self
    }

    pub fn with_replica_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.replica_fetch_timeout = timeout;
        self
    }

    pub fn with_replica_max_idle_wait(mut self, wait: Duration) -> Self {
        self.replica_max_idle_wait = wait;
        self
    }

    pub fn with_auto_pause_check_interval(mut self, interval: Duration) -> Self {
        self.auto_pause_check_interval = interval;
        self
    }

    pub fn with_raft(mut self, raft: RaftConfig) -> Self {
        self.raft = raft;
        self
    }

    /// Object store prefix of one partition log.
    pub fn partition_path(&self, stream: &str, partition: i32) -> String {
        format!(
            "{}/node-{}/streams/{}/{}",
            self.data_path.display(),
            self.node_id,
            stream,
            partition
        )
    }

    /// Object store prefix for Raft snapshots of this node.
    pub fn snapshot_path(&self) -> String {
        format!("{}/node-{}/raft", self.data_path.display(), self.node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BrokerConfig::default();
        assert_eq!(config.node_id, 0);
        assert_eq!(config.namespace, "logbridge");
        assert_eq!(config.isr_max_lag_entries, 0);
        assert!(config.log_await_durable);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_collects_every_error() {
        let config = BrokerConfig {
            namespace: String::new(),
            isr_max_lag_entries: -1,
            subscriber_channel_capacity: 0,
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("namespace")));
        assert!(errors.iter().any(|e| e.contains("isr_max_lag_entries")));
        assert!(errors.iter().any(|e| e.contains("subscriber_channel_capacity")));
    }

    #[test]
    fn test_validate_idle_wait_below_fetch_timeout() {
        let config = BrokerConfig::default()
            .with_replica_fetch_timeout(Duration::from_millis(100))
            .with_replica_max_idle_wait(Duration::from_millis(200));
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("replica_max_idle_wait")));
    }

    #[test]
    fn test_validate_includes_raft_errors() {
        let config = BrokerConfig::default().with_raft(RaftConfig {
            max_pending_proposals: 0,
            ..Default::default()
        });
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.starts_with("raft: ")));
    }

    #[test]
    fn test_partition_paths_are_per_node() {
        let a = BrokerConfig::default().with_node_id(1);
        let b = BrokerConfig::default().with_node_id(2);
        assert_ne!(a.partition_path("orders", 0), b.partition_path("orders", 0));
        assert!(a.partition_path("orders", 3).ends_with("streams/orders/3"));
    }
}
