//! Configuration for the metadata consensus layer.

use std::time::Duration;

use crate::types::NodeId;

/// Configuration for a Raft node.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Name shared by every member of the cluster.
    pub cluster_name: String,

    /// Voting members known at bootstrap. Empty means a single-node cluster.
    pub initial_members: Vec<NodeId>,

    /// Heartbeat interval for the Raft leader.
    pub heartbeat_interval: Duration,

    /// Election timeout range (min).
    pub election_timeout_min: Duration,

    /// Election timeout range (max).
    pub election_timeout_max: Duration,

    /// Maximum entries per AppendEntries RPC.
    pub max_payload_entries: u64,

    /// Build a snapshot after this many applied entries.
    pub snapshot_threshold: u64,

    /// Timeout of a single Raft RPC over the transport.
    pub rpc_timeout: Duration,

    // ========================================================================
    // Backpressure
    // ========================================================================
    /// Proposals allowed in flight before new ones wait for a slot.
    pub max_pending_proposals: usize,

    /// How long a proposal waits for a backpressure slot.
    pub proposal_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            cluster_name: "logbridge".to_string(),
            initial_members: Vec::new(),
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            max_payload_entries: 100,
            snapshot_threshold: 1_000,
            rpc_timeout: Duration::from_secs(2),
            max_pending_proposals: 1000,
            proposal_timeout: Duration::from_secs(30),
        }
    }
}

impl RaftConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.cluster_name.is_empty() {
            errors.push("cluster_name cannot be empty".to_string());
        }

        if self.election_timeout_min >= self.election_timeout_max {
            errors.push(format!(
                "election_timeout_min ({:?}) must be less than election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            ));
        }

        if self.heartbeat_interval >= self.election_timeout_min {
            errors.push(format!(
                "heartbeat_interval ({:?}) should be much less than election_timeout_min ({:?})",
                self.heartbeat_interval, self.election_timeout_min
            ));
        }

        if self.max_pending_proposals == 0 {
            errors.push("max_pending_proposals must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get openraft Config from this RaftConfig.
    pub fn to_openraft_config(&self) -> openraft::Config {
        openraft::Config {
            cluster_name: self.cluster_name.clone(),
            heartbeat_interval: self.heartbeat_interval.as_millis() as u64,
            election_timeout_min: self.election_timeout_min.as_millis() as u64,
            election_timeout_max: self.election_timeout_max.as_millis() as u64,
            max_payload_entries: self.max_payload_entries,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = RaftConfig::default();
        assert_eq!(config.cluster_name, "logbridge");
        assert!(config.initial_members.is_empty());
        assert_eq!(config.heartbeat_interval, Duration::from_millis(100));
        assert_eq!(config.max_pending_proposals, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_election_timeout_order() {
        let config = RaftConfig {
            election_timeout_min: Duration::from_millis(500),
            election_timeout_max: Duration::from_millis(400),
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("election_timeout_min")));
    }

    #[test]
    fn test_validate_heartbeat_too_slow() {
        let config = RaftConfig {
            heartbeat_interval: Duration::from_millis(400),
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("heartbeat_interval")));
    }

    #[test]
    fn test_to_openraft_config() {
        let config = RaftConfig::default();
        let raft = config.to_openraft_config();
        assert_eq!(raft.cluster_name, "logbridge");
        assert_eq!(raft.heartbeat_interval, 100);
        assert_eq!(raft.election_timeout_min, 300);
        assert_eq!(raft.election_timeout_max, 600);
        assert!(raft.validate().is_ok());
    }
}
