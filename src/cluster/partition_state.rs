//! Role state machine of a local partition replica.
//!
//! Roles change only when an applied metadata operation records a new leader
//! (or pauses, resumes or deletes the partition). A node never promotes
//! itself.
//!
//! ```text
//!            leader == self                 leader != self
//!   Idle ─────────────────► Leader ◄──────────────────────► Follower
//!     ▲                       │      (ChangeLeader, epoch+1)    │
//!     └───────────────────────┴──────── pause / delete ─────────┘
//! ```
//!
//! Every active role owns a [`CancellationToken`] scoping the tasks started
//! when the role was entered (ingestion, replicators, catch-up agent).
//! Leaving the role cancels the scope; doing so twice is harmless.

use std::fmt;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::metrics::PARTITION_ROLES;
use crate::types::NodeId;

/// Role of this node for one partition.
#[derive(Default)]
pub enum PartitionRole {
    /// No tasks running: paused, stopped or not yet started.
    #[default]
    Idle,

    /// Accepting ingestion and serving follower catch-up requests.
    Leader {
        epoch: u64,
        scope: CancellationToken,
        entered_at: Instant,
    },

    /// Pulling entries from `leader`.
    Follower {
        leader: NodeId,
        epoch: u64,
        scope: CancellationToken,
        entered_at: Instant,
    },
}

impl fmt::Debug for PartitionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionRole::Idle => write!(f, "Idle"),
            PartitionRole::Leader {
                epoch, entered_at, ..
            } => f
                .debug_struct("Leader")
                .field("epoch", epoch)
                .field("duration", &entered_at.elapsed())
                .finish(),
            PartitionRole::Follower {
                leader,
                epoch,
                entered_at,
                ..
            } => f
                .debug_struct("Follower")
                .field("leader", leader)
                .field("epoch", epoch)
                .field("duration", &entered_at.elapsed())
                .finish(),
        }
    }
}

impl PartitionRole {
    /// Enter the leader role for `epoch`.
    pub fn leader(epoch: u64) -> Self {
        let role = PartitionRole::Leader {
            epoch,
            scope: CancellationToken::new(),
            entered_at: Instant::now(),
        };
        role.on_enter();
        role
    }

    /// Enter the follower role, following `leader` in `epoch`.
    pub fn follower(leader: NodeId, epoch: u64) -> Self {
        let role = PartitionRole::Follower {
            leader,
            epoch,
            scope: CancellationToken::new(),
            entered_at: Instant::now(),
        };
        role.on_enter();
        role
    }

    fn on_enter(&self) {
        if !matches!(self, PartitionRole::Idle) {
            PARTITION_ROLES.with_label_values(&[self.role_name()]).inc();
        }
    }

    /// Leave the role: cancel every task it started and return to idle.
    pub fn exit(&mut self) {
        let previous = std::mem::take(self);
        if let Some(scope) = previous.scope() {
            scope.cancel();
            PARTITION_ROLES
                .with_label_values(&[previous.role_name()])
                .dec();
        }
    }

    /// Scope of the tasks belonging to this role.
    pub fn scope(&self) -> Option<&CancellationToken> {
        match self {
            PartitionRole::Idle => None,
            PartitionRole::Leader { scope, .. } | PartitionRole::Follower { scope, .. } => {
                Some(scope)
            }
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, PartitionRole::Leader { .. })
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, PartitionRole::Follower { .. })
    }

    /// Whether the role already matches the recorded leader and epoch.
    pub fn matches(&self, node_id: NodeId, leader: NodeId, epoch: u64) -> bool {
        match self {
            PartitionRole::Idle => false,
            PartitionRole::Leader { epoch: e, .. } => leader == node_id && *e == epoch,
            PartitionRole::Follower {
                leader: l,
                epoch: e,
                ..
            } => leader != node_id && *l == leader && *e == epoch,
        }
    }

    pub fn epoch(&self) -> Option<u64> {
        match self {
            PartitionRole::Idle => None,
            PartitionRole::Leader { epoch, .. } | PartitionRole::Follower { epoch, .. } => {
                Some(*epoch)
            }
        }
    }

    pub fn duration_in_role(&self) -> Option<Duration> {
        match self {
            PartitionRole::Idle => None,
            PartitionRole::Leader { entered_at, .. }
            | PartitionRole::Follower { entered_at, .. } => Some(entered_at.elapsed()),
        }
    }

    pub fn role_name(&self) -> &'static str {
        match self {
            PartitionRole::Idle => "idle",
            PartitionRole::Leader { .. } => "leader",
            PartitionRole::Follower { .. } => "follower",
        }
    }
}
