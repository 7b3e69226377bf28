//! Replication Module
//!
//! Quorum replication of pushes between nodes: the coordinator side that
//! drives a transaction, the replica side that votes on it, and the
//! anti-entropy pass that reconciles nodes that missed transactions.

mod anti_entropy;
mod coordinator;
pub mod protocol;
mod replica;
pub mod report;

use std::collections::HashMap;
use std::time::Duration;

use uuid::Uuid;

use crate::config::GitQuorumConfig;
use crate::storage::{GitObject, RefUpdate};

pub use anti_entropy::AntiEntropy;
pub use coordinator::Coordinator;
pub use protocol::{ErrorCode, FrameHeader, Message, ReplicaVote};
pub use replica::Replica;
pub use report::{render_rejection, CommitReport, UpdateOutcome, UpdateStatus};

/// Configuration for replication
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Deadline for collecting quorum acknowledgements
    pub replication_timeout_ms: u64,
    /// Bounded wait for ref locks on the replica side
    pub lock_wait_ms: u64,
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Heartbeat probe timeout in milliseconds
    pub heartbeat_timeout_ms: u64,
    /// Periodic anti-entropy interval
    pub anti_entropy_interval_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replication_timeout_ms: 5000,
            lock_wait_ms: 1000,
            heartbeat_interval_ms: 500,
            heartbeat_timeout_ms: 1000,
            anti_entropy_interval_ms: 30_000,
        }
    }
}

impl ReplicationConfig {
    pub fn replication_timeout(&self) -> Duration {
        Duration::from_millis(self.replication_timeout_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn anti_entropy_interval(&self) -> Duration {
        Duration::from_millis(self.anti_entropy_interval_ms)
    }
}

impl From<&GitQuorumConfig> for ReplicationConfig {
    fn from(config: &GitQuorumConfig) -> Self {
        Self {
            replication_timeout_ms: config.cluster.replication_timeout_ms,
            lock_wait_ms: config.cluster.lock_wait_ms,
            heartbeat_interval_ms: config.cluster.heartbeat_interval_ms,
            heartbeat_timeout_ms: config.cluster.heartbeat_timeout_ms,
            anti_entropy_interval_ms: config.cluster.anti_entropy_interval_ms,
        }
    }
}

/// Lifecycle of a replication transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Pending,
    Committed,
    Aborted,
}

/// How one peer answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerVote {
    /// Applied; lists the refs the peer actually swapped
    Ack { applied: Vec<String> },
    /// Answered with a refusal
    Nack { reason: String },
    /// No usable answer (unreachable, timed out, protocol error)
    Failed { reason: String },
}

impl PeerVote {
    pub fn is_ack(&self) -> bool {
        matches!(self, PeerVote::Ack { .. })
    }
}

impl From<ReplicaVote> for PeerVote {
    fn from(vote: ReplicaVote) -> Self {
        match vote {
            ReplicaVote::Ack { applied } => PeerVote::Ack { applied },
            ReplicaVote::Conflict { name, current } => PeerVote::Nack {
                reason: format!("conflict on {} (at {})", name, current.short()),
            },
            ReplicaVote::Rejected { reason } => PeerVote::Nack { reason },
        }
    }
}

/// One push attempt. Lives only as long as `Coordinator::propose`.
#[derive(Debug)]
pub struct ReplicationTransaction {
    pub id: Uuid,
    pub origin: String,
    pub repo: String,
    pub objects: Vec<GitObject>,
    pub updates: Vec<RefUpdate>,
    /// Votes keyed by peer id
    pub votes: HashMap<String, PeerVote>,
    pub state: TransactionState,
}

impl ReplicationTransaction {
    pub fn new(origin: &str, repo: &str, objects: Vec<GitObject>, updates: Vec<RefUpdate>) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin: origin.to_string(),
            repo: repo.to_string(),
            objects,
            updates,
            votes: HashMap::new(),
            state: TransactionState::Pending,
        }
    }

    /// Acknowledgements so far, counting the originating node
    pub fn acks(&self) -> usize {
        1 + self.votes.values().filter(|v| v.is_ack()).count()
    }

    pub fn record_vote(&mut self, peer_id: &str, vote: PeerVote) {
        self.votes.insert(peer_id.to_string(), vote);
    }

    /// The wire form sent to every peer
    pub fn to_message(&self) -> Message {
        Message::Replicate {
            tx_id: self.id,
            origin: self.origin.clone(),
            repo: self.repo.clone(),
            objects: self.objects.clone(),
            updates: self.updates.clone(),
        }
    }
}
