//! State Management Module
//!
//! Tracks the static cluster membership and the observed liveness of peers.

mod membership;

pub use membership::{ClusterSummary, Membership, NodeInfo, NodeState, NodeStatus};
