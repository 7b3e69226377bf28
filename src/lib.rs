//! GitQuorum - Quorum-Replicated Git Hosting Engine
//!
//! Replicates repository state (git objects and refs) across a fixed cluster
//! of nodes. A push is durable once a majority of the configured nodes hold
//! it; clones and fetches are served by any single node from its local copy.
//!
//! # Architecture
//!
//! There is no leader and no replicated log. Every ref is updated by
//! compare-and-swap: the receiving node swaps it locally while holding the
//! ref's lock, replicates the batch to its peers, and keeps the swap only if
//! a quorum acknowledges it. Nodes that missed transactions catch up through
//! anti-entropy.
//!
//! # Features
//!
//! - Content-addressed object store with git-compatible SHA-1 ids
//! - SQLite-backed ref store with per-ref locks and generation counters
//! - Majority commit with compensating rollback on abort
//! - Heartbeat liveness tracking over a static membership
//! - Pull-based anti-entropy for rejoining and lagging nodes
//! - Repository metadata and visibility replicated like any other ref
//! - HTTP status API

pub mod api;
pub mod config;
pub mod error;
pub mod network;
pub mod node;
pub mod replication;
pub mod repository;
pub mod state;
pub mod storage;

#[cfg(test)]
mod testing;

pub use config::GitQuorumConfig;
pub use error::{Error, Result};
pub use node::Node;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::GitQuorumConfig;
    pub use crate::error::{Error, Result};
    pub use crate::node::{Node, RepositorySnapshot};
    pub use crate::replication::{render_rejection, CommitReport, Message};
    pub use crate::repository::{Access, RepositoryMeta, Visibility};
    pub use crate::storage::{GitObject, ObjectId, ObjectKind, RefUpdate};
}
