//! Storage layer for GitQuorum
//!
//! Per-node object and ref storage. Nothing in here talks to the network.

pub mod object;
pub mod objects;
pub mod refs;

use serde::{Deserialize, Serialize};

pub use object::{GitObject, ObjectId, ObjectKind, TreeEntry};
pub use objects::{ObjectStore, PutOutcome};
pub use refs::{CasResult, RefLock, RefRecord, RefStore};

/// A requested compare-and-swap on one ref
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefUpdate {
    /// Full ref name, e.g. `refs/heads/master`
    pub name: String,
    /// Value the client believes is current (zero to create)
    pub old: ObjectId,
    /// New value (zero to delete)
    pub new: ObjectId,
}

impl RefUpdate {
    pub fn new(name: impl Into<String>, old: ObjectId, new: ObjectId) -> Self {
        Self {
            name: name.into(),
            old,
            new,
        }
    }
}
