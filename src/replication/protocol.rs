//! Replication Protocol
//!
//! Defines the wire protocol for communication between nodes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::ClusterSummary;
use crate::storage::{GitObject, ObjectId, RefRecord, RefUpdate};

/// Protocol messages for node communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Liveness ==========
    /// Liveness probe
    Heartbeat { node_id: String },

    /// Liveness probe reply
    HeartbeatAck { node_id: String },

    // ========== Push replication ==========
    /// Object batch plus the ref CAS requests of one transaction
    Replicate {
        tx_id: Uuid,
        origin: String,
        repo: String,
        objects: Vec<GitObject>,
        updates: Vec<RefUpdate>,
    },

    /// A replica's vote on a `Replicate`
    ReplicateResponse {
        tx_id: Uuid,
        node_id: String,
        vote: ReplicaVote,
    },

    /// Undo whatever this replica applied for an aborted transaction
    Revert { tx_id: Uuid },

    /// Refs a `Revert` put back to their previous record
    RevertResponse {
        tx_id: Uuid,
        node_id: String,
        reverted: Vec<String>,
    },

    // ========== Anti-entropy ==========
    /// Ask a peer for everything the requester is missing
    AntiEntropyPull { node_id: String, have: Vec<ObjectId> },

    /// One page of the objects absent from `have`, plus every ref record.
    /// `more` is set when objects were held back for a later page.
    AntiEntropyResponse {
        node_id: String,
        objects: Vec<GitObject>,
        refs: Vec<RefRecord>,
        more: bool,
    },

    // ========== Status ==========
    /// Status request
    StatusRequest,

    /// Status response
    StatusResponse { summary: ClusterSummary },

    // ========== Error ==========
    /// Error response
    Error { code: ErrorCode, message: String },
}

/// A replica's answer to a replicated transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaVote {
    /// Everything applied; `applied` lists the refs this replica actually swapped
    Ack { applied: Vec<String> },
    /// A ref did not hold the expected value
    Conflict { name: String, current: ObjectId },
    /// The batch was refused (corrupt object, missing target, busy refs)
    Rejected { reason: String },
}

impl ReplicaVote {
    pub fn is_ack(&self) -> bool {
        matches!(self, ReplicaVote::Ack { .. })
    }
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Message not valid in this context
    UnexpectedMessage,
    /// Local storage failure
    Storage,
    /// Internal error
    Internal,
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Heartbeat { .. } => "Heartbeat",
            Message::HeartbeatAck { .. } => "HeartbeatAck",
            Message::Replicate { .. } => "Replicate",
            Message::ReplicateResponse { .. } => "ReplicateResponse",
            Message::Revert { .. } => "Revert",
            Message::RevertResponse { .. } => "RevertResponse",
            Message::AntiEntropyPull { .. } => "AntiEntropyPull",
            Message::AntiEntropyResponse { .. } => "AntiEntropyResponse",
            Message::StatusRequest => "StatusRequest",
            Message::StatusResponse { .. } => "StatusResponse",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest accepted frame body
    pub const MAX_LENGTH: u32 = 256 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}
