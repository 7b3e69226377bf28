//! Push status report
//!
//! Renders the outcome of a push the way git prints its status report.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::storage::{ObjectId, RefUpdate};

/// What a committed push did to one ref
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOutcome {
    Created,
    Updated,
    Deleted,
    /// Already held the requested value
    UpToDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatus {
    pub name: String,
    pub old: ObjectId,
    pub new: ObjectId,
    pub outcome: UpdateOutcome,
}

impl UpdateStatus {
    /// Status of an update that was swapped by this transaction
    pub fn applied(update: &RefUpdate) -> Self {
        let outcome = if update.new.is_zero() {
            UpdateOutcome::Deleted
        } else if update.old.is_zero() {
            UpdateOutcome::Created
        } else {
            UpdateOutcome::Updated
        };
        Self {
            name: update.name.clone(),
            old: update.old,
            new: update.new,
            outcome,
        }
    }

    /// Status of an update the ref already reflected
    pub fn up_to_date(update: &RefUpdate) -> Self {
        Self {
            name: update.name.clone(),
            old: update.old,
            new: update.new,
            outcome: UpdateOutcome::UpToDate,
        }
    }

    fn line(&self) -> Option<String> {
        let short = short_ref(&self.name);
        match self.outcome {
            UpdateOutcome::Created => {
                let label = if self.name.starts_with("refs/tags/") {
                    "[new tag]"
                } else {
                    "[new branch]"
                };
                Some(format!(" * {:<18}{} -> {}", label, short, short))
            }
            UpdateOutcome::Updated => Some(format!(
                "   {}..{}  {} -> {}",
                self.old.short(),
                self.new.short(),
                short,
                short
            )),
            UpdateOutcome::Deleted => Some(format!(" - {:<18}{}", "[deleted]", short)),
            UpdateOutcome::UpToDate => None,
        }
    }
}

/// Result of a committed transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitReport {
    pub tx_id: Uuid,
    pub repo: String,
    pub updates: Vec<UpdateStatus>,
    /// Acknowledgements received, including the originating node
    pub acks: usize,
    pub quorum: usize,
}

impl CommitReport {
    /// True when the push changed nothing
    pub fn is_up_to_date(&self) -> bool {
        self.updates.iter().all(|u| u.outcome == UpdateOutcome::UpToDate)
    }

    pub fn lines(&self) -> Vec<String> {
        if self.is_up_to_date() {
            return vec!["Everything up-to-date".to_string()];
        }
        self.updates.iter().filter_map(UpdateStatus::line).collect()
    }

    pub fn render(&self) -> String {
        self.lines().join("\n")
    }
}

/// Status lines for a push that did not commit
pub fn render_rejection(error: &Error, updates: &[RefUpdate]) -> Vec<String> {
    match error {
        Error::RefConflict { .. } => updates
            .iter()
            .map(|u| {
                let short = short_ref(&u.name);
                format!(" ! {:<18}{} -> {} (fetch first)", "[rejected]", short, short)
            })
            .collect(),
        Error::ObjectCorrupt { claimed, .. } => vec![format!("ERR Object corrupt: {}", claimed)],
        e if e.is_sync_failure() => vec!["ERR Object sync failed".to_string()],
        e => vec![format!("ERR {}", e)],
    }
}

/// `refs/heads/master` -> `master`
fn short_ref(name: &str) -> &str {
    name.strip_prefix("refs/heads/")
        .or_else(|| name.strip_prefix("refs/tags/"))
        .unwrap_or(name)
}
