//! Replica side of a replicated transaction
//!
//! Validates an incoming batch, checks every ref CAS against the local store
//! and applies all of them or none. Applied transactions are journaled so a
//! resent batch gets its original answer and an aborted one can be reverted
//! to the exact records it replaced.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use uuid::Uuid;

use super::protocol::ReplicaVote;
use crate::error::{Error, Result};
use crate::storage::{CasResult, GitObject, ObjectId, ObjectStore, RefRecord, RefStore, RefUpdate};

/// Transactions remembered for resends and reverts
const JOURNAL_CAPACITY: usize = 1024;

/// What one transaction changed on this replica
#[derive(Debug, Clone)]
struct AppliedTx {
    repo: String,
    /// Each swapped update with the record it replaced
    swaps: Vec<(RefUpdate, Option<RefRecord>)>,
}

impl AppliedTx {
    fn names(&self) -> Vec<String> {
        self.swaps.iter().map(|(u, _)| u.name.clone()).collect()
    }
}

/// Bounded, insertion-ordered record of applied transactions
#[derive(Default)]
struct Journal {
    entries: HashMap<Uuid, AppliedTx>,
    order: VecDeque<Uuid>,
}

impl Journal {
    fn get(&self, tx_id: &Uuid) -> Option<&AppliedTx> {
        self.entries.get(tx_id)
    }

    fn record(&mut self, tx_id: Uuid, applied: AppliedTx) {
        if self.entries.insert(tx_id, applied).is_none() {
            self.order.push_back(tx_id);
        }
        while self.order.len() > JOURNAL_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}

/// Applies batches sent by other nodes' coordinators
pub struct Replica {
    objects: Arc<ObjectStore>,
    refs: Arc<RefStore>,
    /// Longest wait for local ref locks before voting busy
    lock_wait: Duration,
    journal: Mutex<Journal>,
}

impl Replica {
    pub fn new(objects: Arc<ObjectStore>, refs: Arc<RefStore>, lock_wait: Duration) -> Self {
        Self {
            objects,
            refs,
            lock_wait,
            journal: Mutex::new(Journal::default()),
        }
    }

    fn journal(&self) -> Result<MutexGuard<'_, Journal>> {
        self.journal
            .lock()
            .map_err(|_| Error::Internal("replica journal poisoned".into()))
    }

    /// Refs already applied for `tx_id`, if this replica has seen it
    fn seen(&self, tx_id: &Uuid) -> Result<Option<Vec<String>>> {
        Ok(self.journal()?.get(tx_id).map(AppliedTx::names))
    }

    /// Vote on one transaction. Storage failures become a rejection.
    pub async fn apply(
        &self,
        tx_id: Uuid,
        repo: &str,
        objects: &[GitObject],
        updates: &[RefUpdate],
    ) -> ReplicaVote {
        match self.try_apply(tx_id, repo, objects, updates).await {
            Ok(vote) => vote,
            Err(e) => {
                tracing::warn!("Rejecting replicated batch {} for {}: {}", tx_id, repo, e);
                ReplicaVote::Rejected {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn try_apply(
        &self,
        tx_id: Uuid,
        repo: &str,
        objects: &[GitObject],
        updates: &[RefUpdate],
    ) -> Result<ReplicaVote> {
        if let Some(applied) = self.seen(&tx_id)? {
            tracing::debug!("Transaction {} resent; answering as before", tx_id);
            return Ok(ReplicaVote::Ack { applied });
        }

        for object in objects {
            if let Err(e) = self.objects.put(object) {
                return match e {
                    Error::ObjectCorrupt { claimed, .. } => Ok(ReplicaVote::Rejected {
                        reason: format!("corrupt object {}", claimed),
                    }),
                    other => Err(other),
                };
            }
        }

        if let Some(missing) = updates
            .iter()
            .map(|u| u.new)
            .find(|id| !id.is_zero() && !self.objects.has(id))
        {
            return Ok(ReplicaVote::Rejected {
                reason: format!("missing object {}", missing),
            });
        }

        let names: Vec<String> = updates.iter().map(|u| u.name.clone()).collect();
        let Some(locks) = self.refs.try_lock_many(repo, &names, self.lock_wait).await? else {
            return Ok(ReplicaVote::Rejected {
                reason: "busy".to_string(),
            });
        };

        // A resend may have overtaken the original while it waited for the locks
        if let Some(applied) = self.seen(&tx_id)? {
            return Ok(ReplicaVote::Ack { applied });
        }

        // Check everything before touching anything
        let mut pending = Vec::new();
        for update in updates {
            let Some(lock) = locks.iter().find(|l| l.name() == update.name) else {
                return Err(Error::Internal(format!("lock for {} not held", update.name)));
            };
            let prior = self.refs.current(lock)?;
            let current = prior.as_ref().map(|r| r.target).unwrap_or(ObjectId::ZERO);

            if current == update.new {
                continue;
            }
            if current != update.old {
                return Ok(ReplicaVote::Conflict {
                    name: update.name.clone(),
                    current,
                });
            }
            pending.push((lock, update, prior));
        }

        let mut swaps = Vec::with_capacity(pending.len());
        for (lock, update, prior) in pending {
            match self.refs.swap_locked(lock, update.old, update.new)? {
                CasResult::Swapped { .. } => swaps.push((update.clone(), prior)),
                CasResult::Conflict { current } => {
                    return Err(Error::Internal(format!(
                        "{} moved to {} while locked",
                        update.name, current
                    )))
                }
            }
        }

        let applied = AppliedTx {
            repo: repo.to_string(),
            swaps,
        };
        let names = applied.names();
        self.journal()?.record(tx_id, applied);

        tracing::debug!("Applied {} ref updates to {} for {}", names.len(), repo, tx_id);
        Ok(ReplicaVote::Ack { applied: names })
    }

    /// Undo an aborted transaction, restoring the exact records it replaced.
    ///
    /// Refs that moved on since are left alone. Returns the refs put back.
    pub async fn revert(&self, tx_id: Uuid) -> Result<Vec<String>> {
        let Some(applied) = self.journal()?.get(&tx_id).cloned() else {
            tracing::debug!("Nothing to revert for {}", tx_id);
            return Ok(Vec::new());
        };
        if applied.swaps.is_empty() {
            return Ok(Vec::new());
        }

        let Some(locks) = self
            .refs
            .try_lock_many(&applied.repo, &applied.names(), self.lock_wait)
            .await?
        else {
            return Err(Error::Internal(format!("refs of {} are busy", tx_id)));
        };

        let mut reverted = Vec::new();
        for (update, prior) in &applied.swaps {
            let Some(lock) = locks.iter().find(|l| l.name() == update.name) else {
                return Err(Error::Internal(format!("lock for {} not held", update.name)));
            };
            match self.refs.restore_locked(lock, update.new, prior.as_ref())? {
                CasResult::Swapped { .. } => reverted.push(update.name.clone()),
                CasResult::Conflict { current } => {
                    tracing::info!("{} moved on to {}; not reverting {}", update.name, current, tx_id);
                }
            }
        }

        // Later resends of this transaction must not apply it again
        self.journal()?.record(
            tx_id,
            AppliedTx {
                repo: applied.repo,
                swaps: Vec::new(),
            },
        );

        tracing::info!("Reverted {} ({} refs)", tx_id, reverted.len());
        Ok(reverted)
    }
}
