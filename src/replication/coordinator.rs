//! Replication Coordinator
//!
//! Runs one push as a quorum transaction. The refs are swapped locally while
//! their locks are held, the batch is fanned out to the peers, and the swap is
//! either confirmed by a majority of the configured nodes or rolled back to
//! the exact records it replaced.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use uuid::Uuid;

use super::report::{CommitReport, UpdateStatus};
use super::{Message, PeerVote, ReplicationConfig, ReplicationTransaction, TransactionState};
use crate::error::{Error, Result};
use crate::network::PeerTransport;
use crate::state::{Membership, NodeInfo};
use crate::storage::{
    CasResult, GitObject, ObjectId, ObjectStore, PutOutcome, RefLock, RefRecord, RefStore, RefUpdate,
};

/// Attempts at reverting an aborted transaction on one peer
const REVERT_ATTEMPTS: u32 = 3;

/// A peer's raw answer, as delivered by its RPC task

type PeerReply = (NodeInfo, Result<Message>);

/// Originating side of replicated pushes
#[derive(Clone)]
pub struct Coordinator {
    node_id: String,
    objects: Arc<ObjectStore>,
    refs: Arc<RefStore>,
    membership: Arc<Membership>,
    transport: Arc<dyn PeerTransport>,
    config: ReplicationConfig,
}

impl Coordinator {
    pub fn new(
        objects: Arc<ObjectStore>,
        refs: Arc<RefStore>,
        membership: Arc<Membership>,
        transport: Arc<dyn PeerTransport>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            node_id: membership.node_id().to_string(),
            objects,
            refs,
            membership,
            transport,
            config,
        }
    }

    /// Commit `updates` (and the objects they need) on a majority of the cluster.
    ///
    /// An `Err` means the transaction aborted and no node keeps its effect.
    pub async fn propose(
        &self,
        repo: &str,
        objects: Vec<GitObject>,
        updates: Vec<RefUpdate>,
    ) -> Result<CommitReport> {
        validate(repo, &updates)?;

        for object in &objects {
            object.verify()?;
        }
        for object in &objects {
            if self.objects.put(object)? == PutOutcome::Stored {
                tracing::debug!("Staged {} {}", object.kind, object.id);
            }
        }
        if let Some(missing) = updates
            .iter()
            .map(|u| u.new)
            .find(|id| !id.is_zero() && !self.objects.has(id))
        {
            return Err(Error::ObjectNotFound(missing));
        }

        let mut tx = ReplicationTransaction::new(&self.node_id, repo, objects, updates);
        let names: Vec<String> = tx.updates.iter().map(|u| u.name.clone()).collect();
        let locks = self.refs.lock_many(repo, &names).await?;

        // Classify every update against the stored value
        let mut statuses = Vec::with_capacity(tx.updates.len());
        let mut to_swap = Vec::new();
        for update in &tx.updates {
            let prior = self.refs.current(find_lock(&locks, &update.name)?)?;
            let current = prior.as_ref().map(|r| r.target).unwrap_or(ObjectId::ZERO);

            if current == update.new {
                statuses.push(UpdateStatus::up_to_date(update));
            } else if current == update.old {
                statuses.push(UpdateStatus::applied(update));
                to_swap.push(Swap {
                    update: update.clone(),
                    prior,
                });
            } else {
                tracing::warn!(
                    "Rejecting push to {}:{}: expected {}, found {}",
                    repo,
                    update.name,
                    update.old,
                    current
                );
                return Err(Error::RefConflict {
                    name: update.name.clone(),
                    expected: update.old,
                    current,
                });
            }
        }

        let quorum = self.membership.quorum();
        if to_swap.is_empty() {
            // Already applied here; a majority still has to confirm it
            tracing::info!("Push {} to {} is already applied locally", tx.id, repo);
        } else {
            self.apply_local(&locks, &to_swap)?;
        }

        // Fan out
        let mut peers = self.membership.live_peers().await;
        if peers.len() + 1 < quorum {
            // Too few peers look alive to win; ask the down ones as well
            peers = self.membership.peers().await;
        }
        let peers: Vec<NodeInfo> = peers.iter().map(|p| p.info()).collect();
        let mut replies = self.fan_out(&tx, &peers);
        let mut outstanding = peers.len();
        let deadline = Instant::now() + self.config.replication_timeout();

        while tx.acks() < quorum && tx.acks() + outstanding >= quorum {
            match timeout_at(deadline, replies.recv()).await {
                Ok(Some((peer, result))) => {
                    outstanding -= 1;
                    let vote = read_vote(&self.membership, tx.id, &peer, result).await;
                    tx.record_vote(&peer.id, vote);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!("Transaction {} timed out waiting for {} peers", tx.id, outstanding);
                    break;
                }
            }
        }

        let acks = tx.acks();
        if acks >= quorum {
            tx.state = TransactionState::Committed;
            tracing::info!(
                "Committed {} to {} ({}/{} acks, {} ref updates)",
                tx.id,
                repo,
                acks,
                quorum,
                to_swap.len()
            );
            tokio::spawn(drain_replies(Arc::clone(&self.membership), tx.id, replies));

            return Ok(CommitReport {
                tx_id: tx.id,
                repo: repo.to_string(),
                updates: statuses,
                acks,
                quorum,
            });
        }

        tx.state = TransactionState::Aborted;
        tracing::warn!(
            "Aborting {} on {}: {}/{} acks ({:?})",
            tx.id,
            repo,
            acks,
            quorum,
            tx.votes
        );
        self.rollback(&locks, &to_swap);

        let by_id: HashMap<&str, &NodeInfo> = peers.iter().map(|p| (p.id.as_str(), p)).collect();
        let acked: Vec<(NodeInfo, Vec<String>)> = tx
            .votes
            .iter()
            .filter_map(|(id, vote)| match vote {
                PeerVote::Ack { applied } => by_id.get(id.as_str()).map(|p| ((*p).clone(), applied.clone())),
                _ => None,
            })
            .collect();

        let compensation = Compensation {
            tx_id: tx.id,
            transport: Arc::clone(&self.transport),
            membership: Arc::clone(&self.membership),
            timeout: self.config.replication_timeout(),
        };
        tokio::spawn(compensation.run(acked, replies));

        Err(Error::QuorumUnreachable {
            acks,
            required: quorum,
        })
    }

    /// Swap every update; on failure undo the ones already swapped
    fn apply_local(&self, locks: &[RefLock], swaps: &[Swap]) -> Result<()> {
        for (i, Swap { update, .. }) in swaps.iter().enumerate() {
            let outcome = find_lock(locks, &update.name)
                .and_then(|lock| self.refs.swap_locked(lock, update.old, update.new));
            let failure = match outcome {
                Ok(CasResult::Swapped { .. }) => continue,
                Ok(CasResult::Conflict { current }) => {
                    Error::Internal(format!("{} moved to {} while locked", update.name, current))
                }
                Err(e) => e,
            };
            self.rollback(locks, &swaps[..i]);
            return Err(failure);
        }
        Ok(())
    }

    /// Put back the records the local swaps replaced, generations included
    fn rollback(&self, locks: &[RefLock], swaps: &[Swap]) {
        for Swap { update, prior } in swaps.iter().rev() {
            let reverted = find_lock(locks, &update.name)
                .and_then(|lock| self.refs.restore_locked(lock, update.new, prior.as_ref()));
            match reverted {
                Ok(CasResult::Swapped { generation, .. }) => {
                    tracing::debug!("Rolled back {} to {} (generation {})", update.name, update.old, generation);
                }
                Ok(CasResult::Conflict { current }) => {
                    tracing::error!("Cannot roll back {}: holds {}", update.name, current);
                }
                Err(e) => {
                    tracing::error!("Cannot roll back {}: {}", update.name, e);
                }
            }
        }
    }

    /// Send the transaction to every peer in parallel
    fn fan_out(&self, tx: &ReplicationTransaction, peers: &[NodeInfo]) -> mpsc::Receiver<PeerReply> {
        let (reply_tx, reply_rx) = mpsc::channel(peers.len().max(1));
        let message = tx.to_message();
        let rpc_timeout = self.config.replication_timeout();

        for peer in peers {
            let transport = Arc::clone(&self.transport);
            let reply_tx = reply_tx.clone();
            let message = message.clone();
            let peer = peer.clone();

            tokio::spawn(async move {
                let result = match timeout(rpc_timeout, transport.request(&peer.address, message)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::ConnectionTimeout(peer.address.clone())),
                };
                let _ = reply_tx.send((peer, result)).await;
            });
        }

        reply_rx
    }
}

/// A local swap and the record it replaced
struct Swap {
    update: RefUpdate,
    prior: Option<RefRecord>,
}

fn validate(repo: &str, updates: &[RefUpdate]) -> Result<()> {
    if repo.is_empty() {
        return Err(Error::InvalidRequest("repository name is empty".into()));
    }
    if updates.is_empty() {
        return Err(Error::InvalidRequest("no ref updates".into()));
    }

    let mut seen = HashSet::new();
    for update in updates {
        if update.name.is_empty() {
            return Err(Error::InvalidRequest("empty ref name".into()));
        }
        if !seen.insert(update.name.as_str()) {
            return Err(Error::InvalidRequest(format!("ref {} updated twice", update.name)));
        }
    }
    Ok(())
}

fn find_lock<'a>(locks: &'a [RefLock], name: &str) -> Result<&'a RefLock> {
    locks
        .iter()
        .find(|l| l.name() == name)
        .ok_or_else(|| Error::Internal(format!("lock for {} not held", name)))
}

/// Turn a peer's answer into a vote and update its liveness
async fn read_vote(membership: &Membership, tx_id: Uuid, peer: &NodeInfo, result: Result<Message>) -> PeerVote {
    match result {
        Ok(Message::ReplicateResponse { tx_id: answered, vote, .. }) if answered == tx_id => {
            membership.record_alive(&peer.id).await;
            if !vote.is_ack() {
                tracing::warn!("Peer {} refused {}: {:?}", peer.id, tx_id, vote);
            }
            vote.into()
        }
        Ok(Message::Error { message, .. }) => {
            membership.record_alive(&peer.id).await;
            tracing::warn!("Peer {} failed {}: {}", peer.id, tx_id, message);
            PeerVote::Nack { reason: message }
        }
        Ok(other) => {
            tracing::warn!("Unexpected reply {} from {} for {}", other.type_name(), peer.id, tx_id);
            PeerVote::Failed {
                reason: format!("unexpected {}", other.type_name()),
            }
        }
        Err(e) => {
            if e.is_sync_failure() {
                membership.record_failure(&peer.id).await;
            }
            tracing::debug!("Replicate {} to {} failed: {}", tx_id, peer.id, e);
            PeerVote::Failed { reason: e.to_string() }
        }
    }
}

/// Liveness bookkeeping for replies that arrive after a commit
async fn drain_replies(membership: Arc<Membership>, tx_id: Uuid, mut replies: mpsc::Receiver<PeerReply>) {
    while let Some((peer, result)) = replies.recv().await {
        read_vote(&membership, tx_id, &peer, result).await;
    }
}

/// Best-effort undo of an aborted transaction on the peers that applied it
struct Compensation {
    tx_id: Uuid,
    transport: Arc<dyn PeerTransport>,
    membership: Arc<Membership>,
    timeout: Duration,
}

impl Compensation {
    async fn run(self, acked: Vec<(NodeInfo, Vec<String>)>, mut replies: mpsc::Receiver<PeerReply>) {
        for (peer, applied) in acked {
            if !applied.is_empty() {
                self.revert(&peer).await;
            }
        }

        while let Some((peer, result)) = replies.recv().await {
            if let PeerVote::Ack { applied } = read_vote(&self.membership, self.tx_id, &peer, result).await {
                tracing::info!("Late ack from {} for aborted {}", peer.id, self.tx_id);
                if !applied.is_empty() {
                    self.revert(&peer).await;
                }
            }
        }
    }

    async fn revert(&self, peer: &NodeInfo) {
        for attempt in 1..=REVERT_ATTEMPTS {
            let message = Message::Revert { tx_id: self.tx_id };
            let reason = match timeout(self.timeout, self.transport.request(&peer.address, message)).await {
                Ok(Ok(Message::RevertResponse { tx_id, reverted, .. })) if tx_id == self.tx_id => {
                    tracing::debug!("Reverted {:?} on {} for {}", reverted, peer.id, self.tx_id);
                    return;
                }
                Ok(Ok(Message::Error { message, .. })) => message,
                Ok(Ok(other)) => {
                    tracing::warn!("Unexpected reply {} from {} to Revert", other.type_name(), peer.id);
                    return;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "timed out".to_string(),
            };
            tracing::warn!(
                "Could not revert {} on {} (attempt {}/{}): {}",
                self.tx_id,
                peer.id,
                attempt,
                REVERT_ATTEMPTS,
                reason
            );
            tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ObjectKind;
    use tempfile::tempdir;

    struct Unreachable;

    #[async_trait::async_trait]
    impl PeerTransport for Unreachable {
        async fn request(&self, address: &str, _message: Message) -> Result<Message> {
            Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: "refused".into(),
            })
        }
    }

    fn coordinator(dir: &std::path::Path, peers: Vec<NodeInfo>) -> Coordinator {
        let membership = Arc::new(Membership::new("node-1".into(), "localhost:7654".into(), peers));
        Coordinator::new(
            Arc::new(ObjectStore::new(dir.join("objects"), true).unwrap()),
            Arc::new(RefStore::in_memory().unwrap()),
            membership,
            Arc::new(Unreachable),
            ReplicationConfig {
                replication_timeout_ms: 200,
                lock_wait_ms: 50,
                ..Default::default()
            },
        )
    }

    fn blob(body: &str) -> GitObject {
        GitObject::new(ObjectKind::Blob, body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_rejects_malformed_requests() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(dir.path(), Vec::new());
        let a = blob("a");

        let empty = coordinator.propose("test1", Vec::new(), Vec::new()).await;
        assert!(matches!(empty, Err(Error::InvalidRequest(_))));

        let twice = vec![
            RefUpdate::new("refs/heads/master", ObjectId::ZERO, a.id),
            RefUpdate::new("refs/heads/master", ObjectId::ZERO, a.id),
        ];
        let dup = coordinator.propose("test1", vec![a.clone()], twice).await;
        assert!(matches!(dup, Err(Error::InvalidRequest(_))));

        // Target never supplied
        let missing = coordinator
            .propose("test1", Vec::new(), vec![RefUpdate::new("refs/heads/master", ObjectId::ZERO, a.id)])
            .await;
        assert!(matches!(missing, Err(Error::ObjectNotFound(id)) if id == a.id));
    }

    #[tokio::test]
    async fn test_single_node_commits_alone() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(dir.path(), Vec::new());
        let a = blob("a");

        let report = coordinator
            .propose("test1", vec![a.clone()], vec![RefUpdate::new("refs/heads/master", ObjectId::ZERO, a.id)])
            .await
            .unwrap();
        assert_eq!((report.acks, report.quorum), (1, 1));
        assert_eq!(coordinator.refs.get("test1", "refs/heads/master").await.unwrap().unwrap().target, a.id);
    }

    #[tokio::test]
    async fn test_abort_rolls_back_and_marks_peers_down() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(
            dir.path(),
            vec![NodeInfo::new("node-2", "localhost:7655"), NodeInfo::new("node-3", "localhost:7656")],
        );
        let a = blob("a");

        let result = coordinator
            .propose("test1", vec![a.clone()], vec![RefUpdate::new("refs/heads/master", ObjectId::ZERO, a.id)])
            .await;
        assert!(matches!(result, Err(Error::QuorumUnreachable { acks: 1, required: 2 })));

        // The ref did not exist before, so no row is left behind
        let lock = coordinator.refs.lock("test1", "refs/heads/master").await.unwrap();
        assert!(coordinator.refs.current(&lock).unwrap().is_none());
        drop(lock);

        assert!(coordinator.membership.live_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_keeps_prior_generation() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(
            dir.path(),
            vec![NodeInfo::new("node-2", "localhost:7655"), NodeInfo::new("node-3", "localhost:7656")],
        );
        let (a, b) = (blob("a"), blob("b"));
        let master = "refs/heads/master";
        coordinator.refs.compare_and_swap("test1", master, ObjectId::ZERO, a.id).await.unwrap();

        for _ in 0..2 {
            let result = coordinator
                .propose("test1", vec![b.clone()], vec![RefUpdate::new(master, a.id, b.id)])
                .await;
            assert!(matches!(result, Err(Error::QuorumUnreachable { .. })));
        }

        let lock = coordinator.refs.lock("test1", master).await.unwrap();
        let record = coordinator.refs.current(&lock).unwrap().unwrap();
        assert_eq!((record.target, record.generation), (a.id, 1));
    }

    #[tokio::test]
    async fn test_locally_applied_push_still_needs_quorum() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(
            dir.path(),
            vec![NodeInfo::new("node-2", "localhost:7655"), NodeInfo::new("node-3", "localhost:7656")],
        );
        let a = blob("a");
        let master = "refs/heads/master";
        coordinator.refs.compare_and_swap("test1", master, ObjectId::ZERO, a.id).await.unwrap();

        let result = coordinator
            .propose("test1", vec![a.clone()], vec![RefUpdate::new(master, ObjectId::ZERO, a.id)])
            .await;
        assert!(matches!(result, Err(Error::QuorumUnreachable { acks: 1, required: 2 })));
        assert_eq!(coordinator.refs.get("test1", master).await.unwrap().unwrap().target, a.id);
    }
}
