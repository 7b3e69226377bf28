//! Cluster node
//!
//! Owns the local stores and the replication components, and exposes the
//! operations transport adapters call: push, fetch and repository admin.

use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::sync::watch;

use crate::config::GitQuorumConfig;
use crate::error::{Error, Result};
use crate::network::{MessageHandler, PeerTransport};
use crate::replication::{
    AntiEntropy, CommitReport, Coordinator, ErrorCode, Message, Replica, ReplicationConfig,
};
use crate::repository::{self, Access, RepositoryMeta, Visibility, METADATA_REF};
use crate::state::{ClusterSummary, Membership, NodeInfo, NodeStatus};
use crate::storage::{GitObject, ObjectId, ObjectStore, RefRecord, RefStore, RefUpdate};

/// What a clone or fetch reads from one node
#[derive(Debug, Clone)]
pub struct RepositorySnapshot {
    pub meta: RepositoryMeta,
    /// Live refs, metadata ref excluded
    pub refs: Vec<RefRecord>,
    /// Every object reachable from `refs`
    pub objects: Vec<GitObject>,
}

impl RepositorySnapshot {
    pub fn target(&self, name: &str) -> Option<ObjectId> {
        self.refs.iter().find(|r| r.name == name).map(|r| r.target)
    }
}

/// One member of the cluster
pub struct Node {
    node_id: String,
    objects: Arc<ObjectStore>,
    refs: Arc<RefStore>,
    membership: Arc<Membership>,
    transport: Arc<dyn PeerTransport>,
    coordinator: Coordinator,
    replica: Replica,
    anti_entropy: AntiEntropy,
    config: ReplicationConfig,
}

impl Node {
    /// Open the stores under the configured data directory
    pub fn open(config: &GitQuorumConfig, transport: Arc<dyn PeerTransport>) -> Result<Self> {
        let objects = Arc::new(ObjectStore::new(config.objects_dir(), config.storage.compression)?);
        let refs = Arc::new(RefStore::open(&config.refs_db_path())?);
        let membership = Arc::new(Membership::new(
            config.node.id.clone(),
            config.advertise_address().to_string(),
            config.peer_nodes(),
        ));

        tracing::info!(
            "Node {} opened {} ({} configured nodes, quorum {})",
            config.node.id,
            config.data_dir().display(),
            membership.cluster_size(),
            membership.quorum()
        );

        Ok(Self::new(objects, refs, membership, transport, ReplicationConfig::from(config)))
    }

    pub fn new(
        objects: Arc<ObjectStore>,
        refs: Arc<RefStore>,
        membership: Arc<Membership>,
        transport: Arc<dyn PeerTransport>,
        config: ReplicationConfig,
    ) -> Self {
        let node_id = membership.node_id().to_string();
        let coordinator = Coordinator::new(
            Arc::clone(&objects),
            Arc::clone(&refs),
            Arc::clone(&membership),
            Arc::clone(&transport),
            config.clone(),
        );
        let replica = Replica::new(Arc::clone(&objects), Arc::clone(&refs), config.lock_wait());
        let anti_entropy = AntiEntropy::new(
            node_id.clone(),
            Arc::clone(&objects),
            Arc::clone(&refs),
            Arc::clone(&transport),
            config.lock_wait(),
            config.replication_timeout(),
        );

        Self {
            node_id,
            objects,
            refs,
            membership,
            transport,
            coordinator,
            replica,
            anti_entropy,
            config,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub async fn summary(&self) -> ClusterSummary {
        self.membership.summary().await
    }

    // ========== Write path ==========

    /// Replicate a push. Unknown repositories and metadata edits are refused up front.
    pub async fn push(
        &self,
        repo: &str,
        objects: Vec<GitObject>,
        updates: Vec<RefUpdate>,
    ) -> Result<CommitReport> {
        if updates.iter().any(|u| u.name == METADATA_REF) {
            return Err(Error::InvalidRequest(format!("{} is reserved", METADATA_REF)));
        }
        self.repository(repo).await?;

        self.coordinator.propose(repo, objects, updates).await
    }

    pub async fn create_repository(
        &self,
        name: &str,
        visibility: Visibility,
        owner: &str,
    ) -> Result<RepositoryMeta> {
        repository::validate_name(name)?;
        if self.refs.get(name, METADATA_REF).await?.is_some() {
            return Err(Error::RepositoryExists(name.to_string()));
        }

        let meta = RepositoryMeta::new(name, visibility, owner);
        let object = meta.to_object()?;
        let update = RefUpdate::new(METADATA_REF, ObjectId::ZERO, object.id);

        match self.coordinator.propose(name, vec![object], vec![update]).await {
            Ok(_) => {
                tracing::info!("Created {} repository {} for {}", visibility, name, owner);
                Ok(meta)
            }
            Err(Error::RefConflict { .. }) => Err(Error::RepositoryExists(name.to_string())),
            Err(e) => Err(e),
        }
    }

    pub async fn set_visibility(&self, name: &str, visibility: Visibility) -> Result<RepositoryMeta> {
        let (current, mut meta) = self.load_meta(name).await?;
        meta.visibility = visibility;
        let object = meta.to_object()?;
        let update = RefUpdate::new(METADATA_REF, current, object.id);

        self.coordinator.propose(name, vec![object], vec![update]).await?;
        tracing::info!("Repository {} is now {}", name, visibility);
        Ok(meta)
    }

    // ========== Read path ==========

    pub async fn repository(&self, name: &str) -> Result<RepositoryMeta> {
        Ok(self.load_meta(name).await?.1)
    }

    async fn load_meta(&self, name: &str) -> Result<(ObjectId, RepositoryMeta)> {
        let record = self
            .refs
            .get(name, METADATA_REF)
            .await?
            .ok_or_else(|| Error::RepositoryNotFound(name.to_string()))?;
        let meta = RepositoryMeta::from_object(&self.objects.get(&record.target)?)?;
        Ok((record.target, meta))
    }

    /// Names of the repositories this node knows about
    pub async fn repositories(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for repo in self.refs.repositories()? {
            if self.refs.get(&repo, METADATA_REF).await?.is_some() {
                names.push(repo);
            }
        }
        Ok(names)
    }

    async fn readable(&self, repo: &str, access: &Access) -> Result<RepositoryMeta> {
        let meta = self.repository(repo).await?;
        if !meta.can_read(access) {
            return Err(Error::AccessDenied(repo.to_string()));
        }
        Ok(meta)
    }

    async fn live_refs(&self, repo: &str) -> Result<Vec<RefRecord>> {
        let mut refs = self.refs.snapshot(repo).await?;
        refs.retain(|r| r.name != METADATA_REF);
        Ok(refs)
    }

    /// Refs of a repository, subject to its read rules
    pub async fn list_refs(&self, repo: &str, access: &Access) -> Result<Vec<RefRecord>> {
        self.readable(repo, access).await?;
        self.live_refs(repo).await
    }

    /// Everything a clone needs, read from this node only
    pub async fn fetch(&self, repo: &str, access: &Access) -> Result<RepositorySnapshot> {
        let meta = self.readable(repo, access).await?;
        let refs = self.live_refs(repo).await?;
        let roots: Vec<ObjectId> = refs.iter().map(|r| r.target).collect();
        let objects = self.objects.closure(&roots)?;

        tracing::debug!(
            "Fetch of {} from {}: {} refs, {} objects",
            repo,
            self.node_id,
            refs.len(),
            objects.len()
        );
        Ok(RepositorySnapshot { meta, refs, objects })
    }

    // ========== Peer RPC ==========

    pub async fn handle_message(&self, peer_addr: &str, message: Message) -> Message {
        tracing::trace!("Handling {} from {}", message.type_name(), peer_addr);

        match message {
            // Liveness is tracked from our own probes only
            Message::Heartbeat { .. } => Message::HeartbeatAck {
                node_id: self.node_id.clone(),
            },
            Message::Replicate {
                tx_id,
                origin,
                repo,
                objects,
                updates,
            } => {
                tracing::debug!("Transaction {} from {} for {}", tx_id, origin, repo);
                let vote = self.replica.apply(tx_id, &repo, &objects, &updates).await;
                Message::ReplicateResponse {
                    tx_id,
                    node_id: self.node_id.clone(),
                    vote,
                }
            }
            Message::Revert { tx_id } => match self.replica.revert(tx_id).await {
                Ok(reverted) => Message::RevertResponse {
                    tx_id,
                    node_id: self.node_id.clone(),
                    reverted,
                },
                Err(e) => Message::Error {
                    code: ErrorCode::Storage,
                    message: e.to_string(),
                },
            },
            Message::AntiEntropyPull { node_id, have } => {
                tracing::debug!("Serving anti-entropy pull from {}", node_id);
                match self.anti_entropy.serve_pull(&have).await {
                    Ok(response) => response,
                    Err(e) => Message::Error {
                        code: ErrorCode::Storage,
                        message: e.to_string(),
                    },
                }
            }
            Message::StatusRequest => Message::StatusResponse {
                summary: self.membership.summary().await,
            },
            other => Message::Error {
                code: ErrorCode::UnexpectedMessage,
                message: format!("{} is not a request", other.type_name()),
            },
        }
    }

    // ========== Background ==========

    /// Probe peers; catch up from every peer that just came up.
    ///
    /// Returns the number of changes pulled.
    pub async fn heartbeat_tick(&self) -> usize {
        let rejoined = self
            .membership
            .heartbeat(self.transport.as_ref(), self.config.heartbeat_timeout())
            .await;

        let mut applied = 0;
        for peer in rejoined {
            match self.anti_entropy.sync(&peer).await {
                Ok(n) => applied += n,
                Err(e) => tracing::warn!("Catch-up from {} failed: {}", peer.id, e),
            }
        }
        applied
    }

    /// Pull from one random peer that is up
    pub async fn anti_entropy_tick(&self) -> Result<usize> {
        let up: Vec<NodeInfo> = self
            .membership
            .peers()
            .await
            .into_iter()
            .filter(|p| p.status == NodeStatus::Up)
            .map(|p| p.info())
            .collect();

        let peer = {
            let mut rng = rand::thread_rng();
            up.choose(&mut rng).cloned()
        };
        match peer {
            Some(peer) => self.anti_entropy.sync(&peer).await,
            None => Ok(0),
        }
    }

    /// Heartbeat and anti-entropy loop
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        let mut anti_entropy = tokio::time::interval(self.config.anti_entropy_interval());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        anti_entropy.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first heartbeat round already syncs with every reachable peer
        anti_entropy.tick().await;

        tracing::info!("Node {} background loop started", self.node_id);
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    self.heartbeat_tick().await;
                }
                _ = anti_entropy.tick() => {
                    if let Err(e) = self.anti_entropy_tick().await {
                        tracing::warn!("Anti-entropy failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Node {} background loop stopped", self.node_id);
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for Node {
    async fn handle(&self, peer_addr: &str, message: Message) -> Message {
        self.handle_message(peer_addr, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::render_rejection;
    use crate::testing::{self, LocalCluster, BODY1, BODY2, BODY3, BODY4};

    const MASTER: &str = "refs/heads/master";

    fn four_files() -> Vec<(&'static str, &'static str)> {
        vec![
            ("testdir/testfile1", BODY1),
            ("testdir/testfile2", BODY2),
            ("testfile3", BODY3),
            ("testfile4", BODY4),
        ]
    }

    async fn cluster_with_repo(size: usize) -> LocalCluster {
        let cluster = LocalCluster::new(size);
        cluster
            .node(0)
            .create_repository("test1", Visibility::Public, "admin")
            .await
            .unwrap();
        cluster.quiesce().await;
        cluster
    }

    #[tokio::test]
    async fn test_push_and_clone_from_every_node() {
        let cluster = cluster_with_repo(3).await;
        let (objects, commit) = testing::commit(&four_files(), None);

        let report = cluster
            .node(0)
            .push("test1", objects, vec![RefUpdate::new(MASTER, ObjectId::ZERO, commit)])
            .await
            .unwrap();
        assert!(report.render().contains("* [new branch]      master -> master"));
        cluster.quiesce().await;

        for i in 0..3 {
            let snapshot = cluster.node(i).fetch("test1", &Access::Anonymous).await.unwrap();
            assert_eq!(snapshot.target(MASTER), Some(commit));
            let files = testing::checkout(&snapshot, MASTER);
            assert_eq!(files["testdir/testfile1"], BODY1);
            assert_eq!(files["testfile4"], BODY4);
        }
    }

    #[tokio::test]
    async fn test_one_node_down_commits_and_catches_up() {
        let mut cluster = cluster_with_repo(3).await;
        cluster.stop(2);

        let (objects, commit) = testing::commit(&four_files(), None);
        let report = cluster
            .node(0)
            .push("test1", objects, vec![RefUpdate::new(MASTER, ObjectId::ZERO, commit)])
            .await
            .unwrap();
        assert_eq!((report.acks, report.quorum), (2, 2));

        cluster.quiesce().await;

        // Back from the dead but not caught up yet
        cluster.restart(2);
        let stale = cluster.node(2).fetch("test1", &Access::Anonymous).await.unwrap();
        assert_eq!(stale.target(MASTER), None);

        assert!(cluster.node(2).heartbeat_tick().await > 0);
        let snapshot = cluster.node(2).fetch("test1", &Access::Anonymous).await.unwrap();
        assert_eq!(snapshot.target(MASTER), Some(commit));
        assert_eq!(testing::checkout(&snapshot, MASTER)["testfile3"], BODY3);
    }

    #[tokio::test]
    async fn test_two_nodes_down_fails_then_retry_succeeds() {
        let mut cluster = cluster_with_repo(3).await;
        let (objects, first) = testing::commit(&four_files()[..2], None);
        cluster
            .node(0)
            .push("test1", objects, vec![RefUpdate::new(MASTER, ObjectId::ZERO, first)])
            .await
            .unwrap();
        cluster.quiesce().await;

        cluster.stop(1);
        cluster.stop(2);

        let (objects, second) = testing::commit(&four_files(), Some(first));
        let updates = vec![RefUpdate::new(MASTER, first, second)];
        let err = cluster
            .node(0)
            .push("test1", objects.clone(), updates.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuorumUnreachable { acks: 1, required: 2 }));
        assert!(render_rejection(&err, &updates).join("\n").contains("Object sync failed"));
        assert_eq!(
            cluster.node(0).fetch("test1", &Access::Anonymous).await.unwrap().target(MASTER),
            Some(first)
        );
        cluster.quiesce().await;

        // Identical retry once a second node is back
        cluster.restart(1);
        let report = cluster.node(0).push("test1", objects, updates).await.unwrap();
        assert!(report
            .render()
            .contains(&format!("   {}..{}  master -> master", first.short(), second.short())));
        assert_eq!(
            cluster.node(1).fetch("test1", &Access::Anonymous).await.unwrap().target(MASTER),
            Some(second)
        );
    }

    #[tokio::test]
    async fn test_failed_pushes_do_not_override_later_commit() {
        let mut cluster = cluster_with_repo(3).await;
        let (objects, first) = testing::commit(&four_files()[..1], None);
        cluster
            .node(0)
            .push("test1", objects, vec![RefUpdate::new(MASTER, ObjectId::ZERO, first)])
            .await
            .unwrap();
        cluster.quiesce().await;

        // node-1 alone: two pushes abort and roll back
        cluster.stop(1);
        cluster.stop(2);
        let files = four_files();
        for count in [2, 3] {
            let (objects, lost) = testing::commit(&files[..count], Some(first));
            let err = cluster
                .node(0)
                .push("test1", objects, vec![RefUpdate::new(MASTER, first, lost)])
                .await
                .unwrap_err();
            assert!(matches!(err, Error::QuorumUnreachable { .. }));
        }
        cluster.quiesce().await;

        // node-2 and node-3 commit without node-1
        cluster.stop(0);
        cluster.restart(1);
        cluster.restart(2);
        let (objects, kept) = testing::commit(&four_files(), Some(first));
        let report = cluster
            .node(1)
            .push("test1", objects, vec![RefUpdate::new(MASTER, first, kept)])
            .await
            .unwrap();
        assert_eq!((report.acks, report.quorum), (2, 2));
        cluster.quiesce().await;

        cluster.restart(0);
        cluster.node(1).heartbeat_tick().await;
        cluster.node(0).heartbeat_tick().await;
        cluster.quiesce().await;

        for i in 0..3 {
            let snapshot = cluster.node(i).fetch("test1", &Access::Anonymous).await.unwrap();
            assert_eq!(snapshot.target(MASTER), Some(kept), "node-{}", i + 1);
        }
    }

    #[tokio::test]
    async fn test_private_then_public() {
        let cluster = LocalCluster::new(3);
        cluster
            .node(2)
            .create_repository("test2", Visibility::Private, "admin")
            .await
            .unwrap();
        cluster.quiesce().await;

        let denied = cluster.node(0).fetch("test2", &Access::Anonymous).await;
        assert!(matches!(denied, Err(Error::AccessDenied(_))));
        cluster
            .node(0)
            .fetch("test2", &Access::Authenticated("admin".into()))
            .await
            .unwrap();

        // Toggled through the quorum path from another node
        let meta = cluster.node(1).set_visibility("test2", Visibility::Public).await.unwrap();
        assert_eq!(meta.visibility, Visibility::Public);
        cluster.quiesce().await;

        for i in 0..3 {
            cluster.node(i).fetch("test2", &Access::Anonymous).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_resubmit_is_idempotent_until_ref_moves() {
        let cluster = cluster_with_repo(3).await;
        let (objects, first) = testing::commit(&four_files()[..2], None);
        let push = vec![RefUpdate::new(MASTER, ObjectId::ZERO, first)];

        cluster.node(0).push("test1", objects.clone(), push.clone()).await.unwrap();
        cluster.quiesce().await;
        let again = cluster.node(0).push("test1", objects.clone(), push.clone()).await.unwrap();
        assert_eq!(again.render(), "Everything up-to-date");

        let (more, second) = testing::commit(&four_files(), Some(first));
        let report = cluster
            .node(1)
            .push("test1", more, vec![RefUpdate::new(MASTER, first, second)])
            .await
            .unwrap();
        assert!(report.render().contains("  master -> master"));
        cluster.quiesce().await;

        let stale = cluster.node(0).push("test1", objects, push).await;
        assert!(matches!(stale, Err(Error::RefConflict { current, .. }) if current == second));
    }

    #[tokio::test]
    async fn test_multi_ref_push_is_atomic() {
        let cluster = cluster_with_repo(3).await;
        let (objects, commit) = testing::commit(&four_files(), None);

        // `dev` is claimed to be somewhere it never was
        let elsewhere = GitObject::new(crate::storage::ObjectKind::Blob, b"elsewhere".to_vec()).id;
        let updates = vec![
            RefUpdate::new(MASTER, ObjectId::ZERO, commit),
            RefUpdate::new("refs/heads/dev", elsewhere, commit),
        ];
        let result = cluster.node(0).push("test1", objects.clone(), updates).await;
        assert!(matches!(result, Err(Error::RefConflict { ref name, .. }) if name == "refs/heads/dev"));
        assert_eq!(cluster.node(0).fetch("test1", &Access::Anonymous).await.unwrap().target(MASTER), None);

        // Both land together when consistent
        let updates = vec![
            RefUpdate::new(MASTER, ObjectId::ZERO, commit),
            RefUpdate::new("refs/tags/v1", ObjectId::ZERO, commit),
        ];
        let report = cluster.node(0).push("test1", objects, updates).await.unwrap();
        assert_eq!(report.lines().len(), 2);
        cluster.quiesce().await;
        let snapshot = cluster.node(2).fetch("test1", &Access::Anonymous).await.unwrap();
        assert_eq!(snapshot.target("refs/tags/v1"), Some(commit));
    }

    #[tokio::test]
    async fn test_corrupt_object_rejected_before_fan_out() {
        let cluster = cluster_with_repo(3).await;
        let (mut objects, commit) = testing::commit(&four_files(), None);
        let tampered = objects
            .iter_mut()
            .find(|o| o.payload == BODY3.as_bytes())
            .unwrap();
        tampered.payload = b"Testing the c0de".to_vec();
        let bad = tampered.id;

        let updates = vec![RefUpdate::new(MASTER, ObjectId::ZERO, commit)];
        let err = cluster.node(0).push("test1", objects, updates.clone()).await.unwrap_err();
        assert_eq!(render_rejection(&err, &updates), vec![format!("ERR Object corrupt: {}", bad)]);

        for i in 0..3 {
            assert!(!cluster.node(i).objects.has(&commit));
        }
    }

    #[tokio::test]
    async fn test_peer_conflict_is_a_nack_and_heals() {
        let mut cluster = cluster_with_repo(3).await;
        let (objects, first) = testing::commit(&four_files()[..1], None);

        cluster.stop(2);
        cluster
            .node(0)
            .push("test1", objects, vec![RefUpdate::new(MASTER, ObjectId::ZERO, first)])
            .await
            .unwrap();

        cluster.quiesce().await;

        // node-3 comes back without catching up and votes conflict on the next push
        cluster.restart(2);
        cluster.node(0).heartbeat_tick().await;
        let (more, second) = testing::commit(&four_files(), Some(first));
        let report = cluster
            .node(0)
            .push("test1", more, vec![RefUpdate::new(MASTER, first, second)])
            .await
            .unwrap();
        assert_eq!(report.acks, 2);
        cluster.quiesce().await;
        let behind = cluster.node(2).fetch("test1", &Access::Anonymous).await.unwrap();
        assert_eq!(behind.target(MASTER), None);

        cluster.node(2).heartbeat_tick().await;
        let snapshot = cluster.node(2).fetch("test1", &Access::Anonymous).await.unwrap();
        assert_eq!(snapshot.target(MASTER), Some(second));
    }

    #[tokio::test]
    async fn test_abort_reverts_peers_that_acked() {
        let mut cluster = cluster_with_repo(5).await;
        for i in 2..5 {
            cluster.stop(i);
        }

        let (objects, commit) = testing::commit(&four_files(), None);
        let err = cluster
            .node(0)
            .push("test1", objects, vec![RefUpdate::new(MASTER, ObjectId::ZERO, commit)])
            .await
            .unwrap_err();
        // node-2's ack may land before or after the abort; it is reverted either way
        assert!(matches!(err, Error::QuorumUnreachable { required: 3, .. }));
        cluster.quiesce().await;

        for i in 0..2 {
            let snapshot = cluster.node(i).fetch("test1", &Access::Anonymous).await.unwrap();
            assert_eq!(snapshot.target(MASTER), None);
        }
    }

    #[tokio::test]
    async fn test_push_guards() {
        let cluster = cluster_with_repo(3).await;
        let (objects, commit) = testing::commit(&four_files(), None);

        let unknown = cluster
            .node(0)
            .push("nope", objects.clone(), vec![RefUpdate::new(MASTER, ObjectId::ZERO, commit)])
            .await;
        assert!(matches!(unknown, Err(Error::RepositoryNotFound(_))));

        let meta = cluster
            .node(0)
            .push("test1", objects, vec![RefUpdate::new(METADATA_REF, ObjectId::ZERO, commit)])
            .await;
        assert!(matches!(meta, Err(Error::InvalidRequest(_))));

        let dup = cluster.node(1).create_repository("test1", Visibility::Public, "admin").await;
        assert!(matches!(dup, Err(Error::RepositoryExists(_))));
        assert_eq!(cluster.node(2).repositories().await.unwrap(), vec!["test1".to_string()]);
    }
}
