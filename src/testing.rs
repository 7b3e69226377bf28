//! In-process cluster for tests
//!
//! `LocalCluster` runs several nodes in one runtime, each with its own data
//! directory, and routes their RPCs through `LocalTransport`. Stopping a node
//! makes it unreachable; restarting reopens it from disk with fresh liveness.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::config::GitQuorumConfig;
use crate::error::{Error, Result};
use crate::network::PeerTransport;
use crate::node::{Node, RepositorySnapshot};
use crate::replication::Message;
use crate::storage::{GitObject, ObjectId, ObjectKind};

pub const BODY1: &str = "Testing the planet";
pub const BODY2: &str = "Testing all the things";
pub const BODY3: &str = "Testing the code";
pub const BODY4: &str = "Testing even more";

/// Routes requests to in-process nodes by address
#[derive(Default)]
pub struct LocalTransport {
    nodes: RwLock<HashMap<String, Arc<Node>>>,
    in_flight: AtomicUsize,
}

impl LocalTransport {
    fn register(&self, address: &str, node: Arc<Node>) {
        self.nodes.write().unwrap().insert(address.to_string(), node);
    }

    fn unregister(&self, address: &str) {
        self.nodes.write().unwrap().remove(address);
    }

    fn route(&self, address: &str) -> Option<Arc<Node>> {
        self.nodes.read().unwrap().get(address).cloned()
    }
}

#[async_trait]
impl PeerTransport for LocalTransport {
    async fn request(&self, address: &str, message: Message) -> Result<Message> {
        let Some(node) = self.route(address) else {
            return Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: "node stopped".into(),
            });
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let reply = node.handle_message("local", message).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(reply)
    }
}

pub struct LocalCluster {
    transport: Arc<LocalTransport>,
    configs: Vec<GitQuorumConfig>,
    nodes: Vec<Option<Arc<Node>>>,
    _dir: TempDir,
}

impl LocalCluster {
    /// Start `size` nodes named node-1..node-N
    pub fn new(size: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(LocalTransport::default());
        let ids: Vec<String> = (1..=size).map(|i| format!("node-{}", i)).collect();

        let configs: Vec<GitQuorumConfig> = ids
            .iter()
            .map(|id| {
                let peers: Vec<String> = ids
                    .iter()
                    .filter(|p| *p != id)
                    .map(|p| format!("{{ id = \"{}\", address = \"{}:7654\" }}", p, p))
                    .collect();
                let toml = format!(
                    r#"
[node]
id = "{id}"
bind_address = "{id}:7654"
data_dir = "{data_dir}"

[cluster]
peers = [{peers}]
replication_timeout_ms = 500
lock_wait_ms = 100
heartbeat_timeout_ms = 200
"#,
                    id = id,
                    data_dir = dir.path().join(id).display(),
                    peers = peers.join(", "),
                );
                GitQuorumConfig::from_str(&toml).unwrap()
            })
            .collect();

        let mut cluster = Self {
            transport,
            nodes: vec![None; configs.len()],
            configs,
            _dir: dir,
        };
        for i in 0..size {
            cluster.restart(i);
        }
        cluster
    }

    /// Running node at `index`
    pub fn node(&self, index: usize) -> &Arc<Node> {
        self.nodes[index].as_ref().expect("node is stopped")
    }

    /// Make a node unreachable
    pub fn stop(&mut self, index: usize) {
        self.transport.unregister(&self.configs[index].node.bind_address);
        self.nodes[index] = None;
    }

    /// (Re)open a node from its data directory
    pub fn restart(&mut self, index: usize) {
        let config = &self.configs[index];
        let transport: Arc<dyn PeerTransport> = self.transport.clone();
        let node = Arc::new(Node::open(config, transport).unwrap());
        self.transport.register(&config.node.bind_address, Arc::clone(&node));
        self.nodes[index] = Some(node);
    }

    /// Let spawned replication tasks (late replies, compensations) finish
    pub async fn quiesce(&self) {
        for _ in 0..3 {
            for _ in 0..50 {
                tokio::task::yield_now().await;
            }
            while self.transport.in_flight.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    }
}

/// Build a commit holding `files` (paths may have one or more `/`).
///
/// Returns every new object and the commit id.
pub fn commit(files: &[(&str, &str)], parent: Option<ObjectId>) -> (Vec<GitObject>, ObjectId) {
    let mut objects = Vec::new();
    let files: Vec<(String, Vec<u8>)> = files
        .iter()
        .map(|(path, body)| (path.to_string(), body.as_bytes().to_vec()))
        .collect();
    let tree = build_tree(&files, &mut objects);

    let mut payload = format!("tree {}\n", tree);
    if let Some(parent) = parent {
        payload.push_str(&format!("parent {}\n", parent));
    }
    payload.push_str("author Test <test@example.com> 1700000000 +0000\n");
    payload.push_str("committer Test <test@example.com> 1700000000 +0000\n\n");
    payload.push_str(&format!("{} files\n", files.len()));

    let commit = GitObject::new(ObjectKind::Commit, payload.into_bytes());
    let id = commit.id;
    objects.push(commit);
    (objects, id)
}

fn build_tree(files: &[(String, Vec<u8>)], objects: &mut Vec<GitObject>) -> ObjectId {
    let mut blobs: BTreeMap<&str, &[u8]> = BTreeMap::new();
    let mut dirs: BTreeMap<&str, Vec<(String, Vec<u8>)>> = BTreeMap::new();
    for (path, body) in files {
        match path.split_once('/') {
            Some((dir, rest)) => dirs.entry(dir).or_default().push((rest.to_string(), body.clone())),
            None => {
                blobs.insert(path, body);
            }
        }
    }

    // (sort key, mode, name, id); git orders directories as if named "dir/"
    let mut entries: Vec<(String, &str, &str, ObjectId)> = Vec::new();
    for (name, body) in blobs {
        let blob = GitObject::new(ObjectKind::Blob, body.to_vec());
        entries.push((name.to_string(), "100644", name, blob.id));
        objects.push(blob);
    }
    for (name, children) in &dirs {
        let id = build_tree(children, objects);
        entries.push((format!("{}/", name), "40000", *name, id));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut payload = Vec::new();
    for (_, mode, name, id) in entries {
        payload.extend_from_slice(format!("{} {}\0", mode, name).as_bytes());
        payload.extend_from_slice(id.as_bytes());
    }
    let tree = GitObject::new(ObjectKind::Tree, payload);
    let id = tree.id;
    objects.push(tree);
    id
}

/// Files of the commit `name` points at, keyed by path
pub fn checkout(snapshot: &RepositorySnapshot, name: &str) -> BTreeMap<String, String> {
    let index: HashMap<ObjectId, &GitObject> = snapshot.objects.iter().map(|o| (o.id, o)).collect();
    let commit = index[&snapshot.target(name).expect("ref not in snapshot")];
    let tree = commit
        .references()
        .unwrap()
        .into_iter()
        .find(|id| index.get(id).map(|o| o.kind) == Some(ObjectKind::Tree))
        .expect("commit without tree");

    let mut files = BTreeMap::new();
    walk(&index, tree, "", &mut files);
    files
}

fn walk(index: &HashMap<ObjectId, &GitObject>, tree: ObjectId, prefix: &str, files: &mut BTreeMap<String, String>) {
    for entry in index[&tree].tree_entries().unwrap() {
        let path = format!("{}{}", prefix, entry.name);
        if entry.is_tree() {
            walk(index, entry.id, &format!("{}/", path), files);
        } else {
            let body = String::from_utf8(index[&entry.id].payload.clone()).unwrap();
            files.insert(path, body);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_and_checkout() {
        let (objects, id) = commit(&[("testdir/testfile1", BODY1), ("testfile3", BODY3)], None);
        assert!(objects.iter().all(|o| o.verify().is_ok()));
        // blob, blob, subtree, root tree, commit
        assert_eq!(objects.len(), 5);

        let snapshot = RepositorySnapshot {
            meta: crate::repository::RepositoryMeta::new(
                "test1",
                crate::repository::Visibility::Public,
                "admin",
            ),
            refs: vec![crate::storage::RefRecord {
                repo: "test1".into(),
                name: "refs/heads/master".into(),
                target: id,
                generation: 1,
            }],
            objects,
        };
        let files = checkout(&snapshot, "refs/heads/master");
        assert_eq!(files.len(), 2);
        assert_eq!(files["testdir/testfile1"], BODY1);
        assert_eq!(files["testfile3"], BODY3);
    }
}
