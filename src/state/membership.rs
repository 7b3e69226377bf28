//! Cluster Membership Management
//!
//! Static view of the configured nodes plus the liveness of each peer as last
//! observed by heartbeats and replication RPCs. The quorum size always comes
//! from the configured node count, never from how many peers look alive.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::network::PeerTransport;
use crate::replication::Message;

/// Liveness of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Not probed yet; RPCs are still attempted
    Unknown,
    /// Answered the last probe
    Up,
    /// Failed the last probe or RPC
    Down,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Unknown => write!(f, "UNKNOWN"),
            NodeStatus::Up => write!(f, "UP"),
            NodeStatus::Down => write!(f, "DOWN"),
        }
    }
}

/// Identity of a configured node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub address: String,
}

impl NodeInfo {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

/// Observed state of a single peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Unique node identifier
    pub id: String,
    /// Node address (host:port)
    pub address: String,
    /// Current liveness
    pub status: NodeStatus,
    /// Last successful contact (not serialized)
    #[serde(skip)]
    pub last_contact: Option<Instant>,
    /// Wall-clock time of the last successful contact
    pub last_seen: Option<chrono::DateTime<chrono::Utc>>,
    /// Consecutive failed contacts
    pub failures: u32,
}

impl NodeState {
    /// Create a new, never-probed node state
    pub fn new(info: &NodeInfo) -> Self {
        Self {
            id: info.id.clone(),
            address: info.address.clone(),
            status: NodeStatus::Unknown,
            last_contact: None,
            last_seen: None,
            failures: 0,
        }
    }

    /// Whether RPCs to this node are worth attempting
    pub fn is_live(&self) -> bool {
        self.status != NodeStatus::Down
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo::new(self.id.clone(), self.address.clone())
    }

    /// Time since last successful contact
    pub fn time_since_contact(&self) -> Option<Duration> {
        self.last_contact.map(|t| t.elapsed())
    }
}

/// Cluster membership view
pub struct Membership {
    /// This node's ID
    node_id: String,
    /// This node's address
    address: String,
    /// Configured peers (excluding self), keyed by id
    peers: RwLock<HashMap<String, NodeState>>,
    /// Configured node count, including self
    cluster_size: usize,
}

impl Membership {
    /// Create a membership view over a fixed peer list
    pub fn new(node_id: String, address: String, peers: Vec<NodeInfo>) -> Self {
        let states: HashMap<String, NodeState> = peers
            .iter()
            .filter(|p| p.id != node_id)
            .map(|p| (p.id.clone(), NodeState::new(p)))
            .collect();
        let cluster_size = states.len() + 1;

        Self {
            node_id,
            address,
            peers: RwLock::new(states),
            cluster_size,
        }
    }

    /// Get this node's ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get this node's address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Configured cluster size (total nodes)
    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    /// Quorum size (majority of configured nodes)
    pub fn quorum(&self) -> usize {
        (self.cluster_size / 2) + 1
    }

    /// Get a peer's state
    pub async fn get(&self, id: &str) -> Option<NodeState> {
        self.peers.read().await.get(id).cloned()
    }

    /// All configured peers, sorted by id
    pub async fn peers(&self) -> Vec<NodeState> {
        let mut peers: Vec<NodeState> = self.peers.read().await.values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Peers that are not known to be down
    pub async fn live_peers(&self) -> Vec<NodeState> {
        self.peers()
            .await
            .into_iter()
            .filter(|p| p.is_live())
            .collect()
    }

    /// Record a successful contact. Returns true if the peer was not up before.
    pub async fn record_alive(&self, id: &str) -> bool {
        let mut peers = self.peers.write().await;
        let Some(node) = peers.get_mut(id) else {
            tracing::warn!("record_alive: node '{}' is not a configured peer", id);
            return false;
        };

        let came_up = node.status != NodeStatus::Up;
        node.status = NodeStatus::Up;
        node.last_contact = Some(Instant::now());
        node.last_seen = Some(chrono::Utc::now());
        node.failures = 0;

        if came_up {
            tracing::info!("Peer {} ({}) is up", node.id, node.address);
        }
        came_up
    }

    /// Record a failed contact. Returns true if the peer was not down before.
    pub async fn record_failure(&self, id: &str) -> bool {
        let mut peers = self.peers.write().await;
        let Some(node) = peers.get_mut(id) else {
            return false;
        };

        let went_down = node.status != NodeStatus::Down;
        node.status = NodeStatus::Down;
        node.failures = node.failures.saturating_add(1);

        if went_down {
            tracing::warn!("Peer {} ({}) is down", node.id, node.address);
        }
        went_down
    }

    /// Probe every peer in parallel and update liveness.
    ///
    /// Returns the peers that transitioned to up during this round.
    pub async fn heartbeat(&self, transport: &dyn PeerTransport, timeout: Duration) -> Vec<NodeInfo> {
        let peers = self.peers().await;

        let probes = peers.iter().map(|peer| {
            let message = Message::Heartbeat {
                node_id: self.node_id.clone(),
            };
            async move {
                let result = tokio::time::timeout(timeout, transport.request(&peer.address, message)).await;
                let alive = match result {
                    Ok(Ok(Message::HeartbeatAck { node_id })) if node_id == peer.id => true,
                    Ok(Ok(other)) => {
                        tracing::warn!(
                            "Unexpected heartbeat reply {} from {}",
                            other.type_name(),
                            peer.address
                        );
                        false
                    }
                    Ok(Err(e)) => {
                        tracing::trace!("Heartbeat to {} failed: {}", peer.id, e);
                        false
                    }
                    Err(_) => false,
                };
                (peer.info(), alive)
            }
        });

        let mut rejoined = Vec::new();
        for (info, alive) in futures::future::join_all(probes).await {
            if alive {
                if self.record_alive(&info.id).await {
                    rejoined.push(info);
                }
            } else {
                self.record_failure(&info.id).await;
            }
        }

        rejoined
    }

    /// Get cluster summary
    pub async fn summary(&self) -> ClusterSummary {
        let peers = self.peers.read().await;
        let live_peers = peers.values().filter(|p| p.status == NodeStatus::Up).count();
        let down_nodes = peers.values().filter(|p| p.status == NodeStatus::Down).count();
        let live_nodes = live_peers + 1;
        let quorum = self.quorum();

        ClusterSummary {
            node_id: self.node_id.clone(),
            total_nodes: self.cluster_size,
            live_nodes,
            down_nodes,
            quorum,
            has_quorum: live_nodes >= quorum,
        }
    }
}

/// Cluster summary information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub node_id: String,
    pub total_nodes: usize,
    /// Nodes confirmed up, including this one
    pub live_nodes: usize,
    pub down_nodes: usize,
    pub quorum: usize,
    pub has_quorum: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn three_nodes() -> Membership {
        Membership::new(
            "node-1".to_string(),
            "localhost:7654".to_string(),
            vec![
                NodeInfo::new("node-2", "localhost:7655"),
                NodeInfo::new("node-3", "localhost:7656"),
            ],
        )
    }

    /// Answers heartbeats for the addresses in `up`
    struct ScriptedTransport {
        up: Mutex<HashSet<String>>,
    }

    #[async_trait::async_trait]
    impl PeerTransport for ScriptedTransport {
        async fn request(&self, address: &str, _message: Message) -> Result<Message> {
            let node_id = match address {
                "localhost:7655" => "node-2",
                _ => "node-3",
            };
            if self.up.lock().unwrap().contains(address) {
                Ok(Message::HeartbeatAck { node_id: node_id.to_string() })
            } else {
                Err(Error::ConnectionFailed {
                    address: address.to_string(),
                    reason: "refused".into(),
                })
            }
        }
    }

    #[tokio::test]
    async fn test_cluster_membership() {
        let cluster = three_nodes();
        assert_eq!(cluster.cluster_size(), 3);
        assert_eq!(cluster.quorum(), 2);
        assert_eq!(cluster.live_peers().await.len(), 2);
    }

    #[tokio::test]
    async fn test_quorum_ignores_liveness() {
        let cluster = three_nodes();
        cluster.record_failure("node-2").await;
        cluster.record_failure("node-3").await;

        // A lone survivor never believes it is a majority
        assert_eq!(cluster.quorum(), 2);
        assert!(cluster.live_peers().await.is_empty());
        let summary = cluster.summary().await;
        assert_eq!(summary.live_nodes, 1);
        assert!(!summary.has_quorum);
    }

    #[tokio::test]
    async fn test_heartbeat_transitions() {
        let cluster = three_nodes();
        let transport = ScriptedTransport {
            up: Mutex::new(HashSet::from(["localhost:7655".to_string()])),
        };

        let rejoined = cluster.heartbeat(&transport, Duration::from_millis(100)).await;
        assert_eq!(rejoined, vec![NodeInfo::new("node-2", "localhost:7655")]);
        assert_eq!(cluster.get("node-3").await.unwrap().status, NodeStatus::Down);

        // Steady state reports nothing new
        assert!(cluster.heartbeat(&transport, Duration::from_millis(100)).await.is_empty());

        transport.up.lock().unwrap().insert("localhost:7656".to_string());
        let rejoined = cluster.heartbeat(&transport, Duration::from_millis(100)).await;
        assert_eq!(rejoined, vec![NodeInfo::new("node-3", "localhost:7656")]);
        assert!(cluster.summary().await.has_quorum);
    }
}
