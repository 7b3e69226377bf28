//! HTTP API Server
//!
//! Status queries for operators and monitoring.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::repository::{Access, Visibility};
use crate::state::{ClusterSummary, NodeState};

/// Shared application state
pub struct AppState {
    pub node: Arc<Node>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, node: Arc<Node>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { node }),
        }
    }

    /// Create the router
    fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/cluster", get(handle_cluster_info))
            .route("/cluster/nodes", get(handle_nodes))
            .route("/cluster/nodes/:node_id", get(handle_node_info))
            .route("/repos", get(handle_repositories))
            .route("/repos/:name/refs", get(handle_refs))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let app = Self::create_router(Arc::clone(&self.state));

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Response Types ============

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub has_quorum: bool,
}

/// Cluster info response
#[derive(Debug, Serialize)]
pub struct ClusterInfoResponse {
    pub summary: ClusterSummary,
    pub nodes: Vec<NodeState>,
}

/// One ref as shown to API clients
#[derive(Debug, Serialize)]
pub struct RefEntry {
    pub name: String,
    pub target: String,
    pub generation: u64,
}

/// Refs of one repository
#[derive(Debug, Serialize)]
pub struct RefsResponse {
    pub repository: String,
    pub visibility: Visibility,
    pub refs: Vec<RefEntry>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(error: Error) -> Response {
    let (status, code) = match &error {
        Error::RepositoryNotFound(_) => (StatusCode::NOT_FOUND, "REPOSITORY_NOT_FOUND"),
        Error::AccessDenied(_) => (StatusCode::FORBIDDEN, "ACCESS_DENIED"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
    };
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let summary = state.node.summary().await;
    Json(HealthResponse {
        healthy: true,
        node_id: summary.node_id,
        has_quorum: summary.has_quorum,
    })
}

async fn handle_cluster_info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let summary = state.node.summary().await;
    let nodes = state.node.membership().peers().await;

    Json(ClusterInfoResponse { summary, nodes })
}

async fn handle_nodes(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.node.membership().peers().await)
}

async fn handle_node_info(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    match state.node.membership().get(&node_id).await {
        Some(node) => Json(node).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Node {} not found", node_id),
                code: "NODE_NOT_FOUND".to_string(),
            }),
        )
            .into_response(),
    }
}

async fn handle_repositories(State(state): State<Arc<AppState>>) -> Response {
    match state.node.repositories().await {
        Ok(names) => Json(names).into_response(),
        Err(e) => error_response(e),
    }
}

/// Anonymous read: private repositories answer 403
async fn handle_refs(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    let meta = match state.node.repository(&name).await {
        Ok(meta) => meta,
        Err(e) => return error_response(e),
    };

    match state.node.list_refs(&name, &Access::Anonymous).await {
        Ok(refs) => Json(RefsResponse {
            repository: name,
            visibility: meta.visibility,
            refs: refs
                .into_iter()
                .map(|r| RefEntry {
                    name: r.name,
                    target: r.target.to_hex(),
                    generation: r.generation,
                })
                .collect(),
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GitQuorumConfig;
    use crate::network::NetworkClient;
    use crate::storage::{GitObject, ObjectId, ObjectKind, RefUpdate};
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_status_and_refs_endpoints() {
        let dir = tempdir().unwrap();
        let config = GitQuorumConfig::from_str(&format!(
            "[node]\nid = \"node-1\"\nbind_address = \"127.0.0.1:0\"\ndata_dir = \"{}\"\n\n[cluster]\n",
            dir.path().display()
        ))
        .unwrap();
        let transport = Arc::new(NetworkClient::new(Duration::from_millis(100), Duration::from_millis(500)));
        let node = Arc::new(Node::open(&config, transport).unwrap());

        node.create_repository("test1", Visibility::Public, "admin").await.unwrap();
        node.create_repository("secret", Visibility::Private, "admin").await.unwrap();
        let blob = GitObject::new(ObjectKind::Blob, b"Testing the code".to_vec());
        node.push("test1", vec![blob.clone()], vec![RefUpdate::new("refs/heads/master", ObjectId::ZERO, blob.id)])
            .await
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let server = HttpServer::new(config.api.clone(), Arc::clone(&node));
        tokio::spawn(async move { server.serve(listener).await });

        let client = reqwest::Client::new();
        let health: serde_json::Value = client
            .get(format!("{}/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["node_id"], "node-1");
        assert_eq!(health["has_quorum"], true);

        let refs: serde_json::Value = client
            .get(format!("{}/repos/test1/refs", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(refs["visibility"], "public");
        assert_eq!(refs["refs"][0]["name"], "refs/heads/master");
        assert_eq!(refs["refs"][0]["target"], blob.id.to_hex());

        let private = client.get(format!("{}/repos/secret/refs", base)).send().await.unwrap();
        assert_eq!(private.status(), reqwest::StatusCode::FORBIDDEN);

        let missing = client.get(format!("{}/repos/nope/refs", base)).send().await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    }
}
