//! GitQuorum - Quorum-Replicated Git Hosting Engine
//!
//! Runs one cluster node: the peer RPC server, the heartbeat and
//! anti-entropy loop, and the HTTP status API.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gitquorum::api::HttpServer;
use gitquorum::config::GitQuorumConfig;
use gitquorum::network::{MessageHandler, NetworkClient, NetworkServer};
use gitquorum::node::Node;

/// GitQuorum - Quorum-Replicated Git Hosting Engine
#[derive(Parser)]
#[command(name = "gitquorum")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "gitquorum.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to the configured level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start,

    /// Show cluster status as seen by a node
    Status {
        /// HTTP API address of the node to query
        #[arg(short, long, default_value = "localhost:8080")]
        address: String,
    },

    /// List the refs of a repository
    Refs {
        /// Repository name
        repo: String,

        /// HTTP API address of the node to query
        #[arg(short, long, default_value = "localhost:8080")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "gitquorum.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = cli
        .log_level
        .clone()
        .or_else(|| {
            GitQuorumConfig::from_file(&cli.config)
                .ok()
                .map(|c| c.logging.level)
        })
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level);

    match cli.command {
        Commands::Start => run_start(&cli.config).await,
        Commands::Status { address } => run_get(&format!("http://{}/cluster", address)).await,
        Commands::Refs { repo, address } => {
            run_get(&format!("http://{}/repos/{}/refs", address, repo)).await
        }
        Commands::Init { output, node_id } => run_init(&output, &node_id),
        Commands::Validate => run_validate(&cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start the node
async fn run_start(config_path: &Path) -> Result<()> {
    let config = GitQuorumConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    tracing::info!("Starting GitQuorum node {}", config.node.id);
    tracing::info!("Bind address: {}", config.node.bind_address);
    tracing::info!("Data directory: {}", config.data_dir().display());
    tracing::info!(
        "Cluster: {} nodes, quorum {}",
        config.cluster_size(),
        config.quorum_size()
    );

    let transport = Arc::new(NetworkClient::new(
        config.connect_timeout(),
        Duration::from_millis(config.cluster.replication_timeout_ms),
    ));
    let node = Arc::new(Node::open(&config, transport).context("opening local stores")?);

    let network_server = Arc::new(
        NetworkServer::bind(&config.node.bind_address)
            .await
            .with_context(|| format!("binding {}", config.node.bind_address))?,
    );

    let handler: Arc<dyn MessageHandler> = Arc::clone(&node) as Arc<dyn MessageHandler>;
    let server = Arc::clone(&network_server);
    let mut server_task = tokio::spawn(async move { server.serve(handler).await });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background_node = Arc::clone(&node);
    let background = tokio::spawn(async move { background_node.run(shutdown_rx).await });

    if config.api.enabled {
        let http_server = HttpServer::new(config.api.clone(), Arc::clone(&node));
        tokio::spawn(async move {
            if let Err(e) = http_server.start().await {
                tracing::error!("HTTP server error: {}", e);
            }
        });
    }

    tokio::select! {
        result = &mut server_task => {
            match result {
                Ok(Err(e)) => tracing::error!("Network server error: {}", e),
                Err(e) => tracing::error!("Network server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    network_server.stop();
    let _ = shutdown_tx.send(true);
    if let Ok(Err(e)) = background.await {
        tracing::warn!("Background loop ended with error: {}", e);
    }

    tracing::info!("GitQuorum node {} stopped", config.node.id);
    Ok(())
}

/// Fetch a status endpoint and print it
async fn run_get(url: &str) -> Result<()> {
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("requesting {}", url))?;
    let status = response.status();
    let body: serde_json::Value = response.json().await.context("decoding response")?;

    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        anyhow::bail!("{} returned {}", url, status);
    }
    Ok(())
}

/// Initialize configuration file
fn run_init(output: &Path, node_id: &str) -> Result<()> {
    let config_content = format!(
        r#"# GitQuorum Configuration
# Generated configuration file

[node]
id = "{node_id}"
bind_address = "0.0.0.0:7654"
data_dir = "/var/lib/gitquorum/{node_id}"
# advertise_address = "my-public-ip:7654"

[cluster]
# Every other node of the cluster; quorum is computed from this list plus this node
peers = []
# peers = [
#     {{ id = "node-2", address = "node-2.example.com:7654" }},
#     {{ id = "node-3", address = "node-3.example.com:7654" }},
# ]
heartbeat_interval_ms = 500
heartbeat_timeout_ms = 1000
replication_timeout_ms = 5000
lock_wait_ms = 1000
anti_entropy_interval_ms = 30000
connect_timeout_ms = 1000

[storage]
compression = true

[api]
enabled = true
bind_address = "0.0.0.0:8080"

[logging]
level = "info"
"#
    );

    std::fs::write(output, config_content)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to list the cluster peers.");
    println!("Then start with: gitquorum --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: &Path) -> Result<()> {
    match GitQuorumConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Data Directory: {}", config.data_dir().display());
            println!("  Peers: {}", config.cluster.peers.len());
            println!("  Quorum Size: {}", config.quorum_size());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}
