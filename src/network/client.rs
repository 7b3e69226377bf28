//! Network Client
//!
//! TCP client for connecting to other nodes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{read_message, write_message, PeerTransport};
use crate::error::{Error, Result};
use crate::replication::Message;

/// Idle pooled connection
struct PoolEntry {
    stream: TcpStream,
    last_used: Instant,
}

/// Network client for connecting to peer nodes
pub struct NetworkClient {
    /// Idle connections per address
    pool: Mutex<HashMap<String, Vec<PoolEntry>>>,
    /// Connection timeout
    connect_timeout: Duration,
    /// Request timeout
    request_timeout: Duration,
    /// Max idle connections kept per peer
    max_idle: usize,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            pool: Mutex::new(HashMap::new()),
            connect_timeout,
            request_timeout,
            max_idle: 4,
        }
    }

    /// Send a message to a peer and wait for response
    pub async fn send(&self, address: &str, message: Message) -> Result<Message> {
        match timeout(self.request_timeout, self.send_inner(address, message)).await {
            Ok(inner_result) => inner_result,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Send without timeout wrapper
    async fn send_inner(&self, address: &str, message: Message) -> Result<Message> {
        // A pooled connection may have been closed by the peer; fall through to a fresh one
        if let Some(mut entry) = self.checkout(address).await {
            match exchange(&mut entry.stream, &message).await {
                Ok(response) => {
                    self.checkin(address, entry.stream).await;
                    return Ok(response);
                }
                Err(e) => {
                    tracing::debug!("Pooled connection to {} failed: {}", address, e);
                }
            }
        }

        let mut stream = self.connect(address).await?;
        let response = exchange(&mut stream, &message).await?;
        self.checkin(address, stream).await;
        Ok(response)
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    async fn checkout(&self, address: &str) -> Option<PoolEntry> {
        self.pool.lock().await.get_mut(address).and_then(|idle| idle.pop())
    }

    async fn checkin(&self, address: &str, stream: TcpStream) {
        let mut pool = self.pool.lock().await;
        let idle = pool.entry(address.to_string()).or_default();
        if idle.len() < self.max_idle {
            idle.push(PoolEntry {
                stream,
                last_used: Instant::now(),
            });
        }
    }

    /// Clean up stale connections
    pub async fn cleanup_stale(&self, max_idle: Duration) {
        let mut pool = self.pool.lock().await;
        for (addr, idle) in pool.iter_mut() {
            let before = idle.len();
            idle.retain(|e| e.last_used.elapsed() <= max_idle);
            if idle.len() != before {
                tracing::debug!("Dropped {} stale connections to {}", before - idle.len(), addr);
            }
        }
        pool.retain(|_, idle| !idle.is_empty());
    }

    /// Get idle connection count
    pub async fn connection_count(&self) -> usize {
        self.pool.lock().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl PeerTransport for NetworkClient {
    async fn request(&self, address: &str, message: Message) -> Result<Message> {
        self.send(address, message).await
    }
}

async fn exchange(stream: &mut TcpStream, message: &Message) -> Result<Message> {
    let (mut reader, mut writer) = stream.split();
    write_message(&mut writer, message).await?;
    read_message(&mut reader).await
}
