//! Anti-entropy
//!
//! Pull-based catch-up for nodes that missed transactions. The puller sends
//! its object inventory; the peer answers with a page of the objects the
//! puller lacks and, on the last page, every ref record it holds. A peer
//! record is only taken when its generation is higher than the local one.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::network::PeerTransport;
use crate::replication::Message;
use crate::state::NodeInfo;
use crate::storage::{GitObject, ObjectId, ObjectStore, PutOutcome, RefRecord, RefStore};

/// Object bytes sent in one pull response, well under the frame limit
pub const PAGE_BYTES: usize = 64 * 1024 * 1024;

pub struct AntiEntropy {
    node_id: String,
    objects: Arc<ObjectStore>,
    refs: Arc<RefStore>,
    transport: Arc<dyn PeerTransport>,
    /// Bounded wait for ref locks; busy refs are left for the next round
    lock_wait: Duration,
    /// RPC deadline for one pull
    timeout: Duration,
    /// Object bytes per response page
    page_bytes: usize,
}

impl AntiEntropy {
    pub fn new(
        node_id: String,
        objects: Arc<ObjectStore>,
        refs: Arc<RefStore>,
        transport: Arc<dyn PeerTransport>,
        lock_wait: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            objects,
            refs,
            transport,
            lock_wait,
            timeout,
            page_bytes: PAGE_BYTES,
        }
    }

    pub fn with_page_bytes(mut self, page_bytes: usize) -> Self {
        self.page_bytes = page_bytes.max(1);
        self
    }

    /// Pull from one peer, page by page. Returns the number of objects and refs applied.
    pub async fn sync(&self, peer: &NodeInfo) -> Result<usize> {
        let mut applied = 0;
        let mut pages = 0;

        let refs = loop {
            let (objects, refs, more) = self.pull(peer).await?;
            pages += 1;

            let mut stored = 0;
            for object in &objects {
                match self.objects.put(object) {
                    Ok(PutOutcome::Stored) => stored += 1,
                    Ok(PutOutcome::Duplicate) => {}
                    Err(e) => tracing::warn!("Discarding object {} from {}: {}", object.id, peer.id, e),
                }
            }
            applied += stored;

            if !more {
                break refs;
            }
            if stored == 0 {
                tracing::warn!("Anti-entropy with {} stalled after {} pages", peer.id, pages);
                return Ok(applied);
            }
        };

        for record in &refs {
            if self.adopt(record).await? {
                applied += 1;
            }
        }

        if applied > 0 {
            tracing::info!("Anti-entropy with {} applied {} changes ({} pages)", peer.id, applied, pages);
        } else {
            tracing::debug!("Anti-entropy with {}: already in sync", peer.id);
        }
        Ok(applied)
    }

    async fn pull(&self, peer: &NodeInfo) -> Result<(Vec<GitObject>, Vec<RefRecord>, bool)> {
        let request = Message::AntiEntropyPull {
            node_id: self.node_id.clone(),
            have: self.objects.list()?,
        };

        let response = tokio::time::timeout(self.timeout, self.transport.request(&peer.address, request))
            .await
            .map_err(|_| Error::ConnectionTimeout(peer.address.clone()))??;

        match response {
            Message::AntiEntropyResponse { objects, refs, more, .. } => Ok((objects, refs, more)),
            Message::Error { message, .. } => Err(Error::NodeUnreachable(format!("{}: {}", peer.id, message))),
            other => Err(Error::Protocol(format!(
                "{} answered AntiEntropyPull with {}",
                peer.id,
                other.type_name()
            ))),
        }
    }

    async fn adopt(&self, record: &RefRecord) -> Result<bool> {
        if !record.target.is_zero() && !self.objects.has(&record.target) {
            tracing::debug!(
                "Skipping {}:{}, target {} not here yet",
                record.repo,
                record.name,
                record.target
            );
            return Ok(false);
        }

        let names = [record.name.clone()];
        let Some(locks) = self.refs.try_lock_many(&record.repo, &names, self.lock_wait).await? else {
            tracing::debug!("Skipping busy ref {}:{}", record.repo, record.name);
            return Ok(false);
        };
        let Some(lock) = locks.first() else {
            return Ok(false);
        };

        let expected = self
            .refs
            .current(lock)?
            .map(|r| r.target)
            .unwrap_or(ObjectId::ZERO);
        let adopted = self.refs.adopt_locked(lock, expected, record)?;
        if adopted {
            tracing::debug!(
                "Adopted {}:{} -> {} (generation {})",
                record.repo,
                record.name,
                record.target,
                record.generation
            );
        }
        Ok(adopted)
    }

    /// Answer a peer's pull with one page of the objects it lacks.
    ///
    /// A page holds at least one object. Ref records ride on the last page only.
    pub async fn serve_pull(&self, have: &[ObjectId]) -> Result<Message> {
        let have: HashSet<&ObjectId> = have.iter().collect();
        let mut objects = Vec::new();
        let mut bytes = 0;
        let mut more = false;
        for id in self.objects.list()? {
            if have.contains(&id) {
                continue;
            }
            if !objects.is_empty() && bytes >= self.page_bytes {
                more = true;
                break;
            }
            let object = self.objects.get(&id)?;
            bytes += object.payload.len();
            objects.push(object);
        }

        let refs = if more {
            Vec::new()
        } else {
            self.refs.export(self.lock_wait).await?
        };

        Ok(Message::AntiEntropyResponse {
            node_id: self.node_id.clone(),
            objects,
            refs,
            more,
        })
    }
}
