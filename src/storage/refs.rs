//! Ref Store
//!
//! Persistent per-repository refs backed by SQLite. Every mutation is a
//! compare-and-swap performed while holding that ref's lock; the lock can be
//! held across a whole replication transaction so readers never observe an
//! unconfirmed value.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::object::ObjectId;
use crate::error::{Error, Result};

/// Stored state of one ref
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefRecord {
    pub repo: String,
    pub name: String,
    /// Zero means the ref was deleted (tombstone)
    pub target: ObjectId,
    /// Incremented on every successful swap
    pub generation: u64,
}

/// Result of a compare-and-swap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CasResult {
    /// The swap was applied
    Swapped { previous: ObjectId, generation: u64 },
    /// The stored value did not match the expected one
    Conflict { current: ObjectId },
}

impl CasResult {
    pub fn is_swapped(&self) -> bool {
        matches!(self, CasResult::Swapped { .. })
    }
}

/// Held lock on a single ref
pub struct RefLock {
    repo: String,
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl RefLock {
    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

type RefKey = (String, String);

/// Smallest lock table size that triggers a sweep of idle entries
const LOCK_SWEEP_MIN: usize = 1024;

/// Per-ref mutexes, created on first use
struct LockTable {
    locks: HashMap<RefKey, Arc<AsyncMutex<()>>>,
    sweep_at: usize,
}

impl LockTable {
    fn new() -> Self {
        Self {
            locks: HashMap::new(),
            sweep_at: LOCK_SWEEP_MIN,
        }
    }

    fn handle(&mut self, repo: &str, name: &str) -> Arc<AsyncMutex<()>> {
        if self.locks.len() >= self.sweep_at {
            // Held guards and waiters own a clone; an entry only the table references is idle
            self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            self.sweep_at = (self.locks.len() * 2).max(LOCK_SWEEP_MIN);
        }

        Arc::clone(
            self.locks
                .entry((repo.to_string(), name.to_string()))
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }
}

/// SQLite-backed ref store with per-ref locking
pub struct RefStore {
    conn: Mutex<Connection>,
    locks: Mutex<LockTable>,
}

impl RefStore {
    /// Create or open the ref database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    /// Open a throwaway in-memory store
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS refs (
                repo TEXT NOT NULL,
                name TEXT NOT NULL,
                target TEXT NOT NULL,
                generation INTEGER NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (repo, name)
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            locks: Mutex::new(LockTable::new()),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("ref database mutex poisoned".into()))
    }

    fn lock_handle(&self, repo: &str, name: &str) -> Result<Arc<AsyncMutex<()>>> {
        let mut table = self
            .locks
            .lock()
            .map_err(|_| Error::Internal("ref lock table poisoned".into()))?;
        Ok(table.handle(repo, name))
    }

    #[cfg(test)]
    fn lock_table_len(&self) -> usize {
        self.locks.lock().map(|t| t.locks.len()).unwrap_or(0)
    }

    /// Wait for the lock on one ref
    pub async fn lock(&self, repo: &str, name: &str) -> Result<RefLock> {
        let guard = self.lock_handle(repo, name)?.lock_owned().await;
        Ok(RefLock {
            repo: repo.to_string(),
            name: name.to_string(),
            _guard: guard,
        })
    }

    /// Lock several refs of one repository, in sorted order
    pub async fn lock_many(&self, repo: &str, names: &[String]) -> Result<Vec<RefLock>> {
        let mut sorted: Vec<&String> = names.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut held = Vec::with_capacity(sorted.len());
        for name in sorted {
            held.push(self.lock(repo, name).await?);
        }
        Ok(held)
    }

    /// Like `lock_many`, but gives up after `wait`. Returns `None` when busy.
    pub async fn try_lock_many(
        &self,
        repo: &str,
        names: &[String],
        wait: Duration,
    ) -> Result<Option<Vec<RefLock>>> {
        match tokio::time::timeout(wait, self.lock_many(repo, names)).await {
            Ok(held) => held.map(Some),
            Err(_) => Ok(None),
        }
    }

    fn load(&self, repo: &str, name: &str) -> Result<Option<RefRecord>> {
        let conn = self.conn()?;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT target, generation FROM refs WHERE repo = ?1 AND name = ?2",
                params![repo, name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(target, generation)| -> Result<RefRecord> {
            Ok(RefRecord {
                repo: repo.to_string(),
                name: name.to_string(),
                target: ObjectId::from_hex(&target)?,
                generation: generation as u64,
            })
        })
        .transpose()
    }

    fn store(&self, repo: &str, name: &str, target: ObjectId, generation: u64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO refs (repo, name, target, generation) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(repo, name) DO UPDATE SET
                target = ?3, generation = ?4, updated_at = CURRENT_TIMESTAMP
            "#,
            params![repo, name, target.to_hex(), generation as i64],
        )?;
        Ok(())
    }

    fn remove(&self, repo: &str, name: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM refs WHERE repo = ?1 AND name = ?2",
            params![repo, name],
        )?;
        Ok(())
    }

    /// Stored record (tombstones included) for a locked ref
    pub fn current(&self, lock: &RefLock) -> Result<Option<RefRecord>> {
        self.load(&lock.repo, &lock.name)
    }

    /// Compare-and-swap on a ref whose lock the caller holds
    pub fn swap_locked(&self, lock: &RefLock, expected: ObjectId, new: ObjectId) -> Result<CasResult> {
        let record = self.load(&lock.repo, &lock.name)?;
        let current = record.as_ref().map(|r| r.target).unwrap_or(ObjectId::ZERO);
        if current != expected {
            return Ok(CasResult::Conflict { current });
        }

        let generation = record.map(|r| r.generation).unwrap_or(0) + 1;
        self.store(&lock.repo, &lock.name, new, generation)?;
        tracing::debug!(
            "{}:{} {} -> {} (generation {})",
            lock.repo,
            lock.name,
            current,
            new,
            generation
        );

        Ok(CasResult::Swapped {
            previous: current,
            generation,
        })
    }

    /// Put back the exact record a locked ref held before a swap, generation included.
    ///
    /// `prior == None` means the ref did not exist. Nothing happens unless the
    /// ref still holds `expected`.
    pub fn restore_locked(
        &self,
        lock: &RefLock,
        expected: ObjectId,
        prior: Option<&RefRecord>,
    ) -> Result<CasResult> {
        let current = self
            .load(&lock.repo, &lock.name)?
            .map(|r| r.target)
            .unwrap_or(ObjectId::ZERO);
        if current != expected {
            return Ok(CasResult::Conflict { current });
        }

        let generation = match prior {
            Some(record) => {
                self.store(&lock.repo, &lock.name, record.target, record.generation)?;
                record.generation
            }
            None => {
                self.remove(&lock.repo, &lock.name)?;
                0
            }
        };
        tracing::debug!(
            "{}:{} restored to {} (generation {})",
            lock.repo,
            lock.name,
            prior.map(|r| r.target).unwrap_or(ObjectId::ZERO),
            generation
        );

        Ok(CasResult::Swapped {
            previous: current,
            generation,
        })
    }

    /// Compare-and-swap, taking the ref lock for the duration of the call
    pub async fn compare_and_swap(
        &self,
        repo: &str,
        name: &str,
        expected: ObjectId,
        new: ObjectId,
    ) -> Result<CasResult> {
        let lock = self.lock(repo, name).await?;
        self.swap_locked(&lock, expected, new)
    }

    /// Take a peer's record if it is newer and the local value is still `expected`.
    ///
    /// The peer's generation is adopted so later comparisons line up.
    pub fn adopt_locked(&self, lock: &RefLock, expected: ObjectId, record: &RefRecord) -> Result<bool> {
        let local = self.load(&lock.repo, &lock.name)?;
        let (current, generation) = local
            .map(|r| (r.target, r.generation))
            .unwrap_or((ObjectId::ZERO, 0));

        if current != expected || record.generation <= generation {
            return Ok(false);
        }

        self.store(&lock.repo, &lock.name, record.target, record.generation)?;
        Ok(true)
    }

    /// Read one live ref (waits for any in-flight transaction on it)
    pub async fn get(&self, repo: &str, name: &str) -> Result<Option<RefRecord>> {
        let lock = self.lock(repo, name).await?;
        Ok(self.current(&lock)?.filter(|r| !r.target.is_zero()))
    }

    /// Lock-consistent listing of the live refs of a repository
    pub async fn snapshot(&self, repo: &str) -> Result<Vec<RefRecord>> {
        let names: Vec<String> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare("SELECT name FROM refs WHERE repo = ?1 ORDER BY name")?;
            let rows = stmt.query_map(params![repo], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let mut records = Vec::with_capacity(names.len());
        for name in names {
            if let Some(record) = self.get(repo, &name).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Every record including tombstones. Refs locked for longer than `wait` are skipped.
    pub async fn export(&self, wait: Duration) -> Result<Vec<RefRecord>> {
        let keys: Vec<(String, String)> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare("SELECT repo, name FROM refs ORDER BY repo, name")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let mut records = Vec::with_capacity(keys.len());
        for (repo, name) in keys {
            let handle = self.lock_handle(&repo, &name)?;
            let Ok(_guard) = tokio::time::timeout(wait, handle.lock_owned()).await else {
                tracing::debug!("Skipping busy ref {}:{} in export", repo, name);
                continue;
            };
            if let Some(record) = self.load(&repo, &name)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Names of all repositories that have at least one ref
    pub fn repositories(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT DISTINCT repo FROM refs ORDER BY repo")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }
}
