//! Object storage with content-addressed deduplication
//!
//! Each object lives in its own loose file under `objects/xx/yyyy...`.
//! File format: `[kind: u8][compressed: u8][payload][crc32: u32 LE]`.

use std::collections::{HashSet, VecDeque};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;

use tracing::debug;

use super::object::{GitObject, ObjectId, ObjectKind};
use crate::error::{Error, Result};

/// Header bytes before the payload
const HEADER_LEN: usize = 2;
/// Trailing checksum bytes
const CHECKSUM_LEN: usize = 4;

/// Outcome of a put
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Object was written
    Stored,
    /// Object was already present
    Duplicate,
}

/// Content-addressed object storage
pub struct ObjectStore {
    /// Base directory for objects
    base_dir: PathBuf,

    /// Compress payloads on disk with LZ4
    compression: bool,
}

impl ObjectStore {
    /// Create a new object store
    pub fn new(base_dir: PathBuf, compression: bool) -> Result<Self> {
        fs::create_dir_all(&base_dir)?;

        Ok(Self {
            base_dir,
            compression,
        })
    }

    /// Get the path for an object by its id
    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        // First 2 characters as subdirectory, same fan-out as git
        self.base_dir.join(&hex[0..2]).join(&hex[2..])
    }

    /// Store an object after checking its id against the payload
    pub fn put(&self, object: &GitObject) -> Result<PutOutcome> {
        object.verify()?;

        let path = self.object_path(&object.id);
        if path.exists() {
            debug!("Object {} already exists (deduplicated)", object.id);
            return Ok(PutOutcome::Duplicate);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let data = if self.compression {
            lz4_flex::compress_prepend_size(&object.payload)
        } else {
            object.payload.clone()
        };

        let mut encoded = Vec::with_capacity(HEADER_LEN + data.len() + CHECKSUM_LEN);
        encoded.push(object.kind.code());
        encoded.push(self.compression as u8);
        encoded.extend_from_slice(&data);
        let checksum = crc32fast::hash(&encoded);
        encoded.extend_from_slice(&checksum.to_le_bytes());

        // Write to a unique temp file and rename so readers never see a partial object
        let tmp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        debug!(
            "Stored {} {} ({} bytes)",
            object.kind,
            object.id,
            object.payload.len()
        );
        Ok(PutOutcome::Stored)
    }

    /// Retrieve an object by its id
    pub fn get(&self, id: &ObjectId) -> Result<GitObject> {
        let path = self.object_path(id);
        if !path.exists() {
            return Err(Error::ObjectNotFound(*id));
        }

        let mut file = File::open(&path)?;
        let mut encoded = Vec::new();
        file.read_to_end(&mut encoded)?;

        if encoded.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(Error::InvalidObject(format!("{}: truncated object file", id)));
        }

        let (body, checksum_bytes) = encoded.split_at(encoded.len() - CHECKSUM_LEN);
        let stored_checksum = u32::from_le_bytes(
            checksum_bytes
                .try_into()
                .map_err(|_| Error::InvalidObject(format!("{}: bad checksum field", id)))?,
        );
        if crc32fast::hash(body) != stored_checksum {
            return Err(Error::InvalidObject(format!("{}: checksum mismatch", id)));
        }

        let kind = ObjectKind::from_code(body[0])?;
        let payload = if body[1] != 0 {
            lz4_flex::decompress_size_prepended(&body[HEADER_LEN..])
                .map_err(|e| Error::InvalidObject(format!("{}: decompression failed: {}", id, e)))?
        } else {
            body[HEADER_LEN..].to_vec()
        };

        let object = GitObject {
            id: *id,
            kind,
            payload,
        };
        object.verify()?;
        Ok(object)
    }

    /// Check if an object exists
    pub fn has(&self, id: &ObjectId) -> bool {
        self.object_path(id).exists()
    }

    /// List the ids of every stored object
    pub fn list(&self) -> Result<Vec<ObjectId>> {
        let mut ids = Vec::new();

        for dir in fs::read_dir(&self.base_dir)? {
            let dir = dir?;
            if !dir.file_type()?.is_dir() {
                continue;
            }
            let prefix = dir.file_name().to_string_lossy().into_owned();

            for file in fs::read_dir(dir.path())? {
                let name = file?.file_name().to_string_lossy().into_owned();
                // Skips in-progress temp files
                if let Ok(id) = ObjectId::from_hex(&format!("{}{}", prefix, name)) {
                    ids.push(id);
                }
            }
        }

        Ok(ids)
    }

    /// Collect every object reachable from the given roots
    pub fn closure(&self, roots: &[ObjectId]) -> Result<Vec<GitObject>> {
        let mut seen: HashSet<ObjectId> = HashSet::new();
        let mut queue: VecDeque<ObjectId> = roots.iter().copied().filter(|id| !id.is_zero()).collect();
        let mut objects = Vec::new();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let object = self.get(&id)?;
            for link in object.references()? {
                if !seen.contains(&link) {
                    queue.push_back(link);
                }
            }
            objects.push(object);
        }

        Ok(objects)
    }
}
