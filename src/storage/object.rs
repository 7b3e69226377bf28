//! Git object model
//!
//! Objects are identified exactly the way git identifies them: the SHA-1 of
//! `"<type> <len>\0"` followed by the payload.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// Length of a git object id in bytes
pub const OBJECT_ID_LEN: usize = 20;

/// Tree entry mode for submodule commits, which never live in this repository
const GITLINK_MODE: &str = "160000";

/// Content hash of a git object
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    /// The null id, used for "ref does not exist"
    pub const ZERO: ObjectId = ObjectId([0u8; OBJECT_ID_LEN]);

    pub fn from_bytes(bytes: [u8; OBJECT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a raw 20-byte id
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; OBJECT_ID_LEN] = bytes
            .try_into()
            .map_err(|_| Error::InvalidObject(format!("object id must be {} bytes", OBJECT_ID_LEN)))?;
        Ok(Self(raw))
    }

    /// Parse a 40-character hex id
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| Error::InvalidObject(format!("bad object id {:?}: {}", hex_str, e)))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Abbreviated form used in push status lines
    pub fn short(&self) -> String {
        self.to_hex()[..7].to_string()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

/// Git object type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl ObjectKind {
    /// Name used in the object header
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Commit => "commit",
            ObjectKind::Tree => "tree",
            ObjectKind::Blob => "blob",
            ObjectKind::Tag => "tag",
        }
    }

    /// Git's numeric type code, used in the on-disk format
    pub fn code(&self) -> u8 {
        match self {
            ObjectKind::Commit => 1,
            ObjectKind::Tree => 2,
            ObjectKind::Blob => 3,
            ObjectKind::Tag => 4,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(ObjectKind::Commit),
            2 => Ok(ObjectKind::Tree),
            3 => Ok(ObjectKind::Blob),
            4 => Ok(ObjectKind::Tag),
            other => Err(Error::InvalidObject(format!("unknown object type code {}", other))),
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable git object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitObject {
    /// Claimed id (verified by the object store on write)
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub payload: Vec<u8>,
}

/// One entry of a tree object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: String,
    pub name: String,
    pub id: ObjectId,
}

impl TreeEntry {
    pub fn is_tree(&self) -> bool {
        self.mode == "40000"
    }
}

impl GitObject {
    /// Build an object, computing its id from the payload
    pub fn new(kind: ObjectKind, payload: Vec<u8>) -> Self {
        let id = Self::compute_id(kind, &payload);
        Self { id, kind, payload }
    }

    /// Hash a payload the way git does
    pub fn compute_id(kind: ObjectKind, payload: &[u8]) -> ObjectId {
        let mut hasher = Sha1::new();
        hasher.update(format!("{} {}\0", kind.as_str(), payload.len()).as_bytes());
        hasher.update(payload);
        ObjectId(hasher.finalize().into())
    }

    /// Check that the claimed id matches the payload
    pub fn verify(&self) -> Result<()> {
        let actual = Self::compute_id(self.kind, &self.payload);
        if actual != self.id {
            return Err(Error::ObjectCorrupt {
                claimed: self.id,
                actual,
            });
        }
        Ok(())
    }

    /// Parse the entries of a tree object
    pub fn tree_entries(&self) -> Result<Vec<TreeEntry>> {
        if self.kind != ObjectKind::Tree {
            return Err(Error::InvalidObject(format!("{} is a {}, not a tree", self.id, self.kind)));
        }

        let mut entries = Vec::new();
        let mut rest = self.payload.as_slice();
        while !rest.is_empty() {
            let space = rest
                .iter()
                .position(|b| *b == b' ')
                .ok_or_else(|| Error::InvalidObject(format!("tree {}: missing mode", self.id)))?;
            let nul = rest
                .iter()
                .position(|b| *b == 0)
                .ok_or_else(|| Error::InvalidObject(format!("tree {}: missing name", self.id)))?;
            if nul < space || rest.len() < nul + 1 + OBJECT_ID_LEN {
                return Err(Error::InvalidObject(format!("tree {}: truncated entry", self.id)));
            }

            let mode = String::from_utf8_lossy(&rest[..space]).into_owned();
            let name = String::from_utf8_lossy(&rest[space + 1..nul]).into_owned();
            let id = ObjectId::from_slice(&rest[nul + 1..nul + 1 + OBJECT_ID_LEN])?;
            entries.push(TreeEntry { mode, name, id });

            rest = &rest[nul + 1 + OBJECT_ID_LEN..];
        }

        Ok(entries)
    }

    /// Ids of the objects this object links to
    pub fn references(&self) -> Result<Vec<ObjectId>> {
        match self.kind {
            ObjectKind::Blob => Ok(Vec::new()),
            ObjectKind::Tree => Ok(self
                .tree_entries()?
                .into_iter()
                .filter(|e| e.mode != GITLINK_MODE)
                .map(|e| e.id)
                .collect()),
            ObjectKind::Commit => self.header_links(&["tree", "parent"]),
            ObjectKind::Tag => self.header_links(&["object"]),
        }
    }

    /// Collect hex ids from `<key> <hex>` header lines (before the first blank line)
    fn header_links(&self, keys: &[&str]) -> Result<Vec<ObjectId>> {
        let mut links = Vec::new();
        for line in self.payload.split(|b| *b == b'\n') {
            if line.is_empty() {
                break;
            }
            let Some(space) = line.iter().position(|b| *b == b' ') else {
                continue;
            };
            let key = &line[..space];
            if keys.iter().any(|k| k.as_bytes() == key) {
                let value = std::str::from_utf8(&line[space + 1..])
                    .map_err(|_| Error::InvalidObject(format!("{}: non-utf8 header", self.id)))?;
                links.push(ObjectId::from_hex(value.trim())?);
            }
        }
        Ok(links)
    }
}
