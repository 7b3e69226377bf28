//! Repository metadata
//!
//! A repository exists once its reserved metadata ref points at a JSON blob
//! describing it. The metadata is replicated through the same quorum path as
//! any other ref.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::{GitObject, ObjectKind};

/// Ref holding the repository's metadata blob
pub const METADATA_REF: &str = "meta/repository";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Visibility::Public => write!(f, "public"),
            Visibility::Private => write!(f, "private"),
        }
    }
}

/// Who is reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Anonymous,
    Authenticated(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryMeta {
    pub name: String,
    pub visibility: Visibility,
    pub owner: String,
    pub created_at: DateTime<Utc>,
}

impl RepositoryMeta {
    pub fn new(name: impl Into<String>, visibility: Visibility, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visibility,
            owner: owner.into(),
            created_at: Utc::now(),
        }
    }

    /// Serialize into the blob the metadata ref points at
    pub fn to_object(&self) -> Result<GitObject> {
        Ok(GitObject::new(ObjectKind::Blob, serde_json::to_vec_pretty(self)?))
    }

    pub fn from_object(object: &GitObject) -> Result<Self> {
        if object.kind != ObjectKind::Blob {
            return Err(Error::InvalidObject(format!(
                "repository metadata {} is a {}",
                object.id, object.kind
            )));
        }
        Ok(serde_json::from_slice(&object.payload)?)
    }

    /// Private repositories are readable by any authenticated user
    pub fn can_read(&self, access: &Access) -> bool {
        match (self.visibility, access) {
            (Visibility::Public, _) => true,
            (Visibility::Private, Access::Authenticated(_)) => true,
            (Visibility::Private, Access::Anonymous) => false,
        }
    }
}

/// Check a repository name before it is used as a key
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 100
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(Error::InvalidRequest(format!("invalid repository name '{}'", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_blob_roundtrip() {
        let meta = RepositoryMeta::new("test1", Visibility::Private, "admin");
        let object = meta.to_object().unwrap();
        object.verify().unwrap();
        assert_eq!(RepositoryMeta::from_object(&object).unwrap(), meta);
        assert!(String::from_utf8_lossy(&object.payload).contains("\"private\""));
    }

    #[test]
    fn test_read_rules() {
        let mut meta = RepositoryMeta::new("test1", Visibility::Private, "admin");
        assert!(!meta.can_read(&Access::Anonymous));
        assert!(meta.can_read(&Access::Authenticated("admin".into())));

        meta.visibility = Visibility::Public;
        assert!(meta.can_read(&Access::Anonymous));
    }

    #[test]
    fn test_names() {
        assert!(validate_name("test1").is_ok());
        assert!(validate_name("my-repo.git").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name("a b").is_err());
    }
}
