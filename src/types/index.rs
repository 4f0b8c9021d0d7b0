//! Row types for the derived repository index.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const SHA1_HEX_LEN: usize = 40;
const SHA256_HEX_LEN: usize = 64;

/// A validated, lowercase hex object id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Oid(String);

impl Oid {
    /// Parses a hex object id, accepting SHA-1 and SHA-256 lengths.
    pub fn parse(s: &str) -> Result<Self> {
        let valid_len = s.len() == SHA1_HEX_LEN || s.len() == SHA256_HEX_LEN;
        if !valid_len || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidOid(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    /// The all-zero id used by the engine to report a deleted ref.
    #[must_use]
    pub fn zero() -> Self {
        Self("0".repeat(SHA1_HEX_LEN))
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.bytes().all(|b| b == b'0')
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Oid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Oid {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Oid> for String {
    fn from(oid: Oid) -> Self {
        oid.0
    }
}

impl From<git2::Oid> for Oid {
    fn from(oid: git2::Oid) -> Self {
        Self(oid.to_string())
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    Branch,
    Tag,
}

impl RefKind {
    /// Classifies a fully qualified ref name. Refs outside `refs/heads/` and
    /// `refs/tags/` are not indexed.
    #[must_use]
    pub fn from_ref_name(name: &str) -> Option<Self> {
        if name.starts_with("refs/heads/") {
            Some(Self::Branch)
        } else if name.starts_with("refs/tags/") {
            Some(Self::Tag)
        } else {
            None
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Branch => "branch",
            Self::Tag => "tag",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "branch" => Ok(Self::Branch),
            "tag" => Ok(Self::Tag),
            other => Err(Error::BadRequest(format!("unknown ref kind: {other}"))),
        }
    }
}

/// One ref mutation to apply to the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefChange {
    pub ref_name: String,
    pub kind: RefKind,
    /// Informational only; `None` when unknown (creation or full reindex).
    pub old_oid: Option<Oid>,
    /// The all-zero id marks a deletion.
    pub new_oid: Oid,
}

impl RefChange {
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.new_oid.is_zero()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedRef {
    pub repo_id: String,
    pub name: String,
    pub kind: RefKind,
    pub oid: Oid,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRecord {
    pub oid: Oid,
    pub tree_oid: Oid,
    pub message: String,
    pub author: Signature,
    pub committer: Signature,
    /// Parents in commit order; the first entry is the first parent.
    pub parent_oids: Vec<Oid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Blob,
    Tree,
}

impl EntryType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Tree => "tree",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "blob" => Ok(Self::Blob),
            "tree" => Ok(Self::Tree),
            other => Err(Error::BadRequest(format!("unknown entry type: {other}"))),
        }
    }
}

/// One file or directory under a specific root tree snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub root_tree_oid: Oid,
    /// Full slash-separated path from the root tree.
    pub path: String,
    /// Directory containing this entry; empty for top-level entries.
    pub parent_path: String,
    pub name: String,
    pub entry_type: EntryType,
    pub entry_oid: Oid,
    pub mode: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobRecord {
    pub oid: Oid,
    /// `None` for binary content or content over the size limit.
    pub content: Option<String>,
    pub size: i64,
    pub is_binary: bool,
    pub is_truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Add,
    Modify,
    Delete,
    Rename,
}

impl ChangeType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Modify => "modify",
            Self::Delete => "delete",
            Self::Rename => "rename",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "add" => Ok(Self::Add),
            "modify" => Ok(Self::Modify),
            "delete" => Ok(Self::Delete),
            "rename" => Ok(Self::Rename),
            other => Err(Error::BadRequest(format!("unknown change type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitFile {
    pub commit_oid: Oid,
    pub path: String,
    pub change_type: ChangeType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AncestryEntry {
    pub commit_oid: Oid,
    pub depth: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub blob_oid: Oid,
    pub path: String,
    pub snippet: String,
}
