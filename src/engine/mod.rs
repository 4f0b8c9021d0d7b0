//! Read access to bare repositories and construction of the git wire
//! protocol processes.
//!
//! The indexer only talks to repositories through [`VersionControlEngine`],
//! so tests and alternative backends can stand in for git2.

mod git;
mod protocol;

use std::path::Path;

use tokio::process::Command;

pub use git::{GitEngine, init_bare_repo, is_binary, repo_path};
pub use protocol::{GitService, ProtocolMode, format_pkt_line_header};

use crate::error::Result;
use crate::types::{ChangeType, CommitRecord, Oid, RefKind, TreeEntry};

/// A branch or tag tip, peeled to the commit it names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefTip {
    pub name: String,
    pub kind: RefKind,
    pub oid: Oid,
}

/// Raw blob bytes, or only the size when the blob exceeds the read limit.
#[derive(Debug, Clone)]
pub struct BlobData {
    pub size: u64,
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathChange {
    pub path: String,
    pub change_type: ChangeType,
}

pub trait VersionControlEngine: Send + Sync {
    /// Branches and tags with their peeled commit ids.
    fn list_refs(&self, repo: &Path) -> Result<Vec<RefTip>>;

    fn read_commit(&self, repo: &Path, oid: &Oid) -> Result<CommitRecord>;

    /// Parent ids in commit order.
    fn commit_parents(&self, repo: &Path, oid: &Oid) -> Result<Vec<Oid>>;

    /// Every entry reachable from `tree`, flattened, with full paths.
    fn walk_tree(&self, repo: &Path, tree: &Oid) -> Result<Vec<TreeEntry>>;

    fn read_blob(&self, repo: &Path, oid: &Oid, max_size: u64) -> Result<BlobData>;

    /// Paths touched by a commit relative to its first parent. A root commit
    /// reports every file as added.
    fn changed_paths(&self, repo: &Path, oid: &Oid) -> Result<Vec<PathChange>>;

    /// An unspawned wire-protocol process with all three stdio handles piped.
    fn protocol_command(&self, repo: &Path, service: GitService, mode: ProtocolMode) -> Command;
}
