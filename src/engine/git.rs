use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{TimeZone, Utc};
use git2::{Delta, DiffFindOptions, ObjectType, Repository, TreeWalkMode, TreeWalkResult};
use tokio::fs;
use tokio::process::Command;

use super::{BlobData, GitService, PathChange, ProtocolMode, RefTip, VersionControlEngine};
use crate::error::{Error, Result};
use crate::types::{ChangeType, CommitRecord, EntryType, Oid, RefKind, Signature, TreeEntry};

const BINARY_SNIFF_LEN: usize = 8192;
const GIT_BINARY: &str = "git";

/// [`VersionControlEngine`] over on-disk bare repositories. Reads go through
/// libgit2; wire-protocol processes are the stock `git` executable.
#[derive(Debug, Clone, Default)]
pub struct GitEngine;

impl GitEngine {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn open(repo: &Path) -> Result<Repository> {
    Repository::open_bare(repo).map_err(|e| {
        if e.code() == git2::ErrorCode::NotFound {
            Error::NotFound
        } else {
            Error::Engine(e)
        }
    })
}

fn git_oid(oid: &Oid) -> Result<git2::Oid> {
    Ok(git2::Oid::from_str(oid.as_str())?)
}

fn signature(sig: &git2::Signature<'_>) -> Signature {
    let secs = sig.when().seconds();
    Signature {
        name: String::from_utf8_lossy(sig.name_bytes()).into_owned(),
        email: String::from_utf8_lossy(sig.email_bytes()).into_owned(),
        time: Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now),
    }
}

impl VersionControlEngine for GitEngine {
    fn list_refs(&self, repo: &Path) -> Result<Vec<RefTip>> {
        let repository = open(repo)?;
        let mut tips = Vec::new();

        for reference in repository.references()? {
            let reference = reference?;
            let Some(name) = reference.name() else {
                continue;
            };
            let Some(kind) = RefKind::from_ref_name(name) else {
                continue;
            };

            // Tags pointing at trees or blobs have no history to index.
            match reference.peel_to_commit() {
                Ok(commit) => tips.push(RefTip {
                    name: name.to_string(),
                    kind,
                    oid: commit.id().into(),
                }),
                Err(e) => tracing::debug!(ref_name = name, "Skipping non-commit ref: {e}"),
            }
        }

        tips.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tips)
    }

    fn read_commit(&self, repo: &Path, oid: &Oid) -> Result<CommitRecord> {
        let repository = open(repo)?;
        let commit = repository.find_commit(git_oid(oid)?)?;

        Ok(CommitRecord {
            oid: commit.id().into(),
            tree_oid: commit.tree_id().into(),
            message: String::from_utf8_lossy(commit.message_bytes()).into_owned(),
            author: signature(&commit.author()),
            committer: signature(&commit.committer()),
            parent_oids: commit.parent_ids().map(Oid::from).collect(),
        })
    }

    fn commit_parents(&self, repo: &Path, oid: &Oid) -> Result<Vec<Oid>> {
        let repository = open(repo)?;
        let commit = repository.find_commit(git_oid(oid)?)?;
        Ok(commit.parent_ids().map(Oid::from).collect())
    }

    fn walk_tree(&self, repo: &Path, tree: &Oid) -> Result<Vec<TreeEntry>> {
        let repository = open(repo)?;
        let root = repository.find_tree(git_oid(tree)?)?;
        let mut entries = Vec::new();

        root.walk(TreeWalkMode::PreOrder, |dir, entry| {
            let entry_type = match entry.kind() {
                Some(ObjectType::Blob) => EntryType::Blob,
                Some(ObjectType::Tree) => EntryType::Tree,
                // Submodule links point outside this repository.
                _ => return TreeWalkResult::Skip,
            };
            let Some(name) = entry.name() else {
                return TreeWalkResult::Skip;
            };

            let parent_path = dir.trim_end_matches('/').to_string();
            let path = if parent_path.is_empty() {
                name.to_string()
            } else {
                format!("{parent_path}/{name}")
            };

            entries.push(TreeEntry {
                root_tree_oid: tree.clone(),
                path,
                parent_path,
                name: name.to_string(),
                entry_type,
                entry_oid: entry.id().into(),
                mode: entry.filemode(),
            });
            TreeWalkResult::Ok
        })?;

        Ok(entries)
    }

    fn read_blob(&self, repo: &Path, oid: &Oid, max_size: u64) -> Result<BlobData> {
        let repository = open(repo)?;
        let id = git_oid(oid)?;

        // The object header is enough to decide on oversized blobs.
        let (size, kind) = repository.odb()?.read_header(id)?;
        if kind != ObjectType::Blob {
            return Err(Error::Git(format!("{oid} is not a blob")));
        }
        let size = size as u64;
        if size > max_size {
            return Ok(BlobData { size, data: None });
        }

        let blob = repository.find_blob(id)?;
        Ok(BlobData {
            size,
            data: Some(blob.content().to_vec()),
        })
    }

    fn changed_paths(&self, repo: &Path, oid: &Oid) -> Result<Vec<PathChange>> {
        let repository = open(repo)?;
        let commit = repository.find_commit(git_oid(oid)?)?;
        let tree = commit.tree()?;
        let parent_tree = if commit.parent_count() > 0 {
            Some(commit.parent(0)?.tree()?)
        } else {
            None
        };

        let mut diff = repository.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)?;
        let mut find = DiffFindOptions::new();
        find.renames(true);
        diff.find_similar(Some(&mut find))?;

        let mut changes = Vec::new();
        for delta in diff.deltas() {
            let (change_type, file) = match delta.status() {
                Delta::Added | Delta::Copied => (ChangeType::Add, delta.new_file()),
                Delta::Deleted => (ChangeType::Delete, delta.old_file()),
                Delta::Modified | Delta::Typechange => (ChangeType::Modify, delta.new_file()),
                Delta::Renamed => (ChangeType::Rename, delta.new_file()),
                _ => continue,
            };
            let Some(path) = file.path() else {
                continue;
            };
            changes.push(PathChange {
                path: path.to_string_lossy().replace('\\', "/"),
                change_type,
            });
        }

        Ok(changes)
    }

    fn protocol_command(&self, repo: &Path, service: GitService, mode: ProtocolMode) -> Command {
        let mut cmd = Command::new(GIT_BINARY);
        cmd.arg(service.subcommand());

        match mode {
            ProtocolMode::Interactive => {}
            ProtocolMode::Advertise => {
                cmd.args(["--stateless-rpc", "--advertise-refs"]);
            }
            ProtocolMode::StatelessRpc => {
                cmd.arg("--stateless-rpc");
            }
        }

        cmd.arg(repo)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// NUL within the first 8 KiB marks content as binary.
#[must_use]
pub fn is_binary(content: &[u8]) -> bool {
    let sample_size = content.len().min(BINARY_SNIFF_LEN);
    content[..sample_size].contains(&0)
}

/// Creates an empty bare repository whose `HEAD` points at `default_branch`.
pub async fn init_bare_repo(repo_path: &Path, default_branch: &str) -> Result<()> {
    if let Some(parent) = repo_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let output = Command::new(GIT_BINARY)
        .args(["init", "--bare", "--quiet"])
        .arg(repo_path)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Git(format!("failed to init bare repo: {stderr}")));
    }

    fs::write(
        repo_path.join("HEAD"),
        format!("ref: refs/heads/{default_branch}\n"),
    )
    .await?;

    Ok(())
}

#[must_use]
pub fn repo_path(repos_dir: &Path, owner: &str, repo_name: &str) -> PathBuf {
    repos_dir.join(owner).join(format!("{repo_name}.git"))
}
