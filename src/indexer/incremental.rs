use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use crate::config::IndexerConfig;
use crate::engine::{VersionControlEngine, is_binary};
use crate::error::Result;
use crate::store::IndexStore;
use crate::types::{BlobRecord, ChangeType, CommitFile, EntryType, Oid, RefChange, TreeEntry};

/// What one [`IncrementalIndexer::apply`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub commits_indexed: usize,
    pub ref_deleted: bool,
}

/// Work already done during the current run.
#[derive(Default)]
struct RunState {
    trees: HashSet<Oid>,
    /// Blob and path pairs whose row and search document are in place.
    documents: HashSet<(Oid, String)>,
}

/// Applies ref changes to the index.
///
/// Every write is idempotent, so replaying a change or racing another run
/// over the same commits converges on the same rows. A commit row is written
/// only after its tree, blobs and changed files, and any failure aborts the
/// run, so a stored commit always has complete content. The frontier walk
/// relies on that when it stops at known commits.
#[derive(Clone)]
pub struct IncrementalIndexer {
    engine: Arc<dyn VersionControlEngine>,
    store: Arc<dyn IndexStore>,
    config: IndexerConfig,
}

impl IncrementalIndexer {
    pub fn new(
        engine: Arc<dyn VersionControlEngine>,
        store: Arc<dyn IndexStore>,
        config: IndexerConfig,
    ) -> Self {
        Self {
            engine,
            store,
            config,
        }
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size.clamp(1, crate::config::DEFAULT_BATCH_SIZE)
    }

    pub fn apply(&self, repo_id: &str, repo: &Path, change: &RefChange) -> Result<ApplyOutcome> {
        if change.is_delete() {
            let removed = self.store.delete_ref(repo_id, &change.ref_name)?;
            tracing::info!(repo_id, ref_name = %change.ref_name, removed, "Ref deleted from index");
            return Ok(ApplyOutcome {
                commits_indexed: 0,
                ref_deleted: removed,
            });
        }

        let pending = self.frontier(repo_id, repo, &change.new_oid)?;
        let mut run = RunState::default();
        for oid in &pending {
            self.index_commit(repo_id, repo, oid, &mut run)?;
        }

        let chain = self.first_parent_chain(repo, &change.new_oid)?;
        self.store
            .replace_ancestry(repo_id, &change.ref_name, &chain, self.batch_size())?;
        self.store
            .upsert_ref(repo_id, &change.ref_name, change.kind, &change.new_oid)?;

        tracing::info!(
            repo_id,
            ref_name = %change.ref_name,
            old = ?change.old_oid.as_ref().map(Oid::as_str),
            new = %change.new_oid,
            commits = pending.len(),
            depth = chain.len(),
            "Ref indexed"
        );

        Ok(ApplyOutcome {
            commits_indexed: pending.len(),
            ref_deleted: false,
        })
    }

    /// Drops every index row of the repository and indexes all current refs
    /// from scratch.
    pub fn full_reindex(&self, repo_id: &str, repo: &Path) -> Result<usize> {
        self.store.clear_index(repo_id)?;

        let tips = self.engine.list_refs(repo)?;
        let mut commits = 0;
        for tip in &tips {
            let change = RefChange {
                ref_name: tip.name.clone(),
                kind: tip.kind,
                old_oid: None,
                new_oid: tip.oid.clone(),
            };
            commits += self.apply(repo_id, repo, &change)?.commits_indexed;
        }

        tracing::info!(repo_id, refs = tips.len(), commits, "Full reindex complete");
        Ok(commits)
    }

    /// Commits reachable from `tip` that are not yet indexed, oldest first.
    fn frontier(&self, repo_id: &str, repo: &Path, tip: &Oid) -> Result<Vec<Oid>> {
        let mut queue = VecDeque::from([tip.clone()]);
        let mut visited = HashSet::new();
        let mut found = Vec::new();

        while let Some(oid) = queue.pop_front() {
            if !visited.insert(oid.clone()) {
                continue;
            }
            if self.store.has_commit(repo_id, &oid)? {
                continue;
            }

            match self.engine.commit_parents(repo, &oid) {
                Ok(parents) => queue.extend(parents),
                Err(e) => {
                    tracing::warn!(repo_id, commit = %oid, "Parent lookup failed, not following: {e}");
                }
            }
            found.push(oid);
        }

        found.reverse();
        Ok(found)
    }

    fn index_commit(&self, repo_id: &str, repo: &Path, oid: &Oid, run: &mut RunState) -> Result<()> {
        let commit = self.engine.read_commit(repo, oid)?;

        if !run.trees.contains(&commit.tree_oid) {
            if !self.store.has_tree(repo_id, &commit.tree_oid)? {
                self.index_tree(repo_id, repo, &commit.tree_oid, run)?;
            }
            run.trees.insert(commit.tree_oid.clone());
        }

        let files = self.changed_files(repo, oid)?;
        for chunk in files.chunks(self.batch_size()) {
            self.store.insert_commit_files(repo_id, chunk)?;
        }

        self.store.insert_commit(repo_id, &commit)?;
        tracing::debug!(repo_id, commit = %oid, files = files.len(), "Commit indexed");
        Ok(())
    }

    /// Blobs go in before the tree entries, which are written in one
    /// transaction. A tree that `has_tree` reports is therefore complete.
    fn index_tree(&self, repo_id: &str, repo: &Path, tree: &Oid, run: &mut RunState) -> Result<()> {
        let entries = self.engine.walk_tree(repo, tree)?;

        for entry in entries.iter().filter(|e| e.entry_type == EntryType::Blob) {
            let key = (entry.entry_oid.clone(), entry.path.clone());
            if run.documents.contains(&key) {
                continue;
            }
            self.index_blob(repo_id, repo, entry)?;
            run.documents.insert(key);
        }

        self.store
            .insert_tree_entries(repo_id, &entries, self.batch_size())?;
        Ok(())
    }

    /// Stores the blob row once per oid and a search document for every
    /// path a text blob appears under.
    fn index_blob(&self, repo_id: &str, repo: &Path, entry: &TreeEntry) -> Result<()> {
        let record = match self.store.get_blob(repo_id, &entry.entry_oid)? {
            Some(stored) => stored,
            None => {
                let data = self
                    .engine
                    .read_blob(repo, &entry.entry_oid, self.config.max_blob_size)?;
                let record = blob_record(&entry.entry_oid, data.size, data.data);
                self.store.insert_blob(repo_id, &record)?;
                record
            }
        };

        if let Some(content) = &record.content {
            if let Err(e) =
                self.store
                    .upsert_search_document(repo_id, &record.oid, &entry.path, content)
            {
                tracing::warn!(repo_id, blob = %record.oid, path = %entry.path, "Search document not stored: {e}");
            }
        }

        Ok(())
    }

    /// Changed paths plus a `modify` row for each ancestor directory.
    fn changed_files(&self, repo: &Path, oid: &Oid) -> Result<Vec<CommitFile>> {
        let changes = self.engine.changed_paths(repo, oid)?;
        let mut by_path: BTreeMap<String, ChangeType> = BTreeMap::new();

        for change in &changes {
            by_path.insert(change.path.clone(), change.change_type);
        }
        for change in &changes {
            for dir in ancestor_dirs(&change.path) {
                by_path.entry(dir.to_string()).or_insert(ChangeType::Modify);
            }
        }

        Ok(by_path
            .into_iter()
            .map(|(path, change_type)| CommitFile {
                commit_oid: oid.clone(),
                path,
                change_type,
            })
            .collect())
    }

    /// The tip followed by its first parents down to the root commit.
    fn first_parent_chain(&self, repo: &Path, tip: &Oid) -> Result<Vec<Oid>> {
        let mut chain = vec![tip.clone()];
        let mut seen = HashSet::from([tip.clone()]);
        let mut current = tip.clone();

        while let Some(parent) = self.engine.commit_parents(repo, &current)?.into_iter().next() {
            if !seen.insert(parent.clone()) {
                break;
            }
            chain.push(parent.clone());
            current = parent;
        }

        Ok(chain)
    }
}

fn blob_record(oid: &Oid, size: u64, data: Option<Vec<u8>>) -> BlobRecord {
    let size = i64::try_from(size).unwrap_or(i64::MAX);
    let Some(bytes) = data else {
        return BlobRecord {
            oid: oid.clone(),
            content: None,
            size,
            is_binary: false,
            is_truncated: true,
        };
    };

    let text = if is_binary(&bytes) {
        None
    } else {
        String::from_utf8(bytes).ok()
    };

    BlobRecord {
        oid: oid.clone(),
        is_binary: text.is_none(),
        content: text,
        size,
        is_truncated: false,
    }
}

/// `a/b/c.txt` yields `a/b` then `a`.
fn ancestor_dirs(path: &str) -> impl Iterator<Item = &str> {
    path.char_indices()
        .rev()
        .filter(|(_, c)| *c == '/')
        .map(move |(i, _)| &path[..i])
        .filter(|dir| !dir.is_empty())
}
