//! Indexing tests against real bare repositories.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::process::Command;

use common::{Fixture, commit, delete_ref, deletion, update};
use gitgate::config::IndexerConfig;
use gitgate::engine::{
    BlobData, GitEngine, GitService, PathChange, ProtocolMode, RefTip, VersionControlEngine,
};
use gitgate::error::{Error, Result};
use gitgate::indexer::IncrementalIndexer;
use gitgate::store::IndexStore;
use gitgate::types::{ChangeType, CommitRecord, EntryType, Oid, TreeEntry};

const MAIN: &str = "refs/heads/main";

fn ancestry(fx: &Fixture, repo_id: &str, ref_name: &str) -> Vec<Oid> {
    fx.store
        .list_ancestry(repo_id, ref_name)
        .unwrap()
        .into_iter()
        .map(|a| a.commit_oid)
        .collect()
}

#[test]
fn test_linear_history() {
    let fx = Fixture::new();
    let alice = fx.user("alice");
    let repo = fx.repo(&alice, "proj", false);

    let a = commit(&repo.path, MAIN, &[], &[("README.md", "hello\n")], "A");
    let b = commit(&repo.path, MAIN, &[&a], &[("README.md", "hello\n"), ("src/lib.rs", "pub fn needle() {}\n")], "B");
    let c = commit(&repo.path, MAIN, &[&b], &[("README.md", "bye\n"), ("src/lib.rs", "pub fn needle() {}\n")], "C");

    let outcome = fx.indexer().apply(&repo.id, &repo.path, &update(MAIN, None, &c)).unwrap();
    assert_eq!(outcome.commits_indexed, 3);

    assert_eq!(ancestry(&fx, &repo.id, MAIN), vec![c.clone(), b.clone(), a.clone()]);

    let log: Vec<_> = fx
        .store
        .commit_log(&repo.id, MAIN, 0, 10)
        .unwrap()
        .into_iter()
        .map(|commit| commit.message)
        .collect();
    assert_eq!(log, vec!["C", "B", "A"]);

    let head = fx.store.get_ref(&repo.id, MAIN).unwrap().unwrap();
    assert_eq!(head.oid, c);

    let tip = fx.store.get_commit(&repo.id, &c).unwrap().unwrap();
    let root = fx.store.tree_listing(&repo.id, &tip.tree_oid, "").unwrap();
    let names: Vec<_> = root.iter().map(|e| (e.name.as_str(), e.entry_type)).collect();
    assert_eq!(names, vec![("src", EntryType::Tree), ("README.md", EntryType::Blob)]);

    let src = fx.store.tree_listing_at_commit(&repo.id, &c, "src").unwrap();
    assert_eq!(src.len(), 1);
    assert_eq!(src[0].path, "src/lib.rs");

    let hits = fx.store.search(&repo.id, "needle", 10).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, "src/lib.rs");

    let last = fx
        .store
        .last_commit_for_path(&repo.id, MAIN, "src/lib.rs")
        .unwrap()
        .unwrap();
    assert_eq!(last.oid, b);
    let last = fx.store.last_commit_for_path(&repo.id, MAIN, "README.md").unwrap().unwrap();
    assert_eq!(last.oid, c);
}

#[test]
fn test_reapplying_is_idempotent() {
    let fx = Fixture::new();
    let alice = fx.user("alice");
    let repo = fx.repo(&alice, "proj", false);
    let a = commit(&repo.path, MAIN, &[], &[("a.txt", "a\n")], "A");
    let b = commit(&repo.path, MAIN, &[&a], &[("a.txt", "b\n")], "B");

    let indexer = fx.indexer();
    let change = update(MAIN, None, &b);
    assert_eq!(indexer.apply(&repo.id, &repo.path, &change).unwrap().commits_indexed, 2);
    let files_before = fx.store.list_commit_files(&repo.id, &b).unwrap();

    assert_eq!(indexer.apply(&repo.id, &repo.path, &change).unwrap().commits_indexed, 0);
    assert_eq!(ancestry(&fx, &repo.id, MAIN), vec![b.clone(), a]);
    assert_eq!(fx.store.list_commit_files(&repo.id, &b).unwrap(), files_before);
}

#[test]
fn test_incremental_push_stops_at_known_commits() {
    let fx = Fixture::new();
    let alice = fx.user("alice");
    let repo = fx.repo(&alice, "proj", false);
    let indexer = fx.indexer();

    let a = commit(&repo.path, MAIN, &[], &[("a.txt", "1\n")], "A");
    indexer.apply(&repo.id, &repo.path, &update(MAIN, None, &a)).unwrap();

    let b = commit(&repo.path, MAIN, &[&a], &[("a.txt", "2\n")], "B");
    let c = commit(&repo.path, MAIN, &[&b], &[("a.txt", "3\n")], "C");
    let outcome = indexer
        .apply(&repo.id, &repo.path, &update(MAIN, Some(&a), &c))
        .unwrap();

    assert_eq!(outcome.commits_indexed, 2);
    assert_eq!(ancestry(&fx, &repo.id, MAIN), vec![c, b, a]);
}

#[test]
fn test_merge_indexes_both_sides() {
    let fx = Fixture::new();
    let alice = fx.user("alice");
    let repo = fx.repo(&alice, "proj", false);

    let base = commit(&repo.path, MAIN, &[], &[("a.txt", "base\n")], "base");
    let left = commit(&repo.path, MAIN, &[&base], &[("a.txt", "left\n")], "left");
    let right = commit(&repo.path, "refs/heads/topic", &[&base], &[("a.txt", "base\n"), ("b.txt", "right\n")], "right");
    let merge = commit(&repo.path, MAIN, &[&left, &right], &[("a.txt", "left\n"), ("b.txt", "right\n")], "merge");

    let outcome = fx.indexer().apply(&repo.id, &repo.path, &update(MAIN, None, &merge)).unwrap();
    assert_eq!(outcome.commits_indexed, 4);
    assert!(fx.store.get_commit(&repo.id, &right).unwrap().is_some());

    // Ancestry follows first parents only.
    assert_eq!(ancestry(&fx, &repo.id, MAIN), vec![merge, left, base]);
}

#[test]
fn test_force_push_rebuilds_ancestry() {
    let fx = Fixture::new();
    let alice = fx.user("alice");
    let repo = fx.repo(&alice, "proj", false);
    let indexer = fx.indexer();

    let a = commit(&repo.path, MAIN, &[], &[("a.txt", "a\n")], "A");
    let b = commit(&repo.path, MAIN, &[&a], &[("a.txt", "b\n")], "B");
    let c = commit(&repo.path, MAIN, &[&b], &[("a.txt", "c\n")], "C");
    indexer.apply(&repo.id, &repo.path, &update(MAIN, None, &c)).unwrap();

    let d = commit(&repo.path, MAIN, &[&a], &[("a.txt", "d\n")], "D");
    let outcome = indexer
        .apply(&repo.id, &repo.path, &update(MAIN, Some(&c), &d))
        .unwrap();

    assert_eq!(outcome.commits_indexed, 1);
    assert_eq!(ancestry(&fx, &repo.id, MAIN), vec![d, a]);
    // Rewritten commits stay; other refs may still reach them.
    assert!(fx.store.get_commit(&repo.id, &b).unwrap().is_some());
    assert!(fx.store.get_commit(&repo.id, &c).unwrap().is_some());
}

#[test]
fn test_deletion_keeps_shared_rows() {
    let fx = Fixture::new();
    let alice = fx.user("alice");
    let repo = fx.repo(&alice, "proj", false);
    let indexer = fx.indexer();

    let a = commit(&repo.path, MAIN, &[], &[("a.txt", "a\n")], "A");
    let b = commit(&repo.path, "refs/heads/feature", &[&a], &[("a.txt", "b\n")], "B");
    indexer.apply(&repo.id, &repo.path, &update(MAIN, None, &a)).unwrap();
    indexer
        .apply(&repo.id, &repo.path, &update("refs/heads/feature", None, &b))
        .unwrap();

    let outcome = indexer
        .apply(&repo.id, &repo.path, &deletion("refs/heads/feature", &b))
        .unwrap();
    assert!(outcome.ref_deleted);

    assert!(fx.store.get_ref(&repo.id, "refs/heads/feature").unwrap().is_none());
    assert!(ancestry(&fx, &repo.id, "refs/heads/feature").is_empty());
    assert!(fx.store.get_commit(&repo.id, &b).unwrap().is_some());
    assert_eq!(ancestry(&fx, &repo.id, MAIN), vec![a]);

    // Deleting again is harmless.
    let again = indexer
        .apply(&repo.id, &repo.path, &deletion("refs/heads/feature", &b))
        .unwrap();
    assert!(!again.ref_deleted);
}

#[test]
fn test_blob_policy() {
    let fx = Fixture::with_config(IndexerConfig {
        max_blob_size: 32,
        ..IndexerConfig::default()
    });
    let alice = fx.user("alice");
    let repo = fx.repo(&alice, "proj", false);

    let big = "searchable ".repeat(10);
    let a = commit(
        &repo.path,
        MAIN,
        &[],
        &[("small.txt", "searchable text\n"), ("image.bin", "PNG\0\u{1}\u{2}"), ("big.txt", big.as_str())],
        "A",
    );
    fx.indexer().apply(&repo.id, &repo.path, &update(MAIN, None, &a)).unwrap();

    let entries = fx.store.tree_listing_at_commit(&repo.id, &a, "").unwrap();
    let blob = |name: &str| {
        let entry = entries.iter().find(|e| e.name == name).unwrap();
        fx.store.get_blob(&repo.id, &entry.entry_oid).unwrap().unwrap()
    };

    let small = blob("small.txt");
    assert_eq!(small.content.as_deref(), Some("searchable text\n"));
    assert!(!small.is_binary && !small.is_truncated);

    let image = blob("image.bin");
    assert!(image.is_binary);
    assert!(image.content.is_none());

    let large = blob("big.txt");
    assert!(large.is_truncated);
    assert!(large.content.is_none());
    assert_eq!(large.size, big.len() as i64);

    let hits = fx.store.search(&repo.id, "searchable", 10).unwrap();
    let paths: Vec<_> = hits.iter().map(|h| h.path.as_str()).collect();
    assert_eq!(paths, vec!["small.txt"]);
}

#[test]
fn test_changed_files_include_parent_dirs() {
    let fx = Fixture::new();
    let alice = fx.user("alice");
    let repo = fx.repo(&alice, "proj", false);

    let a = commit(&repo.path, MAIN, &[], &[("src/a/b.rs", "1\n"), ("top.txt", "t\n")], "A");
    let b = commit(&repo.path, MAIN, &[&a], &[("src/a/b.rs", "2\n"), ("src/new.rs", "n\n"), ("top.txt", "t\n")], "B");
    fx.indexer().apply(&repo.id, &repo.path, &update(MAIN, None, &b)).unwrap();

    let root: Vec<_> = fx
        .store
        .list_commit_files(&repo.id, &a)
        .unwrap()
        .into_iter()
        .map(|f| (f.path, f.change_type))
        .collect();
    assert!(root.contains(&("top.txt".to_string(), ChangeType::Add)));
    assert!(root.contains(&("src/a/b.rs".to_string(), ChangeType::Add)));
    assert!(root.contains(&("src/a".to_string(), ChangeType::Modify)));

    let mut second: Vec<_> = fx
        .store
        .list_commit_files(&repo.id, &b)
        .unwrap()
        .into_iter()
        .map(|f| (f.path, f.change_type))
        .collect();
    second.sort();
    assert_eq!(
        second,
        vec![
            ("src".to_string(), ChangeType::Modify),
            ("src/a".to_string(), ChangeType::Modify),
            ("src/a/b.rs".to_string(), ChangeType::Modify),
            ("src/new.rs".to_string(), ChangeType::Add),
        ]
    );
}

#[test]
fn test_full_reindex_matches_live_refs() {
    let fx = Fixture::new();
    let alice = fx.user("alice");
    let repo = fx.repo(&alice, "proj", false);
    let indexer = fx.indexer();

    let a = commit(&repo.path, MAIN, &[], &[("a.txt", "a\n")], "A");
    let b = commit(&repo.path, "refs/heads/old", &[&a], &[("a.txt", "b\n")], "B");
    commit(&repo.path, "refs/tags/v1", &[&a], &[("a.txt", "a\n")], "tagged");
    indexer.apply(&repo.id, &repo.path, &update(MAIN, None, &a)).unwrap();
    indexer
        .apply(&repo.id, &repo.path, &update("refs/heads/old", None, &b))
        .unwrap();

    delete_ref(&repo.path, "refs/heads/old");
    let commits = indexer.full_reindex(&repo.id, &repo.path).unwrap();
    assert_eq!(commits, 2);

    let names: Vec<_> = fx
        .store
        .list_refs(&repo.id)
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec![MAIN.to_string(), "refs/tags/v1".to_string()]);
    assert!(fx.store.get_commit(&repo.id, &b).unwrap().is_none());
    assert_eq!(ancestry(&fx, &repo.id, MAIN), vec![a]);
}

#[tokio::test]
async fn test_trigger_indexes_snapshot_difference() {
    let fx = Fixture::new();
    let alice = fx.user("alice");
    let repo = fx.repo(&alice, "proj", false);
    let trigger = fx.trigger();

    let a = commit(&repo.path, MAIN, &[], &[("a.txt", "a\n")], "A");
    let pending = trigger.capture(&repo.id, &repo.path).await.unwrap();
    assert_eq!(pending.before.get(MAIN), Some(&a));

    let b = commit(&repo.path, MAIN, &[&a], &[("a.txt", "b\n")], "B");
    let t = commit(&repo.path, "refs/tags/v1", &[&a], &[("a.txt", "a\n")], "T");

    let applied = trigger.settle_and_apply(pending).await.unwrap();
    assert_eq!(applied, 2);
    assert_eq!(fx.store.get_ref(&repo.id, MAIN).unwrap().unwrap().oid, b);
    assert_eq!(fx.store.get_ref(&repo.id, "refs/tags/v1").unwrap().unwrap().oid, t);

    // Nothing changed since: nothing to apply.
    let pending = trigger.capture(&repo.id, &repo.path).await.unwrap();
    assert_eq!(trigger.settle_and_apply(pending).await.unwrap(), 0);
}

#[tokio::test]
async fn test_concurrent_updates_to_one_ref_serialize() {
    let fx = Fixture::new();
    let alice = fx.user("alice");
    let repo = fx.repo(&alice, "proj", false);
    let trigger = fx.trigger();

    let mut tip = commit(&repo.path, MAIN, &[], &[("f.txt", "0\n")], "0");
    for i in 1..20 {
        tip = commit(&repo.path, MAIN, &[&tip], &[("f.txt", format!("{i}\n").as_str())], &i.to_string());
    }

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let trigger = trigger.clone();
        let repo = repo.clone();
        let change = update(MAIN, None, &tip);
        tasks.push(tokio::spawn(async move {
            trigger.apply(&repo.id, &repo.path, change).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let chain = ancestry(&fx, &repo.id, MAIN);
    assert_eq!(chain.len(), 20);
    assert_eq!(chain[0], tip);
}

#[tokio::test]
async fn test_reindex_through_trigger() {
    let fx = Fixture::new();
    let alice = fx.user("alice");
    let repo = fx.repo(&alice, "proj", false);
    let a = commit(&repo.path, MAIN, &[], &[("a.txt", "a\n")], "A");

    let commits = fx.trigger().reindex(&repo.id, &repo.path).await.unwrap();
    assert_eq!(commits, 1);
    assert_eq!(ancestry(&fx, &repo.id, MAIN), vec![a]);
}

#[test]
fn test_identical_blobs_searchable_under_every_path() {
    let fx = Fixture::new();
    let alice = fx.user("alice");
    let repo = fx.repo(&alice, "proj", false);

    let a = commit(&repo.path, MAIN, &[], &[("a.txt", "needle\n")], "A");
    let b = commit(
        &repo.path,
        MAIN,
        &[&a],
        &[("a.txt", "needle\n"), ("copy.txt", "needle\n"), ("docs/same.txt", "needle\n")],
        "B",
    );
    fx.indexer().apply(&repo.id, &repo.path, &update(MAIN, None, &b)).unwrap();

    let mut paths: Vec<_> = fx
        .store
        .search(&repo.id, "needle", 10)
        .unwrap()
        .into_iter()
        .map(|hit| hit.path)
        .collect();
    paths.sort();
    assert_eq!(paths, vec!["a.txt", "copy.txt", "docs/same.txt"]);
}

/// Delegates to git, failing the first blob read.
struct FailFirstBlobRead {
    inner: GitEngine,
    failed: AtomicBool,
}

impl VersionControlEngine for FailFirstBlobRead {
    fn list_refs(&self, repo: &Path) -> Result<Vec<RefTip>> {
        self.inner.list_refs(repo)
    }

    fn read_commit(&self, repo: &Path, oid: &Oid) -> Result<CommitRecord> {
        self.inner.read_commit(repo, oid)
    }

    fn commit_parents(&self, repo: &Path, oid: &Oid) -> Result<Vec<Oid>> {
        self.inner.commit_parents(repo, oid)
    }

    fn walk_tree(&self, repo: &Path, tree: &Oid) -> Result<Vec<TreeEntry>> {
        self.inner.walk_tree(repo, tree)
    }

    fn read_blob(&self, repo: &Path, oid: &Oid, max_size: u64) -> Result<BlobData> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(Error::Git("object read interrupted".to_string()));
        }
        self.inner.read_blob(repo, oid, max_size)
    }

    fn changed_paths(&self, repo: &Path, oid: &Oid) -> Result<Vec<PathChange>> {
        self.inner.changed_paths(repo, oid)
    }

    fn protocol_command(&self, repo: &Path, service: GitService, mode: ProtocolMode) -> Command {
        self.inner.protocol_command(repo, service, mode)
    }
}

#[test]
fn test_retry_after_failed_blob_read_completes_tree() {
    let fx = Fixture::new();
    let alice = fx.user("alice");
    let repo = fx.repo(&alice, "proj", false);
    let a = commit(&repo.path, MAIN, &[], &[("a.txt", "first\n"), ("b.txt", "second\n")], "A");

    let indexer = IncrementalIndexer::new(
        Arc::new(FailFirstBlobRead {
            inner: GitEngine::new(),
            failed: AtomicBool::new(false),
        }),
        fx.store.clone(),
        fx.config.clone(),
    );
    let change = update(MAIN, None, &a);

    assert!(indexer.apply(&repo.id, &repo.path, &change).is_err());
    assert!(!fx.store.has_commit(&repo.id, &a).unwrap());
    assert!(fx.store.get_ref(&repo.id, MAIN).unwrap().is_none());

    let outcome = indexer.apply(&repo.id, &repo.path, &change).unwrap();
    assert_eq!(outcome.commits_indexed, 1);

    let entries = fx.store.tree_listing_at_commit(&repo.id, &a, "").unwrap();
    assert_eq!(entries.len(), 2);
    for entry in &entries {
        let blob = fx.store.get_blob(&repo.id, &entry.entry_oid).unwrap();
        assert!(blob.is_some(), "{} has no blob row", entry.path);
    }
    assert_eq!(fx.store.search(&repo.id, "first", 10).unwrap().len(), 1);
    assert_eq!(fx.store.search(&repo.id, "second", 10).unwrap().len(), 1);
}
