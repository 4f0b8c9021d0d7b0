#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::Utc;
use git2::{Repository as GitRepository, Signature};
use tempfile::TempDir;
use uuid::Uuid;

use gitgate::auth::TokenGenerator;
use gitgate::config::IndexerConfig;
use gitgate::engine::{GitEngine, repo_path};
use gitgate::indexer::{IncrementalIndexer, IndexTrigger};
use gitgate::server::{AppState, create_router};
use gitgate::store::{SqliteStore, Store};
use gitgate::types::{Collaborator, Oid, PermissionLevel, RefChange, RefKind, Repository, User};

pub struct Fixture {
    pub temp: TempDir,
    pub store: Arc<SqliteStore>,
    pub engine: Arc<GitEngine>,
    pub config: IndexerConfig,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(IndexerConfig {
            settle_delay_ms: 10,
            ..IndexerConfig::default()
        })
    }

    pub fn with_config(config: IndexerConfig) -> Self {
        let temp = TempDir::new().expect("create temp dir");
        let store = SqliteStore::new(temp.path().join("gitgate.db")).expect("open store");
        store.initialize().expect("initialize store");
        Self {
            temp,
            store: Arc::new(store),
            engine: Arc::new(GitEngine::new()),
            config,
        }
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.temp.path().join("repos")
    }

    pub fn user(&self, username: &str) -> User {
        let user = User {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            created_at: Utc::now(),
        };
        self.store.create_user(&user).expect("create user");
        user
    }

    /// Raw HTTP token for `user`.
    pub fn token(&self, user: &User) -> String {
        let (token, raw) = TokenGenerator::new().issue(&user.id).expect("issue token");
        self.store.create_token(&token).expect("store token");
        raw
    }

    pub fn repo(&self, owner: &User, name: &str, public: bool) -> Repository {
        let path = repo_path(&self.repos_dir(), &owner.username, name);
        let git = GitRepository::init_bare(&path).expect("init bare repo");
        git.set_head("refs/heads/main").expect("set HEAD");

        let now = Utc::now();
        let repo = Repository {
            id: Uuid::new_v4().to_string(),
            owner_id: owner.id.clone(),
            name: name.to_string(),
            path,
            default_branch: "main".to_string(),
            public,
            created_at: now,
            updated_at: now,
        };
        self.store.create_repo(&repo).expect("create repo");
        repo
    }

    pub fn grant(&self, repo: &Repository, user: &User, permission: PermissionLevel) {
        self.store
            .upsert_collaborator(&Collaborator {
                repo_id: repo.id.clone(),
                user_id: user.id.clone(),
                permission,
                created_at: Utc::now(),
            })
            .expect("grant");
    }

    pub fn indexer(&self) -> IncrementalIndexer {
        IncrementalIndexer::new(self.engine.clone(), self.store.clone(), self.config.clone())
    }

    pub fn trigger(&self) -> Arc<IndexTrigger> {
        Arc::new(IndexTrigger::new(
            self.indexer(),
            self.engine.clone(),
            self.store.clone(),
            self.config.settle_delay(),
        ))
    }

    pub fn app(&self) -> Router {
        create_router(Arc::new(AppState {
            store: self.store.clone(),
            engine: self.engine.clone(),
            trigger: self.trigger(),
        }))
    }
}

/// Writes a commit whose tree holds exactly `files`, and points `ref_name` at
/// it (forcibly).
pub fn commit(
    repo: &Path,
    ref_name: &str,
    parents: &[&Oid],
    files: &[(&str, &str)],
    message: &str,
) -> Oid {
    let git = GitRepository::open_bare(repo).expect("open repo");
    let mut index = git2::Index::new().expect("in-memory index");
    for (path, content) in files {
        let blob = git.blob(content.as_bytes()).expect("write blob");
        index
            .add(&git2::IndexEntry {
                ctime: git2::IndexTime::new(0, 0),
                mtime: git2::IndexTime::new(0, 0),
                dev: 0,
                ino: 0,
                mode: 0o100644,
                uid: 0,
                gid: 0,
                file_size: content.len() as u32,
                id: blob,
                flags: 0,
                flags_extended: 0,
                path: path.as_bytes().to_vec(),
            })
            .expect("stage file");
    }
    let tree = git
        .find_tree(index.write_tree_to(&git).expect("write tree"))
        .expect("find tree");

    let parents: Vec<_> = parents
        .iter()
        .map(|p| {
            git.find_commit(git2::Oid::from_str(p.as_str()).expect("oid"))
                .expect("parent commit")
        })
        .collect();
    let parent_refs: Vec<_> = parents.iter().collect();

    let sig = Signature::now("Tester", "tester@example.com").expect("signature");
    let oid = git
        .commit(None, &sig, &sig, message, &tree, &parent_refs)
        .expect("commit");
    git.reference(ref_name, oid, true, "test").expect("update ref");
    Oid::from(oid)
}

pub fn delete_ref(repo: &Path, ref_name: &str) {
    let git = GitRepository::open_bare(repo).expect("open repo");
    git.find_reference(ref_name)
        .expect("find ref")
        .delete()
        .expect("delete ref");
}

pub fn update(ref_name: &str, old: Option<&Oid>, new: &Oid) -> RefChange {
    RefChange {
        ref_name: ref_name.to_string(),
        kind: RefKind::from_ref_name(ref_name).expect("branch or tag"),
        old_oid: old.cloned(),
        new_oid: new.clone(),
    }
}

pub fn deletion(ref_name: &str, old: &Oid) -> RefChange {
    update(ref_name, Some(old), &Oid::zero())
}

/// Polls `check` until it holds or a few seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
