use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{IncrementalIndexer, RefSnapshot, diff_snapshots, take_snapshot};
use crate::engine::VersionControlEngine;
use crate::error::Result;
use crate::store::IndexStore;
use crate::types::RefChange;

type RefKey = (String, String);

/// State captured right before a mutating transport operation.
#[derive(Debug, Clone)]
pub struct PendingPush {
    pub repo_id: String,
    pub repo_path: PathBuf,
    pub before: RefSnapshot,
}

/// Connects transports to the indexer.
///
/// A push is bracketed by [`IndexTrigger::capture`] before the receive
/// process starts and [`IndexTrigger::complete`] after it exits. Changes to
/// the same ref are applied one at a time; different refs proceed in
/// parallel.
pub struct IndexTrigger {
    indexer: IncrementalIndexer,
    engine: Arc<dyn VersionControlEngine>,
    store: Arc<dyn IndexStore>,
    settle_delay: Duration,
    locks: Mutex<HashMap<RefKey, Arc<AsyncMutex<()>>>>,
}

impl IndexTrigger {
    pub fn new(
        indexer: IncrementalIndexer,
        engine: Arc<dyn VersionControlEngine>,
        store: Arc<dyn IndexStore>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            indexer,
            engine,
            store,
            settle_delay,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn capture(&self, repo_id: &str, repo_path: &Path) -> Result<PendingPush> {
        let before = self.snapshot(repo_path).await?;
        Ok(PendingPush {
            repo_id: repo_id.to_string(),
            repo_path: repo_path.to_path_buf(),
            before,
        })
    }

    /// Indexes the push in the background. Failures are logged only.
    pub fn complete(self: &Arc<Self>, push: PendingPush) {
        let trigger = Arc::clone(self);
        tokio::spawn(async move {
            let repo_id = push.repo_id.clone();
            if let Err(e) = trigger.settle_and_apply(push).await {
                tracing::error!(repo_id = %repo_id, "Post-push indexing failed: {e}");
            }
        });
    }

    /// Waits out the settle delay, diffs against the after-snapshot and
    /// applies every change. Returns the number of refs applied.
    pub async fn settle_and_apply(&self, push: PendingPush) -> Result<usize> {
        tokio::time::sleep(self.settle_delay).await;

        let after = self.snapshot(&push.repo_path).await?;
        let changes = diff_snapshots(&push.before, &after);
        if changes.is_empty() {
            tracing::debug!(repo_id = %push.repo_id, "Push changed no refs");
            return Ok(0);
        }

        let mut applied = 0;
        for change in changes {
            let ref_name = change.ref_name.clone();
            match self.apply(&push.repo_id, &push.repo_path, change).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    tracing::error!(repo_id = %push.repo_id, ref_name = %ref_name, "Indexing ref failed: {e}");
                }
            }
        }
        Ok(applied)
    }

    /// Applies one change while holding that ref's lock.
    pub async fn apply(&self, repo_id: &str, repo_path: &Path, change: RefChange) -> Result<()> {
        let _guard = self.lock_ref(repo_id, &change.ref_name).await;

        let indexer = self.indexer.clone();
        let repo_id = repo_id.to_string();
        let repo_path = repo_path.to_path_buf();
        tokio::task::spawn_blocking(move || indexer.apply(&repo_id, &repo_path, &change))
            .await??;
        Ok(())
    }

    /// Full reindex holding the lock of every ref it may touch.
    pub async fn reindex(&self, repo_id: &str, repo_path: &Path) -> Result<usize> {
        let mut names: BTreeSet<String> = self
            .snapshot(repo_path)
            .await?
            .into_keys()
            .collect();
        names.extend(
            self.store
                .list_refs(repo_id)?
                .into_iter()
                .map(|r| r.name),
        );

        // Sorted acquisition keeps concurrent reindexes from deadlocking.
        let mut guards = Vec::with_capacity(names.len());
        for name in &names {
            guards.push(self.lock_ref(repo_id, name).await);
        }

        let indexer = self.indexer.clone();
        let repo_id = repo_id.to_string();
        let repo_path = repo_path.to_path_buf();
        let commits =
            tokio::task::spawn_blocking(move || indexer.full_reindex(&repo_id, &repo_path))
                .await??;
        drop(guards);
        Ok(commits)
    }

    async fn snapshot(&self, repo_path: &Path) -> Result<RefSnapshot> {
        let engine = Arc::clone(&self.engine);
        let repo_path = repo_path.to_path_buf();
        tokio::task::spawn_blocking(move || take_snapshot(engine.as_ref(), &repo_path)).await?
    }

    async fn lock_ref(&self, repo_id: &str, ref_name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(
                locks
                    .entry((repo_id.to_string(), ref_name.to_string()))
                    .or_default(),
            )
        };
        lock.lock_owned().await
    }
}
