mod index;
mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::types::*;

/// Store defines the identity and repository registry interface.
pub trait Store: Send + Sync {
    fn initialize(&self) -> Result<()>;

    // User operations
    fn create_user(&self, user: &User) -> Result<()>;
    fn get_user(&self, id: &str) -> Result<Option<User>>;
    fn get_user_by_username(&self, username: &str) -> Result<Option<User>>;

    // SSH key operations
    fn create_ssh_key(&self, key: &SshKey) -> Result<()>;
    fn list_ssh_keys(&self) -> Result<Vec<SshKey>>;
    fn list_user_ssh_keys(&self, user_id: &str) -> Result<Vec<SshKey>>;

    // Token operations
    fn create_token(&self, token: &Token) -> Result<()>;
    fn get_token_by_lookup(&self, lookup: &str) -> Result<Option<Token>>;
    fn update_token_last_used(&self, id: &str) -> Result<()>;

    // Repo operations
    fn create_repo(&self, repo: &Repository) -> Result<()>;
    fn get_repo(&self, owner_id: &str, name: &str) -> Result<Option<Repository>>;
    fn get_repo_by_id(&self, id: &str) -> Result<Option<Repository>>;
    fn set_repo_public(&self, id: &str, public: bool) -> Result<()>;

    // Collaborator operations
    fn upsert_collaborator(&self, collaborator: &Collaborator) -> Result<()>;
    fn get_collaborator(&self, repo_id: &str, user_id: &str) -> Result<Option<Collaborator>>;
    fn delete_collaborator(&self, repo_id: &str, user_id: &str) -> Result<bool>;
}

/// IndexStore defines the derived repository index.
///
/// Insert operations ignore rows whose unique key already exists, so applying
/// the same work twice never produces duplicates. Batched inserts write the
/// given slice as one multi-row statement; callers bound the slice length.
pub trait IndexStore: Send + Sync {
    // Write side
    fn has_commit(&self, repo_id: &str, oid: &Oid) -> Result<bool>;
    fn insert_commit(&self, repo_id: &str, commit: &CommitRecord) -> Result<()>;
    fn has_tree(&self, repo_id: &str, root_tree_oid: &Oid) -> Result<bool>;
    /// Writes every entry of one root tree in a single transaction, so
    /// `has_tree` never sees a partial tree.
    fn insert_tree_entries(
        &self,
        repo_id: &str,
        entries: &[TreeEntry],
        batch_size: usize,
    ) -> Result<()>;
    fn insert_blob(&self, repo_id: &str, blob: &BlobRecord) -> Result<()>;
    fn upsert_search_document(
        &self,
        repo_id: &str,
        blob_oid: &Oid,
        path: &str,
        content: &str,
    ) -> Result<()>;
    fn insert_commit_files(&self, repo_id: &str, files: &[CommitFile]) -> Result<()>;
    /// Atomically replaces every ancestry row of a ref with `chain`, where
    /// `chain[i]` is stored at depth `i`.
    fn replace_ancestry(
        &self,
        repo_id: &str,
        ref_name: &str,
        chain: &[Oid],
        batch_size: usize,
    ) -> Result<()>;
    fn upsert_ref(&self, repo_id: &str, name: &str, kind: RefKind, oid: &Oid) -> Result<()>;
    /// Removes the ref row and its ancestry rows. Shared rows are untouched.
    fn delete_ref(&self, repo_id: &str, name: &str) -> Result<bool>;
    /// Removes every index row for a repository.
    fn clear_index(&self, repo_id: &str) -> Result<()>;

    // Read side
    fn list_refs(&self, repo_id: &str) -> Result<Vec<IndexedRef>>;
    fn get_ref(&self, repo_id: &str, name: &str) -> Result<Option<IndexedRef>>;
    fn get_commit(&self, repo_id: &str, oid: &Oid) -> Result<Option<CommitRecord>>;
    fn commit_log(
        &self,
        repo_id: &str,
        ref_name: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<CommitRecord>>;
    fn list_ancestry(&self, repo_id: &str, ref_name: &str) -> Result<Vec<AncestryEntry>>;
    fn tree_listing(
        &self,
        repo_id: &str,
        root_tree_oid: &Oid,
        dir_path: &str,
    ) -> Result<Vec<TreeEntry>>;
    fn tree_listing_at_commit(
        &self,
        repo_id: &str,
        commit_oid: &Oid,
        dir_path: &str,
    ) -> Result<Vec<TreeEntry>>;
    fn get_blob(&self, repo_id: &str, oid: &Oid) -> Result<Option<BlobRecord>>;
    fn list_commit_files(&self, repo_id: &str, commit_oid: &Oid) -> Result<Vec<CommitFile>>;
    fn last_commit_for_path(
        &self,
        repo_id: &str,
        ref_name: &str,
        path: &str,
    ) -> Result<Option<CommitRecord>>;
    fn search(&self, repo_id: &str, query: &str, limit: i64) -> Result<Vec<SearchHit>>;
}
