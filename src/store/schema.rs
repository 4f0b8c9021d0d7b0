pub const SCHEMA: &str = r#"
-- Users authenticate over SSH with public keys and over HTTP with tokens
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS ssh_keys (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    title TEXT NOT NULL,
    key_type TEXT NOT NULL,
    key_blob TEXT NOT NULL,            -- base64 wire encoding, as in authorized_keys
    fingerprint TEXT NOT NULL UNIQUE,  -- SHA256:<base64>
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS tokens (
    id TEXT PRIMARY KEY,
    token_hash TEXT NOT NULL,          -- argon2id hash with embedded salt
    token_lookup TEXT NOT NULL,        -- first 8 chars of ID for fast lookup
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    created_at TEXT DEFAULT (datetime('now')),
    expires_at TEXT,                   -- NULL = never
    last_used_at TEXT
);

-- Repositories
CREATE TABLE IF NOT EXISTS repos (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    path TEXT NOT NULL,
    default_branch TEXT NOT NULL DEFAULT 'main',
    public INTEGER NOT NULL DEFAULT 0,  -- If 1, anonymous read access allowed
    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now')),

    UNIQUE(owner_id, name)
);

CREATE TABLE IF NOT EXISTS collaborators (
    repo_id TEXT NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    permission TEXT NOT NULL CHECK (permission IN ('read', 'write', 'admin')),
    created_at TEXT DEFAULT (datetime('now')),
    PRIMARY KEY (repo_id, user_id)
);

-- Derived index. Commit, tree and blob rows are content-addressed and shared
-- by every ref that reaches them.
CREATE TABLE IF NOT EXISTS refs (
    repo_id TEXT NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    oid TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (repo_id, name)
);

CREATE TABLE IF NOT EXISTS commits (
    repo_id TEXT NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
    oid TEXT NOT NULL,
    tree_oid TEXT NOT NULL,
    message TEXT NOT NULL,
    author_name TEXT NOT NULL,
    author_email TEXT NOT NULL,
    author_time TEXT NOT NULL,
    committer_name TEXT NOT NULL,
    committer_email TEXT NOT NULL,
    committer_time TEXT NOT NULL,
    parent_oids TEXT NOT NULL,  -- space separated, first parent first
    PRIMARY KEY (repo_id, oid)
);

CREATE TABLE IF NOT EXISTS tree_entries (
    repo_id TEXT NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
    root_tree_oid TEXT NOT NULL,
    path TEXT NOT NULL,
    parent_path TEXT NOT NULL,
    name TEXT NOT NULL,
    entry_type TEXT NOT NULL,
    entry_oid TEXT NOT NULL,
    mode INTEGER NOT NULL,
    PRIMARY KEY (repo_id, root_tree_oid, path)
);

CREATE TABLE IF NOT EXISTS blobs (
    repo_id TEXT NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
    oid TEXT NOT NULL,
    content TEXT,               -- NULL when binary or over the size limit
    size INTEGER NOT NULL,
    is_binary INTEGER NOT NULL DEFAULT 0,
    is_truncated INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (repo_id, oid)
);

CREATE TABLE IF NOT EXISTS commit_files (
    repo_id TEXT NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
    commit_oid TEXT NOT NULL,
    path TEXT NOT NULL,
    change_type TEXT NOT NULL,
    PRIMARY KEY (repo_id, commit_oid, path)
);

-- First-parent chain of each ref, depth 0 at the tip
CREATE TABLE IF NOT EXISTS ancestry (
    repo_id TEXT NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
    ref_name TEXT NOT NULL,
    commit_oid TEXT NOT NULL,
    depth INTEGER NOT NULL,
    PRIMARY KEY (repo_id, ref_name, depth)
);

CREATE VIRTUAL TABLE IF NOT EXISTS blob_search USING fts5(
    repo_id UNINDEXED,
    blob_oid UNINDEXED,
    path UNINDEXED,
    content
);

-- Create indexes
CREATE INDEX IF NOT EXISTS idx_ssh_keys_user ON ssh_keys(user_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_tokens_lookup ON tokens(token_lookup);
CREATE INDEX IF NOT EXISTS idx_tokens_user ON tokens(user_id);
CREATE INDEX IF NOT EXISTS idx_repos_owner ON repos(owner_id);
CREATE INDEX IF NOT EXISTS idx_collaborators_user ON collaborators(user_id);
CREATE INDEX IF NOT EXISTS idx_tree_entries_parent ON tree_entries(repo_id, root_tree_oid, parent_path);
CREATE INDEX IF NOT EXISTS idx_commit_files_path ON commit_files(repo_id, path);
CREATE INDEX IF NOT EXISTS idx_ancestry_commit ON ancestry(repo_id, ref_name, commit_oid);
"#;
