use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use super::IndexStore;
use super::sqlite::{SqliteStore, format_datetime, oid_column, parse_datetime};
use crate::error::{Error, Result};
use crate::types::*;

const COMMIT_COLUMNS: &str = "c.oid, c.tree_oid, c.message, c.author_name, c.author_email, \
     c.author_time, c.committer_name, c.committer_email, c.committer_time, c.parent_oids";

const TREE_COLUMNS: &str = "root_tree_oid, path, parent_path, name, entry_type, entry_oid, mode";

fn commit_from_row(row: &Row<'_>) -> rusqlite::Result<CommitRecord> {
    let parents: String = row.get(9)?;
    let parent_oids = parents
        .split_whitespace()
        .map(Oid::parse)
        .collect::<Result<Vec<_>>>()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(CommitRecord {
        oid: oid_column(row, 0)?,
        tree_oid: oid_column(row, 1)?,
        message: row.get(2)?,
        author: Signature {
            name: row.get(3)?,
            email: row.get(4)?,
            time: parse_datetime(&row.get::<_, String>(5)?),
        },
        committer: Signature {
            name: row.get(6)?,
            email: row.get(7)?,
            time: parse_datetime(&row.get::<_, String>(8)?),
        },
        parent_oids,
    })
}

fn tree_entry_from_row(row: &Row<'_>) -> rusqlite::Result<TreeEntry> {
    let entry_type: String = row.get(4)?;
    Ok(TreeEntry {
        root_tree_oid: oid_column(row, 0)?,
        path: row.get(1)?,
        parent_path: row.get(2)?,
        name: row.get(3)?,
        entry_type: EntryType::parse(&entry_type).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?,
        entry_oid: oid_column(row, 5)?,
        mode: row.get(6)?,
    })
}

/// Writes `rows` as a single multi-row insert that skips rows whose unique key
/// already exists. Returns the number of rows actually inserted.
fn insert_rows(
    conn: &Connection,
    table: &str,
    columns: &[&str],
    rows: &[Vec<Value>],
) -> Result<usize> {
    if rows.is_empty() {
        return Ok(0);
    }

    let placeholder = format!("({})", vec!["?"; columns.len()].join(", "));
    let values = vec![placeholder.as_str(); rows.len()].join(", ");
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES {values} ON CONFLICT DO NOTHING",
        columns.join(", ")
    );

    let inserted = conn.execute(&sql, params_from_iter(rows.iter().flatten()))?;
    Ok(inserted)
}

fn text(s: impl Into<String>) -> Value {
    Value::Text(s.into())
}

/// Turns free text into an FTS5 query matching every term literally.
fn fts_query(raw: &str) -> String {
    raw.split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalize_dir(dir_path: &str) -> &str {
    dir_path.trim_matches('/')
}

impl IndexStore for SqliteStore {
    fn has_commit(&self, repo_id: &str, oid: &Oid) -> Result<bool> {
        let conn = self.conn();
        let found = conn
            .query_row(
                "SELECT 1 FROM commits WHERE repo_id = ?1 AND oid = ?2",
                params![repo_id, oid.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn insert_commit(&self, repo_id: &str, commit: &CommitRecord) -> Result<()> {
        let parents = commit
            .parent_oids
            .iter()
            .map(Oid::as_str)
            .collect::<Vec<_>>()
            .join(" ");

        self.conn().execute(
            "INSERT INTO commits (repo_id, oid, tree_oid, message, author_name, author_email,
                author_time, committer_name, committer_email, committer_time, parent_oids)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT (repo_id, oid) DO NOTHING",
            params![
                repo_id,
                commit.oid.as_str(),
                commit.tree_oid.as_str(),
                commit.message,
                commit.author.name,
                commit.author.email,
                format_datetime(&commit.author.time),
                commit.committer.name,
                commit.committer.email,
                format_datetime(&commit.committer.time),
                parents,
            ],
        )?;
        Ok(())
    }

    fn has_tree(&self, repo_id: &str, root_tree_oid: &Oid) -> Result<bool> {
        let conn = self.conn();
        let found = conn
            .query_row(
                "SELECT 1 FROM tree_entries WHERE repo_id = ?1 AND root_tree_oid = ?2 LIMIT 1",
                params![repo_id, root_tree_oid.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn insert_tree_entries(
        &self,
        repo_id: &str,
        entries: &[TreeEntry],
        batch_size: usize,
    ) -> Result<()> {
        let rows: Vec<Vec<Value>> = entries
            .iter()
            .map(|e| {
                vec![
                    text(repo_id),
                    text(e.root_tree_oid.as_str()),
                    text(e.path.as_str()),
                    text(e.parent_path.as_str()),
                    text(e.name.as_str()),
                    text(e.entry_type.as_str()),
                    text(e.entry_oid.as_str()),
                    Value::Integer(i64::from(e.mode)),
                ]
            })
            .collect();

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for chunk in rows.chunks(batch_size.max(1)) {
            insert_rows(
                &tx,
                "tree_entries",
                &[
                    "repo_id",
                    "root_tree_oid",
                    "path",
                    "parent_path",
                    "name",
                    "entry_type",
                    "entry_oid",
                    "mode",
                ],
                chunk,
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_blob(&self, repo_id: &str, blob: &BlobRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO blobs (repo_id, oid, content, size, is_binary, is_truncated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (repo_id, oid) DO NOTHING",
            params![
                repo_id,
                blob.oid.as_str(),
                blob.content,
                blob.size,
                blob.is_binary,
                blob.is_truncated,
            ],
        )?;
        Ok(())
    }

    fn upsert_search_document(
        &self,
        repo_id: &str,
        blob_oid: &Oid,
        path: &str,
        content: &str,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM blob_search WHERE repo_id = ?1 AND blob_oid = ?2 AND path = ?3",
            params![repo_id, blob_oid.as_str(), path],
        )?;
        tx.execute(
            "INSERT INTO blob_search (repo_id, blob_oid, path, content) VALUES (?1, ?2, ?3, ?4)",
            params![repo_id, blob_oid.as_str(), path, content],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn insert_commit_files(&self, repo_id: &str, files: &[CommitFile]) -> Result<()> {
        let rows: Vec<Vec<Value>> = files
            .iter()
            .map(|f| {
                vec![
                    text(repo_id),
                    text(f.commit_oid.as_str()),
                    text(f.path.as_str()),
                    text(f.change_type.as_str()),
                ]
            })
            .collect();

        insert_rows(
            &self.conn(),
            "commit_files",
            &["repo_id", "commit_oid", "path", "change_type"],
            &rows,
        )?;
        Ok(())
    }

    fn replace_ancestry(
        &self,
        repo_id: &str,
        ref_name: &str,
        chain: &[Oid],
        batch_size: usize,
    ) -> Result<()> {
        let batch_size = batch_size.max(1);
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM ancestry WHERE repo_id = ?1 AND ref_name = ?2",
            params![repo_id, ref_name],
        )?;

        for (chunk_index, chunk) in chain.chunks(batch_size).enumerate() {
            let base = (chunk_index * batch_size) as i64;
            let rows: Vec<Vec<Value>> = chunk
                .iter()
                .enumerate()
                .map(|(i, oid)| {
                    vec![
                        text(repo_id),
                        text(ref_name),
                        text(oid.as_str()),
                        Value::Integer(base + i as i64),
                    ]
                })
                .collect();

            insert_rows(
                &tx,
                "ancestry",
                &["repo_id", "ref_name", "commit_oid", "depth"],
                &rows,
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn upsert_ref(&self, repo_id: &str, name: &str, kind: RefKind, oid: &Oid) -> Result<()> {
        self.conn().execute(
            "INSERT INTO refs (repo_id, name, kind, oid, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (repo_id, name) DO UPDATE SET
                kind = excluded.kind,
                oid = excluded.oid,
                updated_at = excluded.updated_at",
            params![
                repo_id,
                name,
                kind.as_str(),
                oid.as_str(),
                format_datetime(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    fn delete_ref(&self, repo_id: &str, name: &str) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM ancestry WHERE repo_id = ?1 AND ref_name = ?2",
            params![repo_id, name],
        )?;
        let rows = tx.execute(
            "DELETE FROM refs WHERE repo_id = ?1 AND name = ?2",
            params![repo_id, name],
        )?;
        tx.commit()?;
        Ok(rows > 0)
    }

    fn clear_index(&self, repo_id: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for table in [
            "ancestry",
            "refs",
            "commit_files",
            "tree_entries",
            "blobs",
            "commits",
            "blob_search",
        ] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE repo_id = ?1"),
                params![repo_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn list_refs(&self, repo_id: &str) -> Result<Vec<IndexedRef>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT repo_id, name, kind, oid, updated_at FROM refs WHERE repo_id = ?1 ORDER BY name",
        )?;

        let rows = stmt.query_map(params![repo_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                oid_column(row, 3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        rows.map(|row| -> Result<IndexedRef> {
            let (repo_id, name, kind, oid, updated_at) = row?;
            Ok(IndexedRef {
                repo_id,
                name,
                kind: RefKind::parse(&kind)?,
                oid,
                updated_at: parse_datetime(&updated_at),
            })
        })
        .collect()
    }

    fn get_ref(&self, repo_id: &str, name: &str) -> Result<Option<IndexedRef>> {
        Ok(self
            .list_refs(repo_id)?
            .into_iter()
            .find(|r| r.name == name))
    }

    fn get_commit(&self, repo_id: &str, oid: &Oid) -> Result<Option<CommitRecord>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {COMMIT_COLUMNS} FROM commits c WHERE c.repo_id = ?1 AND c.oid = ?2"),
            params![repo_id, oid.as_str()],
            commit_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn commit_log(
        &self,
        repo_id: &str,
        ref_name: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<CommitRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COMMIT_COLUMNS}
             FROM ancestry a
             JOIN commits c ON c.repo_id = a.repo_id AND c.oid = a.commit_oid
             WHERE a.repo_id = ?1 AND a.ref_name = ?2
             ORDER BY a.depth
             LIMIT ?3 OFFSET ?4"
        ))?;

        let rows = stmt.query_map(params![repo_id, ref_name, limit, offset], commit_from_row)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn list_ancestry(&self, repo_id: &str, ref_name: &str) -> Result<Vec<AncestryEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT commit_oid, depth FROM ancestry
             WHERE repo_id = ?1 AND ref_name = ?2 ORDER BY depth",
        )?;

        let rows = stmt.query_map(params![repo_id, ref_name], |row| {
            Ok(AncestryEntry {
                commit_oid: oid_column(row, 0)?,
                depth: row.get(1)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn tree_listing(
        &self,
        repo_id: &str,
        root_tree_oid: &Oid,
        dir_path: &str,
    ) -> Result<Vec<TreeEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TREE_COLUMNS} FROM tree_entries
             WHERE repo_id = ?1 AND root_tree_oid = ?2 AND parent_path = ?3
             ORDER BY entry_type DESC, name"
        ))?;

        let rows = stmt.query_map(
            params![repo_id, root_tree_oid.as_str(), normalize_dir(dir_path)],
            tree_entry_from_row,
        )?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn tree_listing_at_commit(
        &self,
        repo_id: &str,
        commit_oid: &Oid,
        dir_path: &str,
    ) -> Result<Vec<TreeEntry>> {
        let commit = self.get_commit(repo_id, commit_oid)?.ok_or(Error::NotFound)?;
        self.tree_listing(repo_id, &commit.tree_oid, dir_path)
    }

    fn get_blob(&self, repo_id: &str, oid: &Oid) -> Result<Option<BlobRecord>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT oid, content, size, is_binary, is_truncated
             FROM blobs WHERE repo_id = ?1 AND oid = ?2",
            params![repo_id, oid.as_str()],
            |row| {
                Ok(BlobRecord {
                    oid: oid_column(row, 0)?,
                    content: row.get(1)?,
                    size: row.get(2)?,
                    is_binary: row.get(3)?,
                    is_truncated: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_commit_files(&self, repo_id: &str, commit_oid: &Oid) -> Result<Vec<CommitFile>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT commit_oid, path, change_type FROM commit_files
             WHERE repo_id = ?1 AND commit_oid = ?2 ORDER BY path",
        )?;

        let rows = stmt.query_map(params![repo_id, commit_oid.as_str()], |row| {
            Ok((oid_column(row, 0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;

        rows.map(|row| -> Result<CommitFile> {
            let (commit_oid, path, change_type) = row?;
            Ok(CommitFile {
                commit_oid,
                path,
                change_type: ChangeType::parse(&change_type)?,
            })
        })
        .collect()
    }

    fn last_commit_for_path(
        &self,
        repo_id: &str,
        ref_name: &str,
        path: &str,
    ) -> Result<Option<CommitRecord>> {
        let conn = self.conn();
        conn.query_row(
            &format!(
                "SELECT {COMMIT_COLUMNS}
                 FROM ancestry a
                 JOIN commit_files f ON f.repo_id = a.repo_id AND f.commit_oid = a.commit_oid
                 JOIN commits c ON c.repo_id = a.repo_id AND c.oid = a.commit_oid
                 WHERE a.repo_id = ?1 AND a.ref_name = ?2 AND f.path = ?3
                 ORDER BY a.depth
                 LIMIT 1"
            ),
            params![repo_id, ref_name, normalize_dir(path)],
            commit_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn search(&self, repo_id: &str, query: &str, limit: i64) -> Result<Vec<SearchHit>> {
        let query = fts_query(query);
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT blob_oid, path, snippet(blob_search, 3, '[', ']', '...', 16)
             FROM blob_search
             WHERE blob_search MATCH ?1 AND repo_id = ?2
             ORDER BY rank
             LIMIT ?3",
        )?;

        let rows = stmt.query_map(params![query, repo_id, limit], |row| {
            Ok(SearchHit {
                blob_oid: oid_column(row, 0)?,
                path: row.get(1)?,
                snippet: row.get(2)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }
}
