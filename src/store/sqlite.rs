use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::Store;
use super::schema::SCHEMA;
use crate::error::{Error, Result};
use crate::types::*;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(super) fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns a guard to the underlying database connection.
    /// This allows consuming applications to execute custom SQL.
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn()
    }
}

pub(super) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

pub(super) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Maps a stored hex id back into an `Oid`, surfacing corruption as a
/// conversion failure on the offending column.
pub(super) fn oid_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Oid> {
    let raw: String = row.get(idx)?;
    Oid::parse(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        created_at: parse_datetime(&row.get::<_, String>(2)?),
    })
}

fn ssh_key_from_row(row: &Row<'_>) -> rusqlite::Result<SshKey> {
    Ok(SshKey {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        key_type: row.get(3)?,
        key_blob: row.get(4)?,
        fingerprint: row.get(5)?,
        created_at: parse_datetime(&row.get::<_, String>(6)?),
    })
}

fn repo_from_row(row: &Row<'_>) -> rusqlite::Result<Repository> {
    Ok(Repository {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        path: PathBuf::from(row.get::<_, String>(3)?),
        default_branch: row.get(4)?,
        public: row.get(5)?,
        created_at: parse_datetime(&row.get::<_, String>(6)?),
        updated_at: parse_datetime(&row.get::<_, String>(7)?),
    })
}

const REPO_COLUMNS: &str =
    "id, owner_id, name, path, default_branch, public, created_at, updated_at";

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    // User operations

    fn create_user(&self, user: &User) -> Result<()> {
        let result = self.conn().execute(
            "INSERT INTO users (id, username, created_at) VALUES (?1, ?2, ?3)",
            params![user.id, user.username, format_datetime(&user.created_at)],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::AlreadyExists)
            }
            Err(e) => Err(Error::from(e)),
        }
    }

    fn get_user(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, username, created_at FROM users WHERE id = ?1",
            params![id],
            user_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, username, created_at FROM users WHERE username = ?1",
            params![username],
            user_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    // SSH key operations

    fn create_ssh_key(&self, key: &SshKey) -> Result<()> {
        let result = self.conn().execute(
            "INSERT INTO ssh_keys (id, user_id, title, key_type, key_blob, fingerprint, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                key.id,
                key.user_id,
                key.title,
                key.key_type,
                key.key_blob,
                key.fingerprint,
                format_datetime(&key.created_at),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::AlreadyExists)
            }
            Err(e) => Err(Error::from(e)),
        }
    }

    fn list_ssh_keys(&self) -> Result<Vec<SshKey>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, title, key_type, key_blob, fingerprint, created_at
             FROM ssh_keys ORDER BY created_at, id",
        )?;

        let rows = stmt.query_map([], ssh_key_from_row)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn list_user_ssh_keys(&self, user_id: &str) -> Result<Vec<SshKey>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, title, key_type, key_blob, fingerprint, created_at
             FROM ssh_keys WHERE user_id = ?1 ORDER BY created_at, id",
        )?;

        let rows = stmt.query_map(params![user_id], ssh_key_from_row)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // Token operations

    fn create_token(&self, token: &Token) -> Result<()> {
        let result = self.conn().execute(
            "INSERT INTO tokens (id, token_hash, token_lookup, user_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                token.id,
                token.token_hash,
                token.token_lookup,
                token.user_id,
                format_datetime(&token.created_at),
                token.expires_at.as_ref().map(format_datetime),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::TokenLookupCollision)
            }
            Err(e) => Err(Error::from(e)),
        }
    }

    fn get_token_by_lookup(&self, lookup: &str) -> Result<Option<Token>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, token_hash, token_lookup, user_id, created_at, expires_at, last_used_at
             FROM tokens WHERE token_lookup = ?1",
            params![lookup],
            |row| {
                Ok(Token {
                    id: row.get(0)?,
                    token_hash: row.get(1)?,
                    token_lookup: row.get(2)?,
                    user_id: row.get(3)?,
                    created_at: parse_datetime(&row.get::<_, String>(4)?),
                    expires_at: row.get::<_, Option<String>>(5)?.map(|s| parse_datetime(&s)),
                    last_used_at: row.get::<_, Option<String>>(6)?.map(|s| parse_datetime(&s)),
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    fn update_token_last_used(&self, id: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE tokens SET last_used_at = ?1 WHERE id = ?2",
            params![format_datetime(&Utc::now()), id],
        )?;
        Ok(())
    }

    // Repo operations

    fn create_repo(&self, repo: &Repository) -> Result<()> {
        let result = self.conn().execute(
            "INSERT INTO repos (id, owner_id, name, path, default_branch, public, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                repo.id,
                repo.owner_id,
                repo.name,
                repo.path.to_string_lossy(),
                repo.default_branch,
                repo.public,
                format_datetime(&repo.created_at),
                format_datetime(&repo.updated_at),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::AlreadyExists)
            }
            Err(e) => Err(Error::from(e)),
        }
    }

    fn get_repo(&self, owner_id: &str, name: &str) -> Result<Option<Repository>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {REPO_COLUMNS} FROM repos WHERE owner_id = ?1 AND name = ?2"),
            params![owner_id, name],
            repo_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn get_repo_by_id(&self, id: &str) -> Result<Option<Repository>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {REPO_COLUMNS} FROM repos WHERE id = ?1"),
            params![id],
            repo_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn set_repo_public(&self, id: &str, public: bool) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE repos SET public = ?1, updated_at = ?2 WHERE id = ?3",
            params![public, format_datetime(&Utc::now()), id],
        )?;

        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    // Collaborator operations

    fn upsert_collaborator(&self, collaborator: &Collaborator) -> Result<()> {
        self.conn().execute(
            "INSERT INTO collaborators (repo_id, user_id, permission, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (repo_id, user_id) DO UPDATE SET
                permission = excluded.permission",
            params![
                collaborator.repo_id,
                collaborator.user_id,
                collaborator.permission.as_str(),
                format_datetime(&collaborator.created_at),
            ],
        )?;
        Ok(())
    }

    fn get_collaborator(&self, repo_id: &str, user_id: &str) -> Result<Option<Collaborator>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT repo_id, user_id, permission, created_at
                 FROM collaborators WHERE repo_id = ?1 AND user_id = ?2",
                params![repo_id, user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(repo_id, user_id, permission, created_at)| -> Result<Collaborator> {
            Ok(Collaborator {
                repo_id,
                user_id,
                permission: permission.parse()?,
                created_at: parse_datetime(&created_at),
            })
        })
        .transpose()
    }

    fn delete_collaborator(&self, repo_id: &str, user_id: &str) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM collaborators WHERE repo_id = ?1 AND user_id = ?2",
            params![repo_id, user_id],
        )?;
        Ok(rows > 0)
    }
}
