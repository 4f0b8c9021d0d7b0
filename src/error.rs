use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("git error: {0}")]
    Engine(#[from] git2::Error),

    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("ssh key error: {0}")]
    Keys(#[from] russh_keys::Error),

    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("token lookup collision")]
    TokenLookupCollision,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid token format")]
    InvalidTokenFormat,

    #[error("invalid object id: {0}")]
    InvalidOid(String),

    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("git command failed: {0}")]
    Git(String),

    #[error("invalid permission: {0}")]
    InvalidPermission(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;
