use axum::http::{HeaderMap, StatusCode, header};

use crate::auth::{TokenValidationError, extract_token_from_header, validate_token};
use crate::engine::GitService;
use crate::server::access::{can_push, can_read, resolve_repo};
use crate::store::Store;
use crate::types::{Repository, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitAuthError {
    InvalidCredentials,
    TokenExpired,
    AuthRequired,
    RepoNotFound,
    PermissionDenied,
    InternalError,
}

impl GitAuthError {
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::InvalidCredentials | Self::TokenExpired | Self::AuthRequired => {
                StatusCode::UNAUTHORIZED
            }
            Self::PermissionDenied => StatusCode::FORBIDDEN,
            Self::RepoNotFound => StatusCode::NOT_FOUND,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::InvalidCredentials => "Invalid credentials",
            Self::TokenExpired => "Token expired",
            Self::AuthRequired => "Authentication required",
            Self::RepoNotFound => "Repository not found",
            Self::PermissionDenied => "Permission denied",
            Self::InternalError => "Internal server error",
        }
    }

    pub fn requires_auth_header(self) -> bool {
        self.status_code() == StatusCode::UNAUTHORIZED
    }
}

/// Resolves the caller from the `Authorization` header. No header means an
/// anonymous caller; a header that does not check out is an error.
pub fn authenticate(headers: &HeaderMap, store: &dyn Store) -> Result<Option<User>, GitAuthError> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let raw_token = match extract_token_from_header(auth_header) {
        Ok(Some(token)) => token,
        Ok(None) => return Ok(None),
        Err(_) => return Err(GitAuthError::InvalidCredentials),
    };

    let validated = validate_token(store, &raw_token).map_err(|e| match e {
        TokenValidationError::InvalidScheme | TokenValidationError::InvalidToken => {
            GitAuthError::InvalidCredentials
        }
        TokenValidationError::TokenExpired => GitAuthError::TokenExpired,
        TokenValidationError::InternalError => GitAuthError::InternalError,
    })?;

    Ok(Some(validated.user))
}

/// Finds the repository and checks the caller may run `service` on it.
pub fn authorize(
    store: &dyn Store,
    user: Option<&User>,
    owner: &str,
    repo_name: &str,
    service: GitService,
) -> Result<Repository, GitAuthError> {
    let (_, repo) = resolve_repo(store, owner, repo_name)
        .map_err(|e| {
            tracing::warn!("Repository lookup failed: {e}");
            GitAuthError::InternalError
        })?
        .ok_or(GitAuthError::RepoNotFound)?;

    let user_id = user.map(|u| u.id.as_str());
    let allowed = match (service, user_id) {
        (GitService::UploadPack, _) => can_read(store, user_id, &repo.id),
        (GitService::ReceivePack, Some(id)) => can_push(store, id, &repo.id),
        (GitService::ReceivePack, None) => Ok(false),
    }
    .map_err(|e| {
        tracing::warn!("Permission check failed: {e}");
        GitAuthError::InternalError
    })?;

    if allowed {
        Ok(repo)
    } else if user.is_none() {
        Err(GitAuthError::AuthRequired)
    } else {
        Err(GitAuthError::PermissionDenied)
    }
}
