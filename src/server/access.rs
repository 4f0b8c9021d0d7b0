//! Repository resolution and the read/push permission gate shared by both
//! transports. Every check is a fresh point lookup.

use crate::error::Result;
use crate::store::Store;
use crate::types::{Repository, User};

use super::validation::{strip_git_suffix, validate_repo_name};

/// Whether `user_id` (or an anonymous caller) may fetch from `repo_id`.
pub fn can_read(store: &dyn Store, user_id: Option<&str>, repo_id: &str) -> Result<bool> {
    let Some(repo) = store.get_repo_by_id(repo_id)? else {
        return Ok(false);
    };
    if repo.public {
        return Ok(true);
    }
    let Some(user_id) = user_id else {
        return Ok(false);
    };
    if repo.owner_id == user_id {
        return Ok(true);
    }
    Ok(store.get_collaborator(repo_id, user_id)?.is_some())
}

/// Whether `user_id` may push to `repo_id`. Read-level collaborators may not.
pub fn can_push(store: &dyn Store, user_id: &str, repo_id: &str) -> Result<bool> {
    let Some(repo) = store.get_repo_by_id(repo_id)? else {
        return Ok(false);
    };
    if repo.owner_id == user_id {
        return Ok(true);
    }
    Ok(store
        .get_collaborator(repo_id, user_id)?
        .is_some_and(|c| c.permission.can_push()))
}

/// Resolves `<owner>/<repo>` to its owner and repository rows. `None` covers
/// an unknown owner, an unknown repository and a malformed name alike.
pub fn resolve_repo(
    store: &dyn Store,
    owner: &str,
    repo_name: &str,
) -> Result<Option<(User, Repository)>> {
    let repo_name = strip_git_suffix(repo_name);
    if validate_repo_name(repo_name).is_err() {
        return Ok(None);
    }
    let Some(owner) = store.get_user_by_username(owner)? else {
        return Ok(None);
    };
    let repo = store.get_repo(&owner.id, repo_name)?;
    Ok(repo.map(|repo| (owner, repo)))
}
