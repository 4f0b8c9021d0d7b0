use std::str::FromStr;

use crate::engine::GitService;
use crate::error::{Error, Result};

/// A git exec request: `git-upload-pack '/owner/repo.git'`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCommand {
    pub service: GitService,
    pub owner: String,
    pub repo: String,
}

fn reject(raw: &str) -> Error {
    Error::BadRequest(format!("unsupported command: {raw}"))
}

/// Accepts `git-upload-pack` or `git-receive-pack` followed by a single
/// `owner/repo` path, optionally single-quoted, with an optional leading
/// slash and `.git` suffix. Anything else is refused.
pub fn parse_exec_command(raw: &str) -> Result<ExecCommand> {
    let (program, arg) = raw.trim().split_once(' ').ok_or_else(|| reject(raw))?;
    let service = GitService::from_str(program).map_err(|_| reject(raw))?;

    let arg = arg.trim();
    let path = match arg.strip_prefix('\'') {
        Some(rest) => rest.strip_suffix('\'').ok_or_else(|| reject(raw))?,
        None => arg,
    };
    if path.contains('\'') {
        return Err(reject(raw));
    }

    let path = path.strip_prefix('/').unwrap_or(path);
    let (owner, repo) = path.split_once('/').ok_or_else(|| reject(raw))?;
    let repo = repo.strip_suffix(".git").unwrap_or(repo);

    let well_formed = |s: &str| !s.is_empty() && !s.contains(['/', ' ', '\\']);
    if !well_formed(owner) || !well_formed(repo) {
        return Err(reject(raw));
    }

    Ok(ExecCommand {
        service,
        owner: owner.to_string(),
        repo: repo.to_string(),
    })
}
