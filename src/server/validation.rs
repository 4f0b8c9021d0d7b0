use crate::error::{Error, Result};

const MAX_USERNAME_LEN: usize = 64;
const MAX_REPO_NAME_LEN: usize = 100;

fn is_valid_name_char(c: char, allow_period: bool) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || (allow_period && c == '.')
}

fn validate_name(
    name: &str,
    entity: &str,
    max_len: usize,
    allow_period: bool,
    forbid_leading_special: bool,
) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err(format!("{entity} name cannot be empty"));
    }
    if name.len() > max_len {
        return Err(format!("{entity} name cannot exceed {max_len} characters"));
    }
    if !name.chars().all(|c| is_valid_name_char(c, allow_period)) {
        let mut allowed = "alphanumeric characters, hyphens, and underscores".to_string();
        if allow_period {
            allowed.push_str(", and periods");
        }
        return Err(format!("{entity} name can only contain {allowed}"));
    }
    if forbid_leading_special && (name.starts_with('-') || name.starts_with('_')) {
        return Err(format!(
            "{entity} name cannot start with a hyphen or underscore"
        ));
    }
    if allow_period && (name == "." || name == "..") {
        return Err(format!("{entity} name cannot be a relative path"));
    }
    Ok(())
}

pub fn validate_username(name: &str) -> Result<()> {
    validate_name(name, "User", MAX_USERNAME_LEN, false, true).map_err(Error::BadRequest)
}

pub fn validate_repo_name(name: &str) -> Result<()> {
    validate_name(name, "Repository", MAX_REPO_NAME_LEN, true, true).map_err(Error::BadRequest)
}

/// Drops a trailing `.git` from a repository path segment.
#[must_use]
pub fn strip_git_suffix(name: &str) -> &str {
    name.strip_suffix(".git").unwrap_or(name)
}
