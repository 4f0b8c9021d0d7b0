use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Access level granted to a repository collaborator.
///
/// Levels are ordered: admin implies write implies read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Read,
    Write,
    Admin,
}

impl PermissionLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Admin => "admin",
        }
    }

    /// Returns true if this level allows pushing new history.
    #[must_use]
    pub const fn can_push(self) -> bool {
        matches!(self, Self::Write | Self::Admin)
    }
}

impl FromStr for PermissionLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "admin" => Ok(Self::Admin),
            other => Err(Error::InvalidPermission(other.to_string())),
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_permission() {
        assert_eq!("read".parse::<PermissionLevel>().unwrap(), PermissionLevel::Read);
        assert_eq!("admin".parse::<PermissionLevel>().unwrap(), PermissionLevel::Admin);
        assert!("owner".parse::<PermissionLevel>().is_err());
    }

    #[test]
    fn test_can_push() {
        assert!(!PermissionLevel::Read.can_push());
        assert!(PermissionLevel::Write.can_push());
        assert!(PermissionLevel::Admin.can_push());
    }

    #[test]
    fn test_levels_are_ordered() {
        assert!(PermissionLevel::Admin > PermissionLevel::Write);
        assert!(PermissionLevel::Write > PermissionLevel::Read);
    }
}
