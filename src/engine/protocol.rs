use std::fmt;
use std::str::FromStr;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitService {
    UploadPack,
    ReceivePack,
}

impl GitService {
    /// Name as it appears in `?service=` and in SSH exec commands.
    #[must_use]
    pub const fn command_name(self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    /// The `git` subcommand implementing the service.
    #[must_use]
    pub const fn subcommand(self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }

    #[must_use]
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-result",
            Self::ReceivePack => "application/x-git-receive-pack-result",
        }
    }

    #[must_use]
    pub const fn advertisement_content_type(self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-advertisement",
            Self::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::ReceivePack)
    }
}

impl FromStr for GitService {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "git-upload-pack" => Ok(Self::UploadPack),
            "git-receive-pack" => Ok(Self::ReceivePack),
            other => Err(Error::BadRequest(format!("unsupported service: {other}"))),
        }
    }
}

impl fmt::Display for GitService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command_name())
    }
}

/// How the protocol process talks to its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolMode {
    /// Full bidirectional conversation over one connection (SSH).
    Interactive,
    /// Smart HTTP `info/refs`: print the ref advertisement and exit.
    Advertise,
    /// Smart HTTP POST: one request, one response.
    StatelessRpc,
}

/// Prefix for a smart HTTP ref advertisement:
/// `<len># service=<name>\n` followed by a flush packet.
#[must_use]
pub fn format_pkt_line_header(service: GitService) -> Vec<u8> {
    let service_line = format!("# service={}\n", service.command_name());
    let length = service_line.len() + 4;
    let mut result = format!("{length:04x}{service_line}").into_bytes();
    result.extend_from_slice(b"0000");
    result
}
