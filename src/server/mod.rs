pub mod access;
mod git;
pub mod relay;
mod router;
pub mod ssh;
pub mod validation;

pub use access::{can_push, can_read, resolve_repo};
pub use git::git_router;
pub use relay::{ProcessRelay, RelaySink, RelayState};
pub use router::{AppState, create_router};
pub use ssh::SshServer;
