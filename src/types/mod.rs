mod index;
mod models;
mod permission;

pub use index::*;
pub use models::*;
pub use permission::PermissionLevel;
