//! Derives the queryable index from repository mutations.
//!
//! A push is observed as two ref snapshots. [`diff_snapshots`] turns them
//! into [`RefChange`](crate::types::RefChange)s and the
//! [`IncrementalIndexer`] applies each change. [`IndexTrigger`] ties the two
//! to the transport layer.

mod incremental;
mod snapshot;
mod trigger;

pub use incremental::{ApplyOutcome, IncrementalIndexer};
pub use snapshot::{RefSnapshot, diff_snapshots, take_snapshot};
pub use trigger::{IndexTrigger, PendingPush};
