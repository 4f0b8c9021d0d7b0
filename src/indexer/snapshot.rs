use std::collections::BTreeMap;
use std::path::Path;

use crate::engine::VersionControlEngine;
use crate::error::Result;
use crate::types::{Oid, RefChange, RefKind};

/// Ref name to peeled commit id at one instant.
pub type RefSnapshot = BTreeMap<String, Oid>;

pub fn take_snapshot(engine: &dyn VersionControlEngine, repo: &Path) -> Result<RefSnapshot> {
    Ok(engine
        .list_refs(repo)?
        .into_iter()
        .map(|tip| (tip.name, tip.oid))
        .collect())
}

/// One change per ref whose oid differs between the snapshots.
///
/// Created refs carry no old oid, deleted refs carry the zero oid as their
/// new value. Fast-forwards and forced updates look the same. Refs outside
/// branches and tags are ignored.
#[must_use]
pub fn diff_snapshots(before: &RefSnapshot, after: &RefSnapshot) -> Vec<RefChange> {
    let mut changes = Vec::new();

    for (name, new_oid) in after {
        let old_oid = before.get(name);
        if old_oid == Some(new_oid) {
            continue;
        }
        let Some(kind) = RefKind::from_ref_name(name) else {
            continue;
        };
        changes.push(RefChange {
            ref_name: name.clone(),
            kind,
            old_oid: old_oid.cloned(),
            new_oid: new_oid.clone(),
        });
    }

    for (name, old_oid) in before {
        if after.contains_key(name) {
            continue;
        }
        let Some(kind) = RefKind::from_ref_name(name) else {
            continue;
        };
        changes.push(RefChange {
            ref_name: name.clone(),
            kind,
            old_oid: Some(old_oid.clone()),
            new_oid: Oid::zero(),
        });
    }

    changes
}
