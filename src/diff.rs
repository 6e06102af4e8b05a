//! Drift detection between desired and observed resources.
//!
//! Comparison only looks at fields declared in the desired object, so fields
//! defaulted or added by the cluster never show up as drift.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::manifest::{ManifestSet, Resource, ResourceKey};

#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    Create,
    /// Carries the paths of the declared fields which drifted.
    Update { drift: Vec<String> },
    Delete,
    NoOp,
}

impl SyncAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            SyncAction::Create => ActionKind::Create,
            SyncAction::Update { .. } => ActionKind::Update,
            SyncAction::Delete => ActionKind::Delete,
            SyncAction::NoOp => ActionKind::NoOp,
        }
    }
}

/// Payload-free form of [`SyncAction`], as recorded in sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Create,
    Update,
    Delete,
    NoOp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffEntry {
    /// The desired resource, or the live one for deletions.
    pub resource: Resource,
    pub action: SyncAction,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffReport {
    pub entries: Vec<DiffEntry>,
    /// Observed resources absent from the desired state which were left alone
    /// because pruning is disabled.
    pub orphans: Vec<ResourceKey>,
}

impl DiffReport {
    /// Entries which require a call against the cluster.
    pub fn changes(&self) -> impl Iterator<Item = &DiffEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.action != SyncAction::NoOp)
    }

    pub fn is_converged(&self) -> bool {
        self.changes().next().is_none()
    }

    pub fn count(&self, kind: ActionKind) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.action.kind() == kind)
            .count()
    }
}

/// Computes the actions which bring `observed` in line with `desired`.
///
/// Desired resources come first, in manifest order, followed by deletions in
/// key order. Deletions are only produced when `prune` is set; otherwise the
/// surplus resources are reported as orphans.
pub fn diff(desired: &ManifestSet, observed: &[Resource], prune: bool) -> DiffReport {
    let live: BTreeMap<&ResourceKey, &Resource> = observed
        .iter()
        .map(|resource| (resource.key(), resource))
        .collect();

    let mut report = DiffReport::default();

    for resource in desired.resources() {
        let action = match live.get(resource.key()) {
            None => SyncAction::Create,
            Some(current) => {
                let drift = drift(resource.body(), current.body());
                if drift.is_empty() {
                    SyncAction::NoOp
                } else {
                    SyncAction::Update { drift }
                }
            }
        };

        report.entries.push(DiffEntry {
            resource: resource.clone(),
            action,
        });
    }

    let wanted: HashSet<&ResourceKey> = desired.resources().iter().map(Resource::key).collect();
    for (key, resource) in live {
        if wanted.contains(key) {
            continue;
        }

        if prune {
            report.entries.push(DiffEntry {
                resource: resource.clone(),
                action: SyncAction::Delete,
            });
        } else {
            report.orphans.push(key.clone());
        }
    }

    report
}

/// Paths of the fields declared in `desired` whose live value differs.
pub fn drift(desired: &Value, live: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    collect_drift(desired, live, String::new(), &mut paths);
    paths
}

fn collect_drift(desired: &Value, live: &Value, path: String, paths: &mut Vec<String>) {
    match (desired, live) {
        (Value::Object(wanted), Value::Object(current)) => {
            for (field, value) in wanted {
                let path = format!("{path}.{field}");
                match current.get(field) {
                    Some(current) => collect_drift(value, current, path, paths),
                    // A declared null asks for the field to be unset.
                    None if value.is_null() => {}
                    None => paths.push(path),
                }
            }
        }
        (Value::Array(wanted), Value::Array(current)) if wanted.len() == current.len() => {
            for (index, (value, current)) in wanted.iter().zip(current).enumerate() {
                collect_drift(value, current, format!("{path}[{index}]"), paths);
            }
        }
        (Value::Number(wanted), Value::Number(current)) => {
            if wanted != current && wanted.as_f64() != current.as_f64() {
                paths.push(root(path));
            }
        }
        (wanted, current) => {
            if wanted != current {
                paths.push(root(path));
            }
        }
    }
}

fn root(path: String) -> String {
    if path.is_empty() {
        ".".to_string()
    } else {
        path
    }
}
