use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::application::Application;
use crate::diff::ActionKind;
use crate::error::FailureReason;
use crate::manifest::{ResourceKey, ResourceKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    /// Registered but never synced.
    #[default]
    Idle,
    Syncing,
    Synced,
    Degraded,
}

/// What started a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Timer,
    Explicit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub resource: Option<ResourceKey>,
    pub reason: FailureReason,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub key: ResourceKey,
    pub action: ActionKind,
    /// Set when the action failed.
    pub failure: Option<FailureReason>,
}

/// Kinds and namespaces which may still hold live objects owned by an
/// application, so that later cycles keep observing them after they drop out
/// of the desired state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Footprint {
    pub kinds: BTreeSet<ResourceKind>,
    pub namespaces: BTreeSet<String>,
}

impl Footprint {
    pub fn track(&mut self, key: &ResourceKey) {
        if !self.kinds.contains(&key.kind) {
            self.kinds.insert(key.kind.clone());
        }
        if let Some(namespace) = &key.namespace {
            if !self.namespaces.contains(namespace) {
                self.namespaces.insert(namespace.clone());
            }
        }
    }
}

/// Everything a finished cycle learned, committed into [`SyncState`] at once.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub revision: Option<String>,
    pub resources: Vec<ResourceStatus>,
    pub orphans: Vec<ResourceKey>,
    pub failures: Vec<Failure>,
    pub managed: Option<Footprint>,
}

impl CycleReport {
    /// Records a cancellation which arrived after the last step checked for it.
    pub fn mark_cancelled(&mut self) {
        if self.is_cancelled() {
            return;
        }

        self.failures.push(Failure {
            resource: None,
            reason: FailureReason::Cancelled,
            message: "cancelled before the cycle could commit".to_string(),
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.failures
            .iter()
            .any(|failure| failure.reason == FailureReason::Cancelled)
    }
}

/// Per-application record of the last sync. Only the reconciler writes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub phase: SyncPhase,
    /// Revision requested by the most recent cycle, whether or not it resolved.
    pub attempted_revision: Option<String>,
    /// Revision of the manifests the most recent successful fetch returned.
    pub observed_revision: Option<String>,
    pub degraded_reason: Option<FailureReason>,
    pub resources: Vec<ResourceStatus>,
    pub orphans: Vec<ResourceKey>,
    pub failures: Vec<Failure>,
    /// Where this application may still own live objects.
    pub managed: Footprint,
    pub cycles: u64,
}

impl SyncState {
    /// Decides whether a timer tick starts a cycle for `application`.
    ///
    /// Without self-heal a degraded application is only ever retried on an
    /// explicit trigger. With self-heal, fatal failures still wait for a new
    /// revision.
    pub fn wants_tick(&self, application: &Application) -> bool {
        let policy = application.policy;
        if !policy.automated {
            return false;
        }

        let revision_changed =
            self.attempted_revision.as_deref() != Some(application.source.revision.as_str());

        match self.phase {
            SyncPhase::Idle => true,
            SyncPhase::Syncing => false,
            SyncPhase::Synced => policy.self_heal || revision_changed,
            SyncPhase::Degraded => {
                let fatal = self.degraded_reason.is_some_and(FailureReason::is_fatal);
                policy.self_heal && (revision_changed || !fatal)
            }
        }
    }

    pub fn begin(&mut self, revision: &str) {
        self.phase = SyncPhase::Syncing;
        self.attempted_revision = Some(revision.to_string());
        self.cycles += 1;
    }

    pub fn commit(&mut self, report: CycleReport) {
        if let Some(revision) = report.revision {
            self.observed_revision = Some(revision);
        }
        if let Some(managed) = report.managed {
            self.managed = managed;
        }

        // A cancelled cycle reports as cancelled, whatever failed before.
        self.degraded_reason = report
            .failures
            .iter()
            .find(|failure| failure.reason == FailureReason::Cancelled)
            .or(report.failures.first())
            .map(|failure| failure.reason);
        self.phase = match self.degraded_reason {
            Some(_) => SyncPhase::Degraded,
            None => SyncPhase::Synced,
        };
        self.resources = report.resources;
        self.orphans = report.orphans;
        self.failures = report.failures;
    }

    pub fn is_degraded(&self) -> bool {
        self.phase == SyncPhase::Degraded
    }
}
