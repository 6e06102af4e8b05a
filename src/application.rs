use std::fmt;

use serde::{Deserialize, Serialize};

/// Where an application's desired state lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub repository: String,
    #[serde(default)]
    pub path: String,
    pub revision: String,
}

impl SourceRef {
    pub fn new(
        repository: impl Into<String>,
        path: impl Into<String>,
        revision: impl Into<String>,
    ) -> Self {
        SourceRef {
            repository: repository.into(),
            path: path.into(),
            revision: revision.into(),
        }
    }

    /// Repository and path, without the revision.
    pub fn location(&self) -> String {
        if self.path.is_empty() {
            self.repository.clone()
        } else {
            format!("{}/{}", self.repository.trim_end_matches('/'), self.path)
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.location(), self.revision)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub cluster: String,
    pub namespace: String,
}

impl Destination {
    pub fn new(cluster: impl Into<String>, namespace: impl Into<String>) -> Self {
        Destination {
            cluster: cluster.into(),
            namespace: namespace.into(),
        }
    }
}

/// Controls when an application is synced and whether orphans are deleted.
///
/// `self_heal` only has an effect together with `automated`: without
/// automation an application is exclusively synced on explicit triggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
    pub automated: bool,
    pub prune: bool,
    pub self_heal: bool,
}

impl SyncPolicy {
    pub fn manual() -> Self {
        SyncPolicy::default()
    }

    pub fn automated() -> Self {
        SyncPolicy {
            automated: true,
            ..SyncPolicy::default()
        }
    }

    pub fn with_prune(mut self, prune: bool) -> Self {
        self.prune = prune;
        self
    }

    pub fn with_self_heal(mut self, self_heal: bool) -> Self {
        self.self_heal = self_heal;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    pub source: SourceRef,
    pub destination: Destination,
    #[serde(default)]
    pub policy: SyncPolicy,
}

impl Application {
    pub fn new(name: impl Into<String>, source: SourceRef, destination: Destination) -> Self {
        Application {
            name: name.into(),
            source,
            destination,
            policy: SyncPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Last known connectivity of a cluster, as seen by the client pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterHealth {
    #[default]
    Unknown,
    Reachable,
    Unreachable,
    AuthRejected,
}

/// A registered target cluster.
///
/// `context` names the kubeconfig context holding the credentials, while
/// `endpoint` optionally overrides the API server URL from that context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTarget {
    pub name: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(skip)]
    pub health: ClusterHealth,
}

impl ClusterTarget {
    pub fn new(name: impl Into<String>) -> Self {
        ClusterTarget {
            name: name.into(),
            endpoint: None,
            context: None,
            health: ClusterHealth::Unknown,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}
