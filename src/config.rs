//! Fleet configuration file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::{Application, ClusterTarget};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed fleet configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid fleet configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub clusters: Vec<ClusterTarget>,
    #[serde(default)]
    pub applications: Vec<Application>,
    #[serde(default)]
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Time between two timer ticks.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Upper bound on cycles running at the same time, across all applications.
    pub max_concurrent_syncs: usize,
    pub retry: RetryPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            interval: Duration::from_secs(180),
            max_concurrent_syncs: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// Exponential backoff for retryable failures within a single cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry`, counting from zero.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl FleetConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut clusters = HashSet::new();
        for cluster in &self.clusters {
            if !clusters.insert(cluster.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "cluster {} is declared more than once",
                    cluster.name
                )));
            }
        }

        let mut applications = HashSet::new();
        for application in &self.applications {
            if !applications.insert(application.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "application {} is declared more than once",
                    application.name
                )));
            }
            if !clusters.contains(application.destination.cluster.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "application {} targets unknown cluster {}",
                    application.name, application.destination.cluster
                )));
            }
        }

        if self.sync.max_concurrent_syncs == 0 {
            return Err(ConfigError::Invalid(
                "sync.max_concurrent_syncs must be at least 1".to_string(),
            ));
        }
        if self.sync.retry.attempts == 0 {
            return Err(ConfigError::Invalid(
                "sync.retry.attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fleet_file() {
        let config = FleetConfig::from_yaml(indoc::indoc! {r#"
            clusters:
              - name: kind-east
                context: kind-east
              - name: kind-west
                context: kind-west
                endpoint: https://127.0.0.1:6443
            applications:
              - name: guestbook
                source:
                  repository: /srv/gitops
                  path: apps/guestbook
                  revision: main
                destination:
                  cluster: kind-east
                  namespace: guestbook
                policy:
                  automated: true
                  self_heal: true
            sync:
              interval: 30s
              retry:
                attempts: 5
        "#})
        .unwrap();

        assert_eq!(config.clusters.len(), 2);
        assert_eq!(
            config.clusters[1],
            ClusterTarget::new("kind-west")
                .with_context("kind-west")
                .with_endpoint("https://127.0.0.1:6443")
        );

        let guestbook = &config.applications[0];
        assert!(guestbook.policy.automated);
        assert!(guestbook.policy.self_heal);
        assert!(!guestbook.policy.prune);

        assert_eq!(config.sync.interval, Duration::from_secs(30));
        assert_eq!(config.sync.max_concurrent_syncs, 4);
        assert_eq!(config.sync.retry.attempts, 5);
        assert_eq!(config.sync.retry.initial_backoff, Duration::from_secs(1));
    }

    #[test]
    fn rejects_unknown_clusters() {
        let error = FleetConfig::from_yaml(indoc::indoc! {r#"
            clusters:
              - name: kind-east
            applications:
              - name: guestbook
                source: { repository: /srv/gitops, revision: main }
                destination: { cluster: kind-west, namespace: default }
        "#})
        .unwrap_err();

        assert_eq!(
            error.to_string(),
            "invalid fleet configuration: application guestbook targets unknown cluster kind-west"
        );
    }

    #[test]
    fn rejects_duplicate_clusters() {
        let error = FleetConfig::from_yaml(indoc::indoc! {r#"
            clusters:
              - name: kind-east
              - name: kind-east
        "#})
        .unwrap_err();

        assert!(matches!(error, ConfigError::Invalid(_)));
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let retry = RetryPolicy {
            attempts: 10,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(3),
        };

        assert_eq!(retry.backoff(0), Duration::from_millis(500));
        assert_eq!(retry.backoff(1), Duration::from_secs(1));
        assert_eq!(retry.backoff(2), Duration::from_secs(2));
        assert_eq!(retry.backoff(3), Duration::from_secs(3));
        assert_eq!(retry.backoff(40), Duration::from_secs(3));
    }
}
