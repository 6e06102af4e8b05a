//! [`ClusterClient`] backed by a live Kubernetes API server.

use std::collections::HashMap;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::config::KubeConfigOptions;
use kube::core::GroupVersionKind;
use kube::discovery::{pinned_kind, ApiCapabilities, ApiResource, Scope};
use kube::{Client, Config};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::application::ClusterTarget;
use crate::cluster::ClusterClient;
use crate::error::SyncError;
use crate::manifest::{Resource, ResourceKey, ResourceKind, ResourceScope};
use crate::reconciliation::CONTROLLER_NAME;

pub struct KubeClusterClient {
    cluster: String,
    client: Client,
    /// Discovery results, resolved lazily per kind.
    resources: Mutex<HashMap<ResourceKind, (ApiResource, ApiCapabilities)>>,
}

impl KubeClusterClient {
    /// Builds a client for `target` from the local kubeconfig, falling back
    /// to the in-cluster environment when no context is named.
    pub async fn connect(target: &ClusterTarget) -> Result<Self, SyncError> {
        let unreachable = |reason: String| SyncError::Unreachable {
            cluster: target.name.clone(),
            reason,
        };

        let mut config = match &target.context {
            Some(context) => {
                let options = KubeConfigOptions {
                    context: Some(context.clone()),
                    ..KubeConfigOptions::default()
                };
                Config::from_kubeconfig(&options)
                    .await
                    .map_err(|e| unreachable(e.to_string()))?
            }
            None => Config::infer()
                .await
                .map_err(|e| unreachable(e.to_string()))?,
        };

        if let Some(endpoint) = &target.endpoint {
            config.cluster_url = endpoint
                .parse()
                .map_err(|e| unreachable(format!("invalid endpoint {endpoint}: {e}")))?;
        }

        info!("connecting to cluster {} at {}", target.name, config.cluster_url);
        let client = Client::try_from(config).map_err(|e| unreachable(e.to_string()))?;

        Ok(KubeClusterClient {
            cluster: target.name.clone(),
            client,
            resources: Mutex::new(HashMap::new()),
        })
    }

    async fn resolve(
        &self,
        kind: &ResourceKind,
    ) -> Result<(ApiResource, ApiCapabilities), SyncError> {
        let mut resources = self.resources.lock().await;
        if let Some(resolved) = resources.get(kind) {
            return Ok(resolved.clone());
        }

        let (group, version) = kind.group_version();
        let gvk = GroupVersionKind::gvk(group, version, &kind.kind);
        let resolved = pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| classify(&self.cluster, &kind.to_string(), e))?;

        debug!("resolved {kind} to resource {}", resolved.0.plural);
        resources.insert(kind.clone(), resolved.clone());
        Ok(resolved)
    }

    async fn api(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>, SyncError> {
        let (resource, capabilities) = self.resolve(kind).await?;

        Ok(match (capabilities.scope, namespace) {
            (Scope::Namespaced, Some(namespace)) => {
                Api::namespaced_with(self.client.clone(), namespace, &resource)
            }
            (Scope::Namespaced, None) => {
                Api::default_namespaced_with(self.client.clone(), &resource)
            }
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), &resource),
        })
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn observed(
        &self,
        namespace: &str,
        kind: &ResourceKind,
    ) -> Result<Vec<Resource>, SyncError> {
        let api = self.api(kind, Some(namespace)).await?;
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| classify(&self.cluster, &kind.to_string(), e))?;

        list.items
            .into_iter()
            .map(|object| {
                let mut body = serde_json::to_value(&object).map_err(|e| SyncError::Rejected {
                    resource: kind.to_string(),
                    reason: e.to_string(),
                })?;

                // List items come back without their type information.
                if let Value::Object(fields) = &mut body {
                    fields.insert(
                        "apiVersion".to_string(),
                        Value::from(kind.api_version.as_str()),
                    );
                    fields.insert("kind".to_string(), Value::from(kind.kind.as_str()));
                }

                Resource::from_value(body).map_err(|reason| SyncError::Rejected {
                    resource: kind.to_string(),
                    reason,
                })
            })
            .collect()
    }

    async fn apply(&self, resource: &Resource) -> Result<(), SyncError> {
        let key = resource.key();
        let api = self.api(&key.kind, key.namespace.as_deref()).await?;

        api.patch(
            &key.name,
            &PatchParams::apply(CONTROLLER_NAME).force(),
            &Patch::Apply(resource.body()),
        )
        .await
        .map_err(|e| classify(&self.cluster, &key.to_string(), e))?;

        Ok(())
    }

    async fn prune(&self, key: &ResourceKey) -> Result<(), SyncError> {
        let api = self.api(&key.kind, key.namespace.as_deref()).await?;

        match api.delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!("{key} was already gone");
                Ok(())
            }
            Err(e) => Err(classify(&self.cluster, &key.to_string(), e)),
        }
    }

    async fn scope(&self, kind: &ResourceKind) -> Result<ResourceScope, SyncError> {
        let (_, capabilities) = self.resolve(kind).await?;

        Ok(match capabilities.scope {
            Scope::Cluster => ResourceScope::Cluster,
            Scope::Namespaced => ResourceScope::Namespaced,
        })
    }

    async fn probe(&self) -> Result<(), SyncError> {
        let version = self
            .client
            .apiserver_version()
            .await
            .map_err(|e| classify(&self.cluster, "version", e))?;

        debug!("cluster {} runs {}", self.cluster, version.git_version);
        Ok(())
    }
}

/// Maps an API error onto the failure kinds the reconciler acts on.
fn classify(cluster: &str, resource: &str, error: kube::Error) -> SyncError {
    match error {
        kube::Error::Api(response) => match response.code {
            401 | 403 => SyncError::AuthRejected {
                cluster: cluster.to_string(),
                reason: response.message,
            },
            409 => SyncError::ApplyConflict {
                resource: resource.to_string(),
                reason: response.message,
            },
            code if code >= 500 => SyncError::Unreachable {
                cluster: cluster.to_string(),
                reason: response.message,
            },
            _ => SyncError::Rejected {
                resource: resource.to_string(),
                reason: response.message,
            },
        },
        kube::Error::Discovery(e) => SyncError::Rejected {
            resource: resource.to_string(),
            reason: e.to_string(),
        },
        other => SyncError::Unreachable {
            cluster: cluster.to_string(),
            reason: other.to_string(),
        },
    }
}
