//! Cluster client pool: one independent connection per registered cluster.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::application::{ClusterHealth, ClusterTarget};
use crate::error::{RegistryError, SyncError};
use crate::manifest::{Resource, ResourceKey, ResourceKind, ResourceScope};

/// Declarative read/apply/delete access to a single cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Lists live resources of `kind`. Cluster-scoped kinds ignore `namespace`.
    async fn observed(&self, namespace: &str, kind: &ResourceKind)
        -> Result<Vec<Resource>, SyncError>;

    async fn apply(&self, resource: &Resource) -> Result<(), SyncError>;

    /// Deletes a live resource. Deleting something already gone succeeds.
    async fn prune(&self, key: &ResourceKey) -> Result<(), SyncError>;

    /// Whether `kind` is namespaced on this cluster.
    async fn scope(&self, kind: &ResourceKind) -> Result<ResourceScope, SyncError>;

    async fn probe(&self) -> Result<(), SyncError>;
}

struct Member {
    target: ClusterTarget,
    client: Arc<dyn ClusterClient>,
}

/// Registered clusters and their clients.
///
/// The pool lock only guards membership and health and is never held across
/// a call into a client, so a slow cluster cannot stall any other.
#[derive(Default)]
pub struct ClusterPool {
    members: RwLock<BTreeMap<String, Member>>,
}

impl ClusterPool {
    pub fn new() -> Self {
        ClusterPool::default()
    }

    pub fn register(
        &self,
        target: ClusterTarget,
        client: Arc<dyn ClusterClient>,
    ) -> Result<(), RegistryError> {
        let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
        if members.contains_key(&target.name) {
            return Err(RegistryError::DuplicateCluster(target.name));
        }

        info!("registered cluster {}", target.name);
        members.insert(target.name.clone(), Member { target, client });
        Ok(())
    }

    /// Removes a cluster, returning whether it was registered.
    pub fn deregister(&self, name: &str) -> bool {
        self.members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn target(&self, name: &str) -> Option<ClusterTarget> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|member| member.target.clone())
    }

    pub fn list(&self) -> Vec<ClusterTarget> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|member| member.target.clone())
            .collect()
    }

    fn client(&self, cluster: &str) -> Result<Arc<dyn ClusterClient>, SyncError> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cluster)
            .map(|member| member.client.clone())
            .ok_or_else(|| SyncError::Unreachable {
                cluster: cluster.to_string(),
                reason: "cluster is not registered".to_string(),
            })
    }

    pub async fn observed(
        &self,
        cluster: &str,
        namespace: &str,
        kind: &ResourceKind,
    ) -> Result<Vec<Resource>, SyncError> {
        let result = self.client(cluster)?.observed(namespace, kind).await;
        self.record(cluster, &result);
        result
    }

    pub async fn apply(&self, cluster: &str, resource: &Resource) -> Result<(), SyncError> {
        let result = self.client(cluster)?.apply(resource).await;
        self.record(cluster, &result);
        result
    }

    pub async fn prune(&self, cluster: &str, key: &ResourceKey) -> Result<(), SyncError> {
        let result = self.client(cluster)?.prune(key).await;
        self.record(cluster, &result);
        result
    }

    pub async fn scope(
        &self,
        cluster: &str,
        kind: &ResourceKind,
    ) -> Result<ResourceScope, SyncError> {
        let result = self.client(cluster)?.scope(kind).await;
        self.record(cluster, &result);
        result
    }

    pub async fn probe(&self, cluster: &str) -> ClusterHealth {
        let result = match self.client(cluster) {
            Ok(client) => client.probe().await,
            Err(e) => Err(e),
        };
        self.record(cluster, &result)
    }

    /// Probes every registered cluster concurrently.
    pub async fn probe_all(&self) -> Vec<(String, ClusterHealth)> {
        let names: Vec<String> = self
            .members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();

        let probes = names.into_iter().map(|name| async move {
            let health = self.probe(&name).await;
            (name, health)
        });

        futures::future::join_all(probes).await
    }

    fn record<T>(&self, cluster: &str, result: &Result<T, SyncError>) -> ClusterHealth {
        let health = match result {
            Ok(_) => ClusterHealth::Reachable,
            Err(SyncError::Unreachable { .. }) => ClusterHealth::Unreachable,
            Err(SyncError::AuthRejected { .. }) => ClusterHealth::AuthRejected,
            // The cluster answered, it just refused this particular request.
            Err(_) => ClusterHealth::Reachable,
        };

        let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(member) = members.get_mut(cluster) {
            if member.target.health != health {
                match health {
                    ClusterHealth::Reachable => info!("cluster {cluster} is reachable"),
                    _ => warn!("cluster {cluster} is now {health:?}"),
                }
                member.target.health = health;
            }
        }

        health
    }
}

/// Cluster held entirely in memory.
///
/// Applies merge the desired object into the live one the way server-side
/// apply does: mappings merge recursively, everything else is replaced.
/// Every kind is namespaced unless declared otherwise with
/// [`InMemoryCluster::with_cluster_scoped`].
pub struct InMemoryCluster {
    name: String,
    apply_delay: Option<Duration>,
    cluster_scoped: BTreeSet<ResourceKind>,
    state: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    objects: BTreeMap<ResourceKey, Value>,
    unreachable: bool,
    auth_rejected: bool,
    faults: HashMap<ResourceKey, VecDeque<SyncError>>,
    applied: Vec<ResourceKey>,
    pruned: Vec<ResourceKey>,
}

impl InMemoryCluster {
    pub fn new(name: impl Into<String>) -> Self {
        InMemoryCluster {
            name: name.into(),
            apply_delay: None,
            cluster_scoped: BTreeSet::new(),
            state: Mutex::new(InMemoryState::default()),
        }
    }

    /// Serves `kind` without namespaces.
    pub fn with_cluster_scoped(mut self, kind: ResourceKind) -> Self {
        self.cluster_scoped.insert(kind);
        self
    }

    fn scope_of(&self, kind: &ResourceKind) -> ResourceScope {
        if self.cluster_scoped.contains(kind) {
            ResourceScope::Cluster
        } else {
            ResourceScope::Namespaced
        }
    }

    /// Delays every apply, simulating a slow API server.
    pub fn with_apply_delay(mut self, delay: Duration) -> Self {
        self.apply_delay = Some(delay);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, InMemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Places a live object in the cluster without recording an apply.
    pub fn insert(&self, resource: Resource) {
        self.state()
            .objects
            .insert(resource.key().clone(), resource.body().clone());
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Value> {
        self.state().objects.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().objects.is_empty()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    pub fn set_auth_rejected(&self, rejected: bool) {
        self.state().auth_rejected = rejected;
    }

    /// Queues `error` to be returned by the next apply or prune of `key`.
    pub fn fail_next(&self, key: &ResourceKey, error: SyncError) {
        self.state()
            .faults
            .entry(key.clone())
            .or_default()
            .push_back(error);
    }

    /// Keys of every successful apply, in order.
    pub fn applied(&self) -> Vec<ResourceKey> {
        self.state().applied.clone()
    }

    pub fn pruned(&self) -> Vec<ResourceKey> {
        self.state().pruned.clone()
    }

    fn check_connection(&self, state: &InMemoryState) -> Result<(), SyncError> {
        if state.unreachable {
            return Err(SyncError::Unreachable {
                cluster: self.name.clone(),
                reason: "connection refused".to_string(),
            });
        }
        if state.auth_rejected {
            return Err(SyncError::AuthRejected {
                cluster: self.name.clone(),
                reason: "Unauthorized".to_string(),
            });
        }
        Ok(())
    }

    fn take_fault(state: &mut InMemoryState, key: &ResourceKey) -> Option<SyncError> {
        state.faults.get_mut(key).and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn observed(
        &self,
        namespace: &str,
        kind: &ResourceKind,
    ) -> Result<Vec<Resource>, SyncError> {
        let state = self.state();
        self.check_connection(&state)?;

        let cluster_scoped = self.scope_of(kind) == ResourceScope::Cluster;
        state
            .objects
            .iter()
            .filter(|(key, _)| {
                key.kind == *kind
                    && (cluster_scoped || key.namespace.as_deref() == Some(namespace))
            })
            .map(|(key, body)| {
                Resource::from_value(body.clone()).map_err(|reason| SyncError::Rejected {
                    resource: key.to_string(),
                    reason,
                })
            })
            .collect()
    }

    async fn apply(&self, resource: &Resource) -> Result<(), SyncError> {
        if let Some(delay) = self.apply_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        self.check_connection(&state)?;
        if let Some(fault) = Self::take_fault(&mut state, resource.key()) {
            return Err(fault);
        }

        let resource = match self.scope_of(resource.kind()) {
            ResourceScope::Cluster => resource.clone().without_namespace(),
            ResourceScope::Namespaced => resource.clone(),
        };
        let key = resource.key().clone();
        match state.objects.get_mut(&key) {
            Some(live) => merge(live, resource.body()),
            None => {
                state.objects.insert(key.clone(), resource.body().clone());
            }
        }
        state.applied.push(key);

        Ok(())
    }

    async fn prune(&self, key: &ResourceKey) -> Result<(), SyncError> {
        let mut state = self.state();
        self.check_connection(&state)?;
        if let Some(fault) = Self::take_fault(&mut state, key) {
            return Err(fault);
        }

        state.objects.remove(key);
        state.pruned.push(key.clone());

        Ok(())
    }

    async fn scope(&self, kind: &ResourceKind) -> Result<ResourceScope, SyncError> {
        let state = self.state();
        self.check_connection(&state)?;
        Ok(self.scope_of(kind))
    }

    async fn probe(&self) -> Result<(), SyncError> {
        let state = self.state();
        self.check_connection(&state)
    }
}

fn merge(live: &mut Value, desired: &Value) {
    match (live, desired) {
        (Value::Object(live), Value::Object(desired)) => {
            for (field, value) in desired {
                match live.get_mut(field) {
                    Some(current) => merge(current, value),
                    None => {
                        live.insert(field.clone(), value.clone());
                    }
                }
            }
        }
        (live, desired) => *live = desired.clone(),
    }
}
