//! A single sync cycle: fetch, observe, diff and apply for one application.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::application::Application;
use crate::cluster::ClusterPool;
use crate::config::RetryPolicy;
use crate::diff::{diff, drift, ActionKind, DiffReport, SyncAction};
use crate::error::{FailureReason, RegistryError, SyncError};
use crate::manifest::{
    ManifestSet, Resource, ResourceKey, ResourceKind, ResourceScope, TRACKING_LABEL,
};
use crate::registry::{AppHandle, ApplicationRegistry};
use crate::source::ManifestSource;
use crate::state::{CycleReport, Failure, Footprint, ResourceStatus, SyncState, Trigger};

/// The outcome of comparing an application's desired and live state,
/// without acting on it.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Desired state bound to the application's destination.
    pub desired: ManifestSet,
    pub report: DiffReport,
}

pub struct Reconciler {
    registry: Arc<ApplicationRegistry>,
    pool: Arc<ClusterPool>,
    source: Arc<dyn ManifestSource>,
    retry: RetryPolicy,
}

impl Reconciler {
    pub fn new(
        registry: Arc<ApplicationRegistry>,
        pool: Arc<ClusterPool>,
        source: Arc<dyn ManifestSource>,
        retry: RetryPolicy,
    ) -> Self {
        Reconciler {
            registry,
            pool,
            source,
            retry,
        }
    }

    /// Runs one sync cycle for `name` and returns the resulting state.
    ///
    /// At most one cycle per application runs at a time. A timer tick that
    /// finds a cycle in flight, or whose policy does not call for a sync,
    /// returns the current state untouched. An explicit trigger waits for the
    /// running cycle and then always syncs.
    pub async fn sync(&self, name: &str, trigger: Trigger) -> Result<SyncState, RegistryError> {
        let handle = self
            .registry
            .handle(name)
            .ok_or_else(|| RegistryError::UnknownApplication(name.to_string()))?;

        let _guard = match trigger {
            Trigger::Explicit => handle.lock.lock().await,
            Trigger::Timer => match handle.lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!("application {name} is already syncing, skipping tick");
                    return Ok(handle.snapshot());
                }
            },
        };

        // Re-read under the lock: the policy may have changed, or the
        // application may be gone, while waiting.
        let application = self
            .registry
            .get(name)
            .ok_or_else(|| RegistryError::UnknownApplication(name.to_string()))?;

        if trigger == Trigger::Timer && !handle.snapshot().wants_tick(&application) {
            return Ok(handle.snapshot());
        }

        handle.update(|state| state.begin(&application.source.revision));

        let span = info_span!(
            "sync",
            app = %application.name,
            cluster = %application.destination.cluster
        );
        let mut report = self.run_cycle(&application, &handle).instrument(span).await;

        Ok(handle.update(|state| {
            // A cancel accepted while the last step was running is only seen here.
            if handle.cancel.swap(false, Ordering::SeqCst) {
                report.mark_cancelled();
            }
            state.commit(report);
            state.clone()
        }))
    }

    /// Computes what a sync of `application` would do, without applying it.
    pub async fn plan(&self, application: &Application) -> Result<Plan, SyncError> {
        let managed = self
            .registry
            .state(&application.name)
            .map(|state| state.managed)
            .unwrap_or_default();
        let cancel = AtomicBool::new(false);

        let manifests = self.fetch(application, &cancel).await?;
        self.prepare(application, &manifests, &managed, &cancel).await
    }

    /// Binds `manifests` to the destination and diffs them against live state.
    async fn prepare(
        &self,
        application: &Application,
        manifests: &ManifestSet,
        managed: &Footprint,
        cancel: &AtomicBool,
    ) -> Result<Plan, SyncError> {
        let scopes = self.scopes(application, manifests, managed, cancel).await?;
        let desired = manifests.bind(
            &application.name,
            &application.destination.namespace,
            &scopes,
        )?;
        let observed = self
            .observe(application, &desired, &scopes, managed, cancel)
            .await?;
        let report = diff(&desired, &observed, application.policy.prune);

        Ok(Plan { desired, report })
    }

    async fn run_cycle(&self, application: &Application, handle: &AppHandle) -> CycleReport {
        let mut report = CycleReport::default();
        let cancel = handle.cancel.as_ref();
        let managed = handle.snapshot().managed;

        info!("syncing {} at {}", application.name, application.source);

        let manifests = match self.fetch(application, cancel).await {
            Ok(manifests) => manifests,
            Err(error) => return fail(report, error),
        };
        report.revision = Some(manifests.revision().to_string());

        let Plan { desired, report: plan } =
            match self.prepare(application, &manifests, &managed, cancel).await {
                Ok(plan) => plan,
                Err(error) => return fail(report, error),
            };
        debug!(
            "planned {} creates, {} updates, {} deletes, {} unchanged, {} orphans",
            plan.count(ActionKind::Create),
            plan.count(ActionKind::Update),
            plan.count(ActionKind::Delete),
            plan.count(ActionKind::NoOp),
            plan.orphans.len()
        );

        // Where live objects owned by this application may remain after the
        // cycle, and must therefore be observed next time.
        let mut footprint = Footprint::default();
        for resource in desired.resources() {
            footprint.track(resource.key());
        }
        for orphan in &plan.orphans {
            footprint.track(orphan);
        }
        report.orphans = plan.orphans;

        let mut entries = plan.entries.into_iter();
        while let Some(entry) = entries.next() {
            let key = entry.resource.key().clone();

            if cancel.load(Ordering::SeqCst) {
                warn!("sync of {} cancelled before {key}", application.name);
                report.failures.push(Failure {
                    resource: None,
                    reason: FailureReason::Cancelled,
                    message: format!("cancelled before {key}"),
                });
                footprint.track(&key);
                for entry in entries {
                    footprint.track(entry.resource.key());
                }
                break;
            }

            let action = entry.action.kind();
            let result = match &entry.action {
                SyncAction::NoOp => Ok(()),
                SyncAction::Create | SyncAction::Update { .. } => {
                    self.apply(application, &entry.resource, cancel).await
                }
                SyncAction::Delete => {
                    let cluster = application.destination.cluster.as_str();
                    let key = &key;
                    self.with_backoff(cancel, move || self.pool.prune(cluster, key))
                        .await
                }
            };

            match result {
                Ok(()) => {
                    if action != ActionKind::NoOp {
                        debug!("{action:?} {key} succeeded");
                    }
                    report.resources.push(ResourceStatus {
                        key,
                        action,
                        failure: None,
                    });
                }
                Err(error) => {
                    warn!("{action:?} {key} failed: {error}");
                    let abort = error.is_cluster_wide() || error == SyncError::Cancelled;

                    if action == ActionKind::Delete {
                        footprint.track(&key);
                    }
                    report.resources.push(ResourceStatus {
                        key: key.clone(),
                        action,
                        failure: Some(error.reason()),
                    });
                    report.failures.push(Failure {
                        resource: Some(key),
                        reason: error.reason(),
                        message: error.to_string(),
                    });

                    if abort {
                        for entry in entries {
                            footprint.track(entry.resource.key());
                        }
                        break;
                    }
                }
            }
        }

        report.managed = Some(footprint);

        match report.failures.first() {
            None => info!(
                "synced {} at revision {} ({} resources, {} orphaned)",
                application.name,
                manifests.revision(),
                report.resources.len(),
                report.orphans.len()
            ),
            Some(failure) => warn!(
                "{} is degraded after {} failures, first: {}",
                application.name,
                report.failures.len(),
                failure.message
            ),
        }

        report
    }

    async fn fetch(
        &self,
        application: &Application,
        cancel: &AtomicBool,
    ) -> Result<Arc<ManifestSet>, SyncError> {
        let source = &application.source;
        self.with_backoff(cancel, move || self.source.fetch(source))
            .await
    }

    /// Asks the destination cluster for the scope of every desired kind and
    /// every kind the application may still own objects of.
    ///
    /// A kind which only appears in the footprint and is no longer served is
    /// dropped, since nothing of it can be left to observe.
    async fn scopes(
        &self,
        application: &Application,
        manifests: &ManifestSet,
        managed: &Footprint,
        cancel: &AtomicBool,
    ) -> Result<BTreeMap<ResourceKind, ResourceScope>, SyncError> {
        let cluster = application.destination.cluster.as_str();
        let desired = manifests.kinds();

        let mut scopes = BTreeMap::new();
        for kind in desired.iter().chain(managed.kinds.difference(&desired)) {
            match self
                .with_backoff(cancel, move || self.pool.scope(cluster, kind))
                .await
            {
                Ok(scope) => {
                    scopes.insert(kind.clone(), scope);
                }
                Err(error) if !desired.contains(kind) && !error.is_cluster_wide() => {
                    warn!("no longer observing {kind}: {error}");
                }
                Err(error) => return Err(error),
            }
        }

        Ok(scopes)
    }

    /// Lists live resources which either match a desired resource or carry
    /// this application's tracking label.
    async fn observe(
        &self,
        application: &Application,
        desired: &ManifestSet,
        scopes: &BTreeMap<ResourceKind, ResourceScope>,
        managed: &Footprint,
        cancel: &AtomicBool,
    ) -> Result<Vec<Resource>, SyncError> {
        let cluster = application.destination.cluster.as_str();

        let mut namespaces: BTreeSet<&str> = desired
            .resources()
            .iter()
            .filter_map(|resource| resource.key().namespace.as_deref())
            .collect();
        namespaces.extend(managed.namespaces.iter().map(String::as_str));
        namespaces.insert(application.destination.namespace.as_str());

        let wanted: HashSet<&ResourceKey> = desired.resources().iter().map(Resource::key).collect();
        let mut observed = Vec::new();

        for (kind, scope) in scopes {
            // Cluster-scoped kinds are listed once, whatever the namespace.
            let listed: Vec<&str> = match scope {
                ResourceScope::Cluster => vec![application.destination.namespace.as_str()],
                ResourceScope::Namespaced => namespaces.iter().copied().collect(),
            };

            for namespace in listed {
                let live = self
                    .with_backoff(cancel, move || self.pool.observed(cluster, namespace, kind))
                    .await?;

                observed.extend(live.into_iter().filter(|resource| {
                    wanted.contains(resource.key())
                        || resource.label(TRACKING_LABEL) == Some(application.name.as_str())
                }));
            }
        }

        Ok(observed)
    }

    /// Applies a resource, retrying a conflict once against freshly observed
    /// live state.
    async fn apply(
        &self,
        application: &Application,
        resource: &Resource,
        cancel: &AtomicBool,
    ) -> Result<(), SyncError> {
        let cluster = application.destination.cluster.as_str();

        match self
            .with_backoff(cancel, move || self.pool.apply(cluster, resource))
            .await
        {
            Err(SyncError::ApplyConflict { reason, .. }) => {
                warn!(
                    "conflict applying {}: {reason}, retrying against live state",
                    resource.key()
                );

                let namespace = resource
                    .key()
                    .namespace
                    .as_deref()
                    .unwrap_or(application.destination.namespace.as_str());
                let live = self
                    .with_backoff(cancel, move || {
                        self.pool.observed(cluster, namespace, resource.kind())
                    })
                    .await?;

                let converged = live
                    .iter()
                    .find(|current| current.key() == resource.key())
                    .is_some_and(|current| drift(resource.body(), current.body()).is_empty());
                if converged {
                    debug!("{} already matches after conflict", resource.key());
                    return Ok(());
                }

                self.with_backoff(cancel, move || self.pool.apply(cluster, resource))
                    .await
            }
            result => result,
        }
    }

    /// Runs `operation`, retrying retryable failures with exponential backoff
    /// up to the configured number of attempts.
    async fn with_backoff<T, F, Fut>(
        &self,
        cancel: &AtomicBool,
        mut operation: F,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let mut retry = 0;
        loop {
            match operation().await {
                Err(error) if error.is_retryable() && retry + 1 < self.retry.attempts => {
                    let delay = self.retry.backoff(retry);
                    warn!("{error}, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    retry += 1;

                    if cancel.load(Ordering::SeqCst) {
                        return Err(SyncError::Cancelled);
                    }
                }
                result => return result,
            }
        }
    }
}

fn fail(mut report: CycleReport, error: SyncError) -> CycleReport {
    if error.reason().is_fatal() {
        error!("{error}");
    } else {
        warn!("{error}");
    }

    report.failures.push(Failure {
        resource: None,
        reason: error.reason(),
        message: error.to_string(),
    });
    report
}
