use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::application::{Application, ClusterHealth, ClusterTarget};
use crate::cluster::{ClusterClient, ClusterPool};
use crate::config::SyncSettings;
use crate::error::{Error, RegistryError};
use crate::reconciler::{Plan, Reconciler};
use crate::registry::ApplicationRegistry;
use crate::source::ManifestSource;
use crate::state::{SyncPhase, SyncState, Trigger};

/// Field manager used for server-side apply.
pub const CONTROLLER_NAME: &str = "fleetsync.io/controller";

/// Owns the registry and the cluster pool, and drives sync cycles for every
/// registered application on a bounded set of workers.
pub struct Controller {
    registry: Arc<ApplicationRegistry>,
    pool: Arc<ClusterPool>,
    reconciler: Arc<Reconciler>,
    permits: Arc<Semaphore>,
    interval: Duration,
    /// Serializes registration changes, so an application can never end up
    /// pointing at a cluster which was removed in the meantime.
    topology: Mutex<()>,
}

impl Controller {
    pub fn new(
        pool: Arc<ClusterPool>,
        source: Arc<dyn ManifestSource>,
        settings: &SyncSettings,
    ) -> Self {
        let registry = Arc::new(ApplicationRegistry::new());
        let reconciler = Arc::new(Reconciler::new(
            registry.clone(),
            pool.clone(),
            source,
            settings.retry,
        ));

        Controller {
            registry,
            pool,
            reconciler,
            permits: Arc::new(Semaphore::new(settings.max_concurrent_syncs.max(1))),
            interval: settings.interval,
            topology: Mutex::new(()),
        }
    }

    pub fn register_cluster(
        &self,
        target: ClusterTarget,
        client: Arc<dyn ClusterClient>,
    ) -> Result<(), RegistryError> {
        let _topology = self.topology.lock().unwrap_or_else(PoisonError::into_inner);
        self.pool.register(target, client)
    }

    /// Removes a cluster no application targets any more. Returns whether
    /// the cluster was registered at all.
    pub fn deregister_cluster(&self, name: &str) -> Result<bool, RegistryError> {
        let _topology = self.topology.lock().unwrap_or_else(PoisonError::into_inner);

        let applications = self.registry.targeting(name);
        if !applications.is_empty() {
            return Err(RegistryError::ClusterInUse {
                cluster: name.to_string(),
                applications,
            });
        }

        Ok(self.pool.deregister(name))
    }

    pub fn register_application(&self, application: Application) -> Result<(), RegistryError> {
        let _topology = self.topology.lock().unwrap_or_else(PoisonError::into_inner);
        self.check_destination(&application)?;
        self.registry.register(application)
    }

    /// Changes the source, destination or policy of an application. The new
    /// settings take effect from the next cycle.
    pub fn update_application(&self, application: Application) -> Result<(), RegistryError> {
        let _topology = self.topology.lock().unwrap_or_else(PoisonError::into_inner);
        self.check_destination(&application)?;
        self.registry.update(application)
    }

    /// Removes an application and its sync state, cancelling a cycle in
    /// flight. Unknown names are ignored.
    pub fn deregister_application(&self, name: &str) -> bool {
        let _topology = self.topology.lock().unwrap_or_else(PoisonError::into_inner);
        self.registry.deregister(name).is_some()
    }

    fn check_destination(&self, application: &Application) -> Result<(), RegistryError> {
        if self.pool.contains(&application.destination.cluster) {
            Ok(())
        } else {
            Err(RegistryError::UnknownCluster {
                application: application.name.clone(),
                cluster: application.destination.cluster.clone(),
            })
        }
    }

    pub fn applications(&self) -> Vec<Application> {
        self.registry.list()
    }

    pub fn clusters(&self) -> Vec<ClusterTarget> {
        self.pool.list()
    }

    /// Read-only view of an application's sync state.
    pub fn status(&self, name: &str) -> Option<SyncState> {
        self.registry.state(name)
    }

    /// Requests a sync of `name` and returns immediately. The outcome shows up
    /// in [`Controller::status`].
    pub fn trigger(&self, name: &str) -> Result<(), RegistryError> {
        if self.registry.get(name).is_none() {
            return Err(RegistryError::UnknownApplication(name.to_string()));
        }

        let reconciler = self.reconciler.clone();
        let permits = self.permits.clone();
        let name = name.to_string();

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };

            match reconciler.sync(&name, Trigger::Explicit).await {
                Ok(state) => debug!("triggered sync of {name} finished as {:?}", state.phase),
                Err(e) => warn!("triggered sync of {name} failed: {e}"),
            }
        });

        Ok(())
    }

    /// Syncs `name` and waits for the cycle to finish.
    pub async fn sync_now(&self, name: &str) -> Result<SyncState, RegistryError> {
        // The semaphore is never closed.
        let _permit = self.permits.acquire().await.ok();

        self.reconciler.sync(name, Trigger::Explicit).await
    }

    /// Stops an in-flight cycle of `name` before its next resource. Returns
    /// false if no cycle was running. An accepted cancel always leaves the
    /// cycle Degraded with reason `Cancelled`.
    pub fn cancel(&self, name: &str) -> bool {
        let Some(handle) = self.registry.handle(name) else {
            return false;
        };

        // Decided under the state lock, so the cycle cannot commit in between.
        let accepted = handle.update(|state| {
            if state.phase != SyncPhase::Syncing {
                return false;
            }
            handle.cancel.store(true, Ordering::SeqCst);
            true
        });

        if accepted {
            info!("cancelling sync of {name}");
        }
        accepted
    }

    fn cancel_all(&self) {
        for application in self.registry.list() {
            self.cancel(&application.name);
        }
    }

    /// Computes the actions a sync of `name` would take, without applying them.
    pub async fn plan(&self, name: &str) -> Result<Plan, Error> {
        let application = self
            .registry
            .get(name)
            .ok_or_else(|| RegistryError::UnknownApplication(name.to_string()))?;

        Ok(self.reconciler.plan(&application).await?)
    }

    /// Probes every cluster and records its health.
    pub async fn probe_clusters(&self) -> Vec<(String, ClusterHealth)> {
        self.pool.probe_all().await
    }

    /// Runs one timer pass over every registered application, each in its
    /// own task, and waits for all of them.
    pub async fn tick(&self) {
        let mut tasks = JoinSet::new();

        for application in self.registry.list() {
            let reconciler = self.reconciler.clone();
            let permits = self.permits.clone();

            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };

                if let Err(e) = reconciler.sync(&application.name, Trigger::Timer).await {
                    debug!("skipped {}: {e}", application.name);
                }
            });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("sync task failed: {e}");
            }
        }
    }

    /// Ticks on the configured interval until `shutdown` resolves.
    ///
    /// On shutdown, running cycles are cancelled and allowed to stop at the
    /// next resource boundary rather than being dropped mid-apply.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        info!(
            "reconciling {} applications across {} clusters every {:?}",
            self.registry.len(),
            self.pool.list().len(),
            self.interval
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
            }

            for (cluster, health) in self.probe_clusters().await {
                if health != ClusterHealth::Reachable {
                    warn!("cluster {cluster} is {health:?}");
                }
            }

            let tick = self.tick();
            tokio::pin!(tick);

            tokio::select! {
                _ = &mut tick => {}
                _ = &mut shutdown => {
                    self.cancel_all();
                    tick.await;
                    break;
                }
            }
        }

        info!("reconciliation loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::application::{Destination, SourceRef, SyncPolicy};
    use crate::cluster::InMemoryCluster;
    use crate::diff::ActionKind;
    use crate::error::{FailureReason, SyncError};
    use crate::manifest::{Resource, ResourceKind, TRACKING_LABEL};
    use crate::source::InMemorySource;

    struct Fixture {
        controller: Controller,
        source: Arc<InMemorySource>,
    }

    fn settings() -> SyncSettings {
        let mut settings = SyncSettings::default();
        settings.retry.initial_backoff = Duration::from_millis(1);
        settings.retry.max_backoff = Duration::from_millis(5);
        settings
    }

    fn fixture(clusters: &[(&str, Arc<InMemoryCluster>)]) -> Fixture {
        let source = Arc::new(InMemorySource::new());
        let controller = Controller::new(Arc::new(ClusterPool::new()), source.clone(), &settings());

        for (name, cluster) in clusters {
            controller
                .register_cluster(ClusterTarget::new(*name), cluster.clone())
                .unwrap();
        }

        Fixture { controller, source }
    }

    fn config_map(name: &str, data: serde_json::Value) -> Resource {
        Resource::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name },
            "data": data,
        }))
        .unwrap()
    }

    fn application(name: &str, cluster: &str, revision: &str, policy: SyncPolicy) -> Application {
        Application::new(
            name,
            SourceRef::new("memory://fleet", name, revision),
            Destination::new(cluster, "apps"),
        )
        .with_policy(policy)
    }

    fn publish(fixture: &Fixture, application: &Application, resources: Vec<Resource>) {
        fixture.source.insert(&application.source, resources);
    }

    /// A live object in the destination namespace, owned by `owner`.
    fn live(name: &str, owner: &str) -> Resource {
        config_map(name, json!({ "k": "v" }))
            .in_namespace("apps")
            .with_label(TRACKING_LABEL, owner)
    }

    #[tokio::test]
    async fn creates_resources_and_converges() {
        let east = Arc::new(InMemoryCluster::new("east"));
        let fixture = fixture(&[("east", east.clone())]);
        let app = application("guestbook", "east", "v1", SyncPolicy::manual());
        publish(&fixture, &app, vec![config_map("settings", json!({ "mode": "dark" }))]);
        fixture.controller.register_application(app).unwrap();

        let state = fixture.controller.sync_now("guestbook").await.unwrap();
        assert_eq!(state.phase, SyncPhase::Synced);
        assert_eq!(state.observed_revision.as_deref(), Some("v1"));
        assert_eq!(state.resources[0].action, ActionKind::Create);
        assert_eq!(east.len(), 1);

        let again = fixture.controller.sync_now("guestbook").await.unwrap();
        assert_eq!(again.phase, SyncPhase::Synced);
        assert!(again.resources.iter().all(|r| r.action == ActionKind::NoOp));
        assert_eq!(east.applied().len(), 1);
    }

    #[tokio::test]
    async fn orphans_survive_without_prune() {
        let east = Arc::new(InMemoryCluster::new("east"));
        east.insert(live("x", "guestbook"));
        east.insert(live("y", "guestbook"));
        let fixture = fixture(&[("east", east.clone())]);
        let app = application("guestbook", "east", "v1", SyncPolicy::manual());
        publish(&fixture, &app, vec![config_map("x", json!({ "k": "v" }))]);
        fixture.controller.register_application(app).unwrap();

        let state = fixture.controller.sync_now("guestbook").await.unwrap();

        assert_eq!(state.phase, SyncPhase::Synced);
        assert_eq!(state.orphans.len(), 1);
        assert_eq!(state.orphans[0].name, "y");
        assert!(east.pruned().is_empty());
        assert_eq!(east.len(), 2);
    }

    #[tokio::test]
    async fn prune_only_touches_owned_resources() {
        let east = Arc::new(InMemoryCluster::new("east"));
        east.insert(live("stale", "guestbook"));
        east.insert(live("foreign", "billing"));
        let fixture = fixture(&[("east", east.clone())]);
        let app = application("guestbook", "east", "v1", SyncPolicy::manual().with_prune(true));
        publish(&fixture, &app, vec![config_map("settings", json!({}))]);
        fixture.controller.register_application(app).unwrap();

        let state = fixture.controller.sync_now("guestbook").await.unwrap();

        assert_eq!(state.phase, SyncPhase::Synced);
        let pruned: Vec<_> = east.pruned().into_iter().map(|key| key.name).collect();
        assert_eq!(pruned, ["stale"]);
        assert!(state.orphans.is_empty());
    }

    #[tokio::test]
    async fn removed_kinds_are_still_pruned() {
        let east = Arc::new(InMemoryCluster::new("east"));
        let fixture = fixture(&[("east", east.clone())]);
        let v1 = application("guestbook", "east", "v1", SyncPolicy::manual().with_prune(true));
        let secret = Resource::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": "token" },
        }))
        .unwrap();
        publish(&fixture, &v1, vec![config_map("settings", json!({})), secret]);
        fixture.controller.register_application(v1.clone()).unwrap();
        fixture.controller.sync_now("guestbook").await.unwrap();

        let mut v2 = v1.clone();
        v2.source.revision = "v2".to_string();
        publish(&fixture, &v2, vec![config_map("settings", json!({}))]);
        fixture.controller.update_application(v2).unwrap();

        let state = fixture.controller.sync_now("guestbook").await.unwrap();

        assert_eq!(state.phase, SyncPhase::Synced);
        assert_eq!(east.pruned().len(), 1);
        assert_eq!(east.pruned()[0].kind, ResourceKind::new("v1", "Secret"));
        assert!(!state.managed.kinds.contains(&ResourceKind::new("v1", "Secret")));
    }

    #[tokio::test]
    async fn unreachable_cluster_does_not_affect_others() {
        let east = Arc::new(InMemoryCluster::new("east"));
        let west = Arc::new(InMemoryCluster::new("west"));
        east.set_unreachable(true);
        let fixture = fixture(&[("east", east.clone()), ("west", west.clone())]);

        let a = application("a", "east", "v1", SyncPolicy::manual());
        let b = application("b", "west", "v1", SyncPolicy::manual());
        publish(&fixture, &a, vec![config_map("a", json!({}))]);
        publish(&fixture, &b, vec![config_map("b", json!({}))]);
        fixture.controller.register_application(a).unwrap();
        fixture.controller.register_application(b).unwrap();

        let (a, b) = tokio::join!(
            fixture.controller.sync_now("a"),
            fixture.controller.sync_now("b")
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.phase, SyncPhase::Degraded);
        assert_eq!(a.degraded_reason, Some(FailureReason::Unreachable));
        assert_eq!(b.phase, SyncPhase::Synced);
        assert_eq!(west.len(), 1);

        let health: Vec<_> = fixture
            .controller
            .clusters()
            .into_iter()
            .map(|c| (c.name, c.health))
            .collect();
        assert_eq!(
            health,
            [
                ("east".to_string(), ClusterHealth::Unreachable),
                ("west".to_string(), ClusterHealth::Reachable),
            ]
        );
    }

    #[tokio::test]
    async fn concurrent_syncs_on_one_cluster_complete() {
        let east = Arc::new(
            InMemoryCluster::new("east").with_apply_delay(Duration::from_millis(20)),
        );
        let fixture = fixture(&[("east", east.clone())]);

        for name in ["api", "web"] {
            let app = application(name, "east", "v1", SyncPolicy::manual());
            publish(
                &fixture,
                &app,
                vec![
                    config_map(&format!("{name}-1"), json!({})),
                    config_map(&format!("{name}-2"), json!({})),
                ],
            );
            fixture.controller.register_application(app).unwrap();
        }

        let both = async {
            tokio::join!(
                fixture.controller.sync_now("api"),
                fixture.controller.sync_now("web"),
                fixture.controller.sync_now("api"),
            )
        };
        let (api, web, api_again) = tokio::time::timeout(Duration::from_secs(5), both)
            .await
            .expect("syncs did not finish in time");

        assert_eq!(api.unwrap().phase, SyncPhase::Synced);
        assert_eq!(web.unwrap().phase, SyncPhase::Synced);
        assert_eq!(api_again.unwrap().phase, SyncPhase::Synced);
        assert_eq!(east.len(), 4);

        let status = fixture.controller.status("api").unwrap();
        assert!(status.resources.iter().all(|r| r.key.name.starts_with("api-")));
        assert_eq!(status.cycles, 2);
    }

    #[tokio::test]
    async fn degraded_without_self_heal_waits_for_explicit_trigger() {
        let east = Arc::new(InMemoryCluster::new("east"));
        let fixture = fixture(&[("east", east.clone())]);
        let app = application("guestbook", "east", "v1", SyncPolicy::automated());
        publish(&fixture, &app, vec![config_map("settings", json!({}))]);
        fixture.controller.register_application(app).unwrap();

        east.set_auth_rejected(true);
        fixture.controller.tick().await;
        let state = fixture.controller.status("guestbook").unwrap();
        assert_eq!(state.phase, SyncPhase::Degraded);
        assert_eq!(state.degraded_reason, Some(FailureReason::AuthRejected));

        east.set_auth_rejected(false);
        for _ in 0..3 {
            fixture.controller.tick().await;
        }
        let state = fixture.controller.status("guestbook").unwrap();
        assert_eq!(state.phase, SyncPhase::Degraded);
        assert_eq!(state.cycles, 1);

        let state = fixture.controller.sync_now("guestbook").await.unwrap();
        assert_eq!(state.phase, SyncPhase::Synced);
        assert_eq!(state.cycles, 2);
    }

    #[tokio::test]
    async fn self_heal_retries_and_corrects_drift() {
        let east = Arc::new(InMemoryCluster::new("east"));
        let fixture = fixture(&[("east", east.clone())]);
        let app = application(
            "guestbook",
            "east",
            "v1",
            SyncPolicy::automated().with_self_heal(true),
        );
        publish(&fixture, &app, vec![config_map("settings", json!({ "mode": "dark" }))]);
        fixture.controller.register_application(app).unwrap();

        east.set_unreachable(true);
        fixture.controller.tick().await;
        assert!(fixture.controller.status("guestbook").unwrap().is_degraded());

        east.set_unreachable(false);
        fixture.controller.tick().await;
        let state = fixture.controller.status("guestbook").unwrap();
        assert_eq!(state.phase, SyncPhase::Synced);

        // Someone edits the live object by hand.
        let key = state.resources[0].key.clone();
        east.insert(live("settings", "guestbook"));
        assert_ne!(east.get(&key).unwrap()["data"]["mode"], "dark");

        fixture.controller.tick().await;
        assert_eq!(east.get(&key).unwrap()["data"]["mode"], "dark");
    }

    #[tokio::test]
    async fn partial_failures_are_committed() {
        let east = Arc::new(InMemoryCluster::new("east"));
        let fixture = fixture(&[("east", east.clone())]);
        let app = application("guestbook", "east", "v1", SyncPolicy::manual());
        publish(
            &fixture,
            &app,
            vec![
                config_map("first", json!({})),
                config_map("second", json!({})),
                config_map("third", json!({})),
            ],
        );
        fixture.controller.register_application(app).unwrap();

        let second = config_map("second", json!({})).in_namespace("apps");
        east.fail_next(
            second.key(),
            SyncError::Rejected {
                resource: second.key().to_string(),
                reason: "admission webhook denied the request".to_string(),
            },
        );

        let state = fixture.controller.sync_now("guestbook").await.unwrap();

        assert_eq!(state.phase, SyncPhase::Degraded);
        assert_eq!(state.degraded_reason, Some(FailureReason::Rejected));
        assert_eq!(state.failures.len(), 1);
        assert_eq!(state.failures[0].resource.as_ref(), Some(second.key()));
        assert_eq!(east.len(), 2);
    }

    #[tokio::test]
    async fn conflicts_are_retried_once() {
        let east = Arc::new(InMemoryCluster::new("east"));
        let fixture = fixture(&[("east", east.clone())]);
        let app = application("guestbook", "east", "v1", SyncPolicy::manual());
        let settings = config_map("settings", json!({ "mode": "dark" }));
        publish(&fixture, &app, vec![settings.clone()]);
        fixture.controller.register_application(app).unwrap();

        let key = settings.in_namespace("apps").key().clone();
        let conflict = || SyncError::ApplyConflict {
            resource: key.to_string(),
            reason: "the object has been modified".to_string(),
        };

        east.fail_next(&key, conflict());
        let state = fixture.controller.sync_now("guestbook").await.unwrap();
        assert_eq!(state.phase, SyncPhase::Synced);

        east.insert(live("settings", "guestbook"));
        east.fail_next(&key, conflict());
        east.fail_next(&key, conflict());
        let state = fixture.controller.sync_now("guestbook").await.unwrap();
        assert_eq!(state.phase, SyncPhase::Degraded);
        assert_eq!(state.degraded_reason, Some(FailureReason::ApplyConflict));
    }

    #[tokio::test]
    async fn transient_source_outages_are_retried() {
        let east = Arc::new(InMemoryCluster::new("east"));
        let fixture = fixture(&[("east", east.clone())]);
        let app = application("guestbook", "east", "v1", SyncPolicy::manual());
        publish(&fixture, &app, vec![config_map("settings", json!({}))]);
        fixture.controller.register_application(app).unwrap();

        fixture.source.fail_next(2);
        let state = fixture.controller.sync_now("guestbook").await.unwrap();
        assert_eq!(state.phase, SyncPhase::Synced);

        fixture.source.fail_next(3);
        let state = fixture.controller.sync_now("guestbook").await.unwrap();
        assert_eq!(state.degraded_reason, Some(FailureReason::SourceUnavailable));
        assert_eq!(fixture.source.fetches(), 6);
    }

    #[tokio::test]
    async fn missing_revision_is_fatal() {
        let east = Arc::new(InMemoryCluster::new("east"));
        let fixture = fixture(&[("east", east.clone())]);
        let app = application("guestbook", "east", "v1", SyncPolicy::manual());
        publish(&fixture, &app, vec![config_map("settings", json!({}))]);

        let mut missing = app.clone();
        missing.source.revision = "v404".to_string();
        fixture.controller.register_application(missing).unwrap();

        let state = fixture.controller.sync_now("guestbook").await.unwrap();
        assert_eq!(state.degraded_reason, Some(FailureReason::RevisionNotFound));
        assert_eq!(state.observed_revision, None);
        assert_eq!(fixture.source.fetches(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_between_resources() {
        let east = Arc::new(
            InMemoryCluster::new("east").with_apply_delay(Duration::from_millis(200)),
        );
        let fixture = fixture(&[("east", east.clone())]);
        let app = application("guestbook", "east", "v1", SyncPolicy::manual());
        publish(
            &fixture,
            &app,
            vec![
                config_map("first", json!({})),
                config_map("second", json!({})),
                config_map("third", json!({})),
            ],
        );
        fixture.controller.register_application(app).unwrap();

        let sync = fixture.controller.sync_now("guestbook");
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            fixture.controller.cancel("guestbook")
        };
        let (state, cancelled) = tokio::join!(sync, cancel);
        let state = state.unwrap();

        assert!(cancelled);
        assert_eq!(state.phase, SyncPhase::Degraded);
        assert_eq!(state.degraded_reason, Some(FailureReason::Cancelled));
        assert_eq!(east.applied().len(), 1);
        assert!(!fixture.controller.cancel("guestbook"));
    }

    #[tokio::test]
    async fn cancellation_during_the_last_resource_is_recorded() {
        let east = Arc::new(
            InMemoryCluster::new("east").with_apply_delay(Duration::from_millis(200)),
        );
        let fixture = fixture(&[("east", east.clone())]);
        let app = application("guestbook", "east", "v1", SyncPolicy::manual());
        publish(&fixture, &app, vec![config_map("only", json!({}))]);
        fixture.controller.register_application(app).unwrap();

        let sync = fixture.controller.sync_now("guestbook");
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            fixture.controller.cancel("guestbook")
        };
        let (state, cancelled) = tokio::join!(sync, cancel);
        let state = state.unwrap();

        assert!(cancelled);
        assert_eq!(east.applied().len(), 1);
        assert_eq!(state.phase, SyncPhase::Degraded);
        assert_eq!(state.degraded_reason, Some(FailureReason::Cancelled));

        // The flag does not leak into the next cycle.
        let next = fixture.controller.sync_now("guestbook").await.unwrap();
        assert_eq!(next.phase, SyncPhase::Synced);
    }

    #[tokio::test]
    async fn resources_in_dropped_namespaces_are_pruned() {
        let east = Arc::new(InMemoryCluster::new("east"));
        let fixture = fixture(&[("east", east.clone())]);
        let v1 = application("guestbook", "east", "v1", SyncPolicy::manual().with_prune(true));
        let moved = config_map("moved", json!({})).in_namespace("other");
        publish(&fixture, &v1, vec![config_map("keep", json!({})), moved.clone()]);
        fixture.controller.register_application(v1.clone()).unwrap();

        let state = fixture.controller.sync_now("guestbook").await.unwrap();
        assert_eq!(state.phase, SyncPhase::Synced);
        assert!(state.managed.namespaces.contains("other"));
        assert_eq!(east.len(), 2);

        let mut v2 = v1.clone();
        v2.source.revision = "v2".to_string();
        publish(&fixture, &v2, vec![config_map("keep", json!({}))]);
        fixture.controller.update_application(v2).unwrap();

        let state = fixture.controller.sync_now("guestbook").await.unwrap();

        assert_eq!(state.phase, SyncPhase::Synced);
        assert_eq!(east.pruned(), [moved.key().clone()]);
        assert_eq!(east.len(), 1);
        assert!(!state.managed.namespaces.contains("other"));
    }

    #[tokio::test]
    async fn resources_in_dropped_namespaces_stay_orphaned() {
        let east = Arc::new(InMemoryCluster::new("east"));
        let fixture = fixture(&[("east", east.clone())]);
        let v1 = application("guestbook", "east", "v1", SyncPolicy::manual());
        let moved = config_map("moved", json!({})).in_namespace("other");
        publish(&fixture, &v1, vec![config_map("keep", json!({})), moved.clone()]);
        fixture.controller.register_application(v1.clone()).unwrap();
        fixture.controller.sync_now("guestbook").await.unwrap();

        let mut v2 = v1.clone();
        v2.source.revision = "v2".to_string();
        publish(&fixture, &v2, vec![config_map("keep", json!({}))]);
        fixture.controller.update_application(v2).unwrap();

        for _ in 0..2 {
            let state = fixture.controller.sync_now("guestbook").await.unwrap();
            assert_eq!(state.phase, SyncPhase::Synced);
            assert_eq!(state.orphans, [moved.key().clone()]);
        }
        assert!(east.pruned().is_empty());
    }

    #[tokio::test]
    async fn cluster_scoped_custom_kinds_converge() {
        let issuer_kind = ResourceKind::new("cert-manager.io/v1", "ClusterIssuer");
        let east = Arc::new(InMemoryCluster::new("east").with_cluster_scoped(issuer_kind));
        let fixture = fixture(&[("east", east.clone())]);
        let app = application("guestbook", "east", "v1", SyncPolicy::manual().with_prune(true));
        let issuer = Resource::from_value(json!({
            "apiVersion": "cert-manager.io/v1",
            "kind": "ClusterIssuer",
            "metadata": { "name": "letsencrypt" },
            "spec": { "acme": { "email": "ops@example.com" } },
        }))
        .unwrap();
        publish(&fixture, &app, vec![issuer, config_map("settings", json!({}))]);
        fixture.controller.register_application(app).unwrap();

        let first = fixture.controller.sync_now("guestbook").await.unwrap();
        assert_eq!(first.phase, SyncPhase::Synced);
        assert_eq!(first.resources[0].key.namespace, None);
        assert_eq!(first.resources[0].action, ActionKind::Create);

        let second = fixture.controller.sync_now("guestbook").await.unwrap();
        assert_eq!(second.phase, SyncPhase::Synced);
        assert!(second.resources.iter().all(|r| r.action == ActionKind::NoOp));
        assert!(east.pruned().is_empty());
        assert_eq!(east.len(), 2);
    }

    #[tokio::test]
    async fn trigger_returns_immediately() {
        let east = Arc::new(InMemoryCluster::new("east"));
        let fixture = fixture(&[("east", east.clone())]);
        let app = application("guestbook", "east", "v1", SyncPolicy::manual());
        publish(&fixture, &app, vec![config_map("settings", json!({}))]);
        fixture.controller.register_application(app).unwrap();

        fixture.controller.trigger("guestbook").unwrap();
        assert_eq!(
            fixture.controller.trigger("ghost"),
            Err(RegistryError::UnknownApplication("ghost".to_string()))
        );

        let synced = async {
            loop {
                let state = fixture.controller.status("guestbook").unwrap();
                if state.phase == SyncPhase::Synced {
                    return state;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        let state = tokio::time::timeout(Duration::from_secs(5), synced)
            .await
            .expect("triggered sync never finished");
        assert_eq!(state.cycles, 1);
    }

    #[tokio::test]
    async fn registration_enforces_cluster_references() {
        let east = Arc::new(InMemoryCluster::new("east"));
        let fixture = fixture(&[("east", east)]);

        assert_eq!(
            fixture
                .controller
                .register_application(application("api", "west", "v1", SyncPolicy::manual())),
            Err(RegistryError::UnknownCluster {
                application: "api".to_string(),
                cluster: "west".to_string(),
            })
        );

        fixture
            .controller
            .register_application(application("api", "east", "v1", SyncPolicy::manual()))
            .unwrap();
        assert!(matches!(
            fixture.controller.deregister_cluster("east"),
            Err(RegistryError::ClusterInUse { .. })
        ));

        assert!(fixture.controller.deregister_application("api"));
        assert!(!fixture.controller.deregister_application("api"));
        assert!(fixture.controller.status("api").is_none());
        assert_eq!(fixture.controller.deregister_cluster("east"), Ok(true));
        assert_eq!(fixture.controller.deregister_cluster("east"), Ok(false));
    }

    #[tokio::test]
    async fn plan_does_not_apply() {
        let east = Arc::new(InMemoryCluster::new("east"));
        let fixture = fixture(&[("east", east.clone())]);
        let app = application("guestbook", "east", "v1", SyncPolicy::manual());
        publish(&fixture, &app, vec![config_map("settings", json!({}))]);
        fixture.controller.register_application(app).unwrap();

        let plan = fixture.controller.plan("guestbook").await.unwrap();

        assert_eq!(plan.report.count(ActionKind::Create), 1);
        assert_eq!(plan.desired.revision(), "v1");
        assert!(east.is_empty());
        assert_eq!(
            fixture.controller.status("guestbook").unwrap().phase,
            SyncPhase::Idle
        );
    }
}
