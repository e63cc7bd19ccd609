//! Lifecycle manager - routes configuration changes to running instances.
//!
//! Resources are handled before gateways so a gateway created or
//! reconfigured in the same changeset already sees the final feature set.
//! Within one kind, removals run first and the remaining changes are
//! dispatched concurrently; a failing entity never aborts the others.

use crate::connector::{sync_bindings, Connector, FeatureBindings, Gateway};
use crate::registry::PluginRegistry;
use crate::supervisor::{InstanceHooks, InstanceStatus, NoHooks, Supervisor, UpdateFailure};
use futures::future::join_all;
use serde::{Serialize, Serializer};
use snamp::config::SharedRuntimeSettings;
use snamp::configuration::{
    AgentConfiguration, Change, ChangeKind, Changeset, EntityKind, GatewayConfiguration,
    ResourceConfiguration,
};
use snamp::update_window::WindowTimer;
use snamp::SnampError;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One entity whose change could not be carried out.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ApplyFailure {
    pub kind: EntityKind,
    pub name: String,
    pub change: ChangeKind,
    #[serde(serialize_with = "serialize_error")]
    pub error: SnampError,
}

fn serialize_error<S: Serializer>(error: &SnampError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

/// Aggregate outcome of routing a changeset.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ApplyReport {
    /// Changes carried out (including entities without a live instance)
    pub applied_count: usize,
    pub failures: Vec<ApplyFailure>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Names of failed entities of one kind.
    pub fn failed_names(&self, kind: EntityKind) -> Vec<String> {
        self.failures
            .iter()
            .filter(|failure| failure.kind == kind)
            .map(|failure| failure.name.clone())
            .collect()
    }

    /// Reports an update the instance rejected after its window expired.
    pub fn record_rolled_back<C>(&mut self, kind: EntityKind, failure: &UpdateFailure<C>) {
        self.failures.push(ApplyFailure {
            kind,
            name: failure.name.clone(),
            change: ChangeKind::Modified,
            error: failure.error.clone(),
        });
    }

    fn record(
        &mut self,
        kind: EntityKind,
        change: ChangeKind,
        name: &str,
        counted: bool,
        result: Result<(), SnampError>,
    ) {
        match result {
            Ok(()) => {
                if counted {
                    self.applied_count += 1;
                }
            }
            Err(error) => {
                warn!(kind = %kind, name = %name, error = %error, "Change failed");
                self.failures.push(ApplyFailure {
                    kind,
                    name: name.to_string(),
                    change,
                    error,
                });
            }
        }
    }
}

/// Updates rolled back since they were last taken, by kind.
#[derive(Debug, Default)]
pub struct RolledBackUpdates {
    pub resources: Vec<UpdateFailure<ResourceConfiguration>>,
    pub gateways: Vec<UpdateFailure<GatewayConfiguration>>,
}

impl RolledBackUpdates {
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.gateways.is_empty()
    }

    pub fn len(&self) -> usize {
        self.resources.len() + self.gateways.len()
    }
}

/// Keeps feature bindings in line with the running connectors.
struct BindingHooks {
    bindings: Arc<FeatureBindings>,
}

impl InstanceHooks<dyn Connector> for BindingHooks {
    fn attached(&self, name: &str, instance: &Arc<dyn Connector>) {
        let touched = sync_bindings(&self.bindings, name, instance);
        debug!(resource = %name, bindings = touched, "Features bound");
    }

    fn refreshed(&self, name: &str, instance: &Arc<dyn Connector>) {
        let touched = sync_bindings(&self.bindings, name, instance);
        debug!(resource = %name, bindings = touched, "Bindings refreshed");
    }

    fn detached(&self, name: &str) {
        let removed = self.bindings.unbind_all(name);
        debug!(resource = %name, bindings = removed, "Features unbound");
    }
}

/// A change to dispatch to a supervisor.
struct Job<C> {
    name: String,
    change: ChangeKind,
    configuration: C,
    /// Group fan-out jobs are not part of the changeset and not counted
    counted: bool,
}

/// Owns the running connectors and gateways and the binding registry.
pub struct LifecycleManager {
    resources: Supervisor<ResourceConfiguration, dyn Connector>,
    gateways: Supervisor<GatewayConfiguration, dyn Gateway>,
    bindings: Arc<FeatureBindings>,
    timer: Arc<WindowTimer>,
}

impl LifecycleManager {
    pub fn new(
        registry: PluginRegistry,
        bindings: Arc<FeatureBindings>,
        settings: SharedRuntimeSettings,
        timer_tick: Duration,
    ) -> Self {
        let (connector_factories, gateway_factories) = registry.into_parts();
        let timer = WindowTimer::new(timer_tick);
        let hooks: Arc<dyn InstanceHooks<dyn Connector>> = Arc::new(BindingHooks {
            bindings: Arc::clone(&bindings),
        });

        Self {
            resources: Supervisor::new(
                connector_factories,
                Arc::clone(&timer),
                Arc::clone(&settings),
                hooks,
            ),
            gateways: Supervisor::new(
                gateway_factories,
                Arc::clone(&timer),
                settings,
                Arc::new(NoHooks),
            ),
            bindings,
            timer,
        }
    }

    /// Starts the update window timer. Must be called from within a tokio runtime.
    pub fn start(&self) {
        self.timer.start();
        info!("Lifecycle manager started");
    }

    pub fn bindings(&self) -> &Arc<FeatureBindings> {
        &self.bindings
    }

    pub fn resources(&self) -> &Supervisor<ResourceConfiguration, dyn Connector> {
        &self.resources
    }

    pub fn gateways(&self) -> &Supervisor<GatewayConfiguration, dyn Gateway> {
        &self.gateways
    }

    pub fn timer(&self) -> &Arc<WindowTimer> {
        &self.timer
    }

    pub async fn on_resource_added(
        &self,
        name: &str,
        configuration: ResourceConfiguration,
    ) -> Result<(), SnampError> {
        self.resources.add(name, configuration).await
    }

    pub async fn on_resource_removed(&self, name: &str) -> bool {
        self.resources.remove(name).await
    }

    pub async fn on_resource_modified(
        &self,
        name: &str,
        configuration: ResourceConfiguration,
    ) -> Result<(), SnampError> {
        self.resources.modify(name, configuration).await
    }

    pub async fn on_gateway_added(
        &self,
        name: &str,
        configuration: GatewayConfiguration,
    ) -> Result<(), SnampError> {
        self.gateways.add(name, configuration).await
    }

    pub async fn on_gateway_removed(&self, name: &str) -> bool {
        self.gateways.remove(name).await
    }

    pub async fn on_gateway_modified(
        &self,
        name: &str,
        configuration: GatewayConfiguration,
    ) -> Result<(), SnampError> {
        self.gateways.modify(name, configuration).await
    }

    /// Routes every change of `changeset` to the running system.
    ///
    /// `target` is the configuration the changeset was computed towards; it
    /// provides group inheritance for resources. Resources whose group
    /// changed are reconfigured even when the resource itself did not.
    pub async fn apply_changeset(
        &self,
        changeset: &Changeset,
        target: &AgentConfiguration,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();

        // Groups and thread pools have no live instance of their own
        report.applied_count += changeset.resource_groups.len() + changeset.thread_pools.len();

        // Resources
        for change in &changeset.resources {
            if let Change::Removed { name } = change {
                self.on_resource_removed(name).await;
                report.applied_count += 1;
            }
        }

        let mut jobs = Vec::new();
        let mut scheduled = BTreeSet::new();
        for change in &changeset.resources {
            let (name, entity) = match change {
                Change::Added { name, entity } | Change::Modified { name, entity, .. } => {
                    (name, entity)
                }
                Change::Removed { .. } => continue,
            };
            scheduled.insert(name.as_str());
            jobs.push(Job {
                name: name.clone(),
                change: change.kind(),
                configuration: target.resolve_resource(name).unwrap_or_else(|| entity.clone()),
                counted: true,
            });
        }
        for group in changeset.touched_groups() {
            for name in target.resources_in_group(group) {
                if !scheduled.insert(name) {
                    continue;
                }
                if let Some(configuration) = target.resolve_resource(name) {
                    debug!(resource = %name, group = %group, "Group changed, refreshing member");
                    jobs.push(Job {
                        name: name.to_string(),
                        change: ChangeKind::Modified,
                        configuration,
                        counted: false,
                    });
                }
            }
        }

        let results = join_all(jobs.iter().map(|job| self.route_resource(job))).await;
        for (job, result) in jobs.iter().zip(results) {
            report.record(EntityKind::Resource, job.change, &job.name, job.counted, result);
        }

        // Gateways
        for change in &changeset.gateways {
            if let Change::Removed { name } = change {
                self.on_gateway_removed(name).await;
                report.applied_count += 1;
            }
        }

        let jobs: Vec<Job<GatewayConfiguration>> = changeset
            .gateways
            .iter()
            .filter_map(|change| match change {
                Change::Added { name, entity } | Change::Modified { name, entity, .. } => Some(Job {
                    name: name.clone(),
                    change: change.kind(),
                    configuration: entity.clone(),
                    counted: true,
                }),
                Change::Removed { .. } => None,
            })
            .collect();

        let results = join_all(jobs.iter().map(|job| self.route_gateway(job))).await;
        for (job, result) in jobs.iter().zip(results) {
            report.record(EntityKind::Gateway, job.change, &job.name, job.counted, result);
        }

        info!(
            applied = report.applied_count,
            failed = report.failures.len(),
            "Changeset routed"
        );
        report
    }

    /// Takes the updates that running instances rejected and rolled back.
    pub fn take_update_failures(&self) -> RolledBackUpdates {
        RolledBackUpdates {
            resources: self.resources.take_update_failures(),
            gateways: self.gateways.take_update_failures(),
        }
    }

    pub fn has_update_failures(&self) -> bool {
        self.resources.has_update_failures() || self.gateways.has_update_failures()
    }

    /// Statuses of every running instance, resources first.
    pub fn statuses(&self) -> Vec<InstanceStatus> {
        let mut statuses = self.resources.statuses();
        statuses.extend(self.gateways.statuses());
        statuses
    }

    /// Stops every gateway, then every connector, then the timer.
    pub async fn shutdown(&self) {
        info!("Shutting down lifecycle manager");
        let gateways = self.gateways.shutdown().await;
        let resources = self.resources.shutdown().await;
        self.timer.stop();
        info!(resources = resources, gateways = gateways, "All instances stopped");
    }

    async fn route_resource(&self, job: &Job<ResourceConfiguration>) -> Result<(), SnampError> {
        match job.change {
            ChangeKind::Added => self.on_resource_added(&job.name, job.configuration.clone()).await,
            _ => self.on_resource_modified(&job.name, job.configuration.clone()).await,
        }
    }

    async fn route_gateway(&self, job: &Job<GatewayConfiguration>) -> Result<(), SnampError> {
        match job.change {
            ChangeKind::Added => self.on_gateway_added(&job.name, job.configuration.clone()).await,
            _ => self.on_gateway_modified(&job.name, job.configuration.clone()).await,
        }
    }
}
