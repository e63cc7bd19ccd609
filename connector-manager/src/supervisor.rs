//! Instance supervisor - owns the running instances of one kind.
//!
//! Each instance is paired with its own update window. Modifications never
//! touch the instance directly: they are queued on the window and applied in
//! one `end_update` once the window expires. A failed update is rolled back
//! by re-applying the previously applied configuration and recorded until
//! the owner takes it with [`Supervisor::take_update_failures`].

use crate::connector::{CoalescedUpdate, ManagedInstance};
use crate::registry::FactoryMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use snamp::config::SharedRuntimeSettings;
use snamp::configuration::{
    ConfigurationEntity, EntityKind, GatewayConfiguration, ParameterDelta, ResourceConfiguration,
};
use snamp::update_window::{UpdateHandler, UpdateWindow, WindowTimer};
use snamp::SnampError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Configuration of something that runs as a live instance.
pub trait InstanceConfiguration: ConfigurationEntity {
    /// Plugin type handling the instance.
    fn type_name(&self) -> &str;
}

impl InstanceConfiguration for ResourceConfiguration {
    fn type_name(&self) -> &str {
        &self.connection_type
    }
}

impl InstanceConfiguration for GatewayConfiguration {
    fn type_name(&self) -> &str {
        &self.gateway_type
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Active,
    /// An update window is open
    Updating,
    /// An update failed and so did the rollback
    Degraded,
}

/// Status information for a running instance.
#[derive(Clone, Debug, Serialize)]
pub struct InstanceStatus {
    pub kind: EntityKind,
    pub name: String,
    pub type_name: String,
    pub state: InstanceState,
    pub started_at: DateTime<Utc>,
    /// Last time an update window was applied
    pub last_updated: Option<DateTime<Utc>>,
    /// Total number of applied update windows
    pub update_count: u64,
    /// Total number of failed update windows
    pub error_count: u64,
    /// Last error message (if any)
    pub last_error: Option<String>,
}

impl InstanceStatus {
    fn new(kind: EntityKind, name: &str, type_name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            type_name: type_name.to_string(),
            state: InstanceState::Active,
            started_at: Utc::now(),
            last_updated: None,
            update_count: 0,
            error_count: 0,
            last_error: None,
        }
    }
}

/// Callbacks fired around instance lifetime changes.
pub trait InstanceHooks<I: ?Sized>: Send + Sync {
    /// The instance was created and registered.
    fn attached(&self, _name: &str, _instance: &Arc<I>) {}

    /// An update window was applied (or rolled back).
    fn refreshed(&self, _name: &str, _instance: &Arc<I>) {}

    /// The instance was removed from the active set.
    fn detached(&self, _name: &str) {}
}

/// Hooks that do nothing.
pub struct NoHooks;

impl<I: ?Sized> InstanceHooks<I> for NoHooks {}

/// An update the instance rejected and that was rolled back.
#[derive(Clone, Debug)]
pub struct UpdateFailure<C> {
    pub name: String,
    /// Configuration the instance runs with after the rollback
    pub configuration: C,
    pub error: SnampError,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Applies coalesced updates to one instance.
struct InstanceUpdater<C, I: ?Sized> {
    kind: EntityKind,
    name: String,
    instance: Arc<I>,
    /// Configuration the instance currently runs with
    applied: Mutex<C>,
    /// Latest configuration queued for the instance
    submitted: Arc<Mutex<C>>,
    status: Arc<Mutex<InstanceStatus>>,
    failures: Arc<Mutex<Vec<UpdateFailure<C>>>>,
    hooks: Arc<dyn InstanceHooks<I>>,
}

#[async_trait]
impl<C, I> UpdateHandler<C> for InstanceUpdater<C, I>
where
    C: InstanceConfiguration,
    I: ManagedInstance<C> + ?Sized + 'static,
{
    async fn begin_update(&self) -> anyhow::Result<()> {
        lock(&self.status).state = InstanceState::Updating;
        self.instance.begin_update().await
    }

    async fn end_update(&self, changes: Vec<C>) -> anyhow::Result<()> {
        let change_count = changes.len();
        let Some(configuration) = changes.into_iter().last() else {
            lock(&self.status).state = InstanceState::Active;
            return Ok(());
        };

        let previous = lock(&self.applied).clone();
        let update = CoalescedUpdate {
            parameters: ParameterDelta::between(previous.parameters(), configuration.parameters()),
            configuration,
            change_count,
        };

        match self.instance.end_update(&update).await {
            Ok(()) => {
                *lock(&self.applied) = update.configuration;
                {
                    let mut status = lock(&self.status);
                    status.state = InstanceState::Active;
                    status.update_count += 1;
                    status.last_updated = Some(Utc::now());
                }
                self.hooks.refreshed(&self.name, &self.instance);
                info!(
                    kind = %self.kind,
                    name = %self.name,
                    changes = change_count,
                    parameters = update.parameters.len(),
                    "Instance reconfigured"
                );
                Ok(())
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!(
                    kind = %self.kind,
                    name = %self.name,
                    error = %reason,
                    "Update failed, rolling back"
                );

                let rollback = CoalescedUpdate {
                    parameters: ParameterDelta::between(
                        update.configuration.parameters(),
                        previous.parameters(),
                    ),
                    configuration: previous.clone(),
                    change_count: 0,
                };
                let rolled_back = self.instance.end_update(&rollback).await;

                // Resubmitting the rejected configuration must queue it again
                {
                    let mut submitted = lock(&self.submitted);
                    if *submitted == update.configuration {
                        *submitted = previous.clone();
                    }
                }
                lock(&self.failures).push(UpdateFailure {
                    name: self.name.clone(),
                    configuration: previous,
                    error: SnampError::connection_failure(self.kind, &self.name, &e),
                });

                {
                    let mut status = lock(&self.status);
                    status.error_count += 1;
                    status.last_error = Some(reason);
                    status.last_updated = Some(Utc::now());
                    status.state = if rolled_back.is_ok() {
                        InstanceState::Active
                    } else {
                        InstanceState::Degraded
                    };
                }
                if let Err(rollback_error) = rolled_back {
                    error!(
                        kind = %self.kind,
                        name = %self.name,
                        error = %rollback_error,
                        "Rollback failed, instance degraded"
                    );
                }
                self.hooks.refreshed(&self.name, &self.instance);
                Err(e)
            }
        }
    }
}

/// A running instance with its update window.
struct Active<C, I: ?Sized> {
    instance: Arc<I>,
    window: Arc<UpdateWindow<C, InstanceUpdater<C, I>>>,
    status: Arc<Mutex<InstanceStatus>>,
    /// Latest configuration queued for the instance
    submitted: Arc<Mutex<C>>,
}

/// Owns every running instance of one kind (connectors or gateways).
pub struct Supervisor<C, I: ?Sized> {
    kind: EntityKind,
    factories: FactoryMap<C, I>,
    instances: DashMap<String, Arc<Active<C, I>>>,
    timer: Arc<WindowTimer>,
    settings: SharedRuntimeSettings,
    hooks: Arc<dyn InstanceHooks<I>>,
    /// Rolled back updates not yet taken by the owner
    failures: Arc<Mutex<Vec<UpdateFailure<C>>>>,
}

impl<C, I> Supervisor<C, I>
where
    C: InstanceConfiguration,
    I: ManagedInstance<C> + ?Sized + 'static,
{
    pub fn new(
        factories: FactoryMap<C, I>,
        timer: Arc<WindowTimer>,
        settings: SharedRuntimeSettings,
        hooks: Arc<dyn InstanceHooks<I>>,
    ) -> Self {
        Self {
            kind: C::KIND,
            factories,
            instances: DashMap::new(),
            timer,
            settings,
            hooks,
            failures: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Starts a new instance. An already running name is reconfigured instead.
    pub async fn add(&self, name: &str, configuration: C) -> Result<(), SnampError> {
        if self.instances.contains_key(name) {
            debug!(kind = %self.kind, name = %name, "Instance already running, reconfiguring");
            return self.reconfigure(name, configuration).await;
        }
        self.start(name, configuration).await
    }

    /// Queues a reconfiguration on the instance's update window.
    ///
    /// A name that is not running is started instead, so a previously failed
    /// add gets another chance.
    pub async fn modify(&self, name: &str, configuration: C) -> Result<(), SnampError> {
        if !self.instances.contains_key(name) {
            debug!(kind = %self.kind, name = %name, "Instance not running, starting");
            return self.start(name, configuration).await;
        }
        self.reconfigure(name, configuration).await
    }

    /// Stops an instance, flushing its open update window first.
    ///
    /// Close failures are logged; the instance is removed either way.
    /// Returns false if nothing was running under `name`.
    pub async fn remove(&self, name: &str) -> bool {
        let Some((_, active)) = self.instances.remove(name) else {
            return false;
        };
        self.timer.unregister(&self.timer_key(name));

        if let Err(e) = active.window.close().await {
            warn!(kind = %self.kind, name = %name, error = %e, "Update window already closed");
        }
        self.hooks.detached(name);
        // Nothing left to retry for a stopped instance
        lock(&self.failures).retain(|failure| failure.name != name);

        if let Err(e) = active.instance.close().await {
            warn!(
                kind = %self.kind,
                name = %name,
                error = %e,
                "Instance did not close cleanly"
            );
        }
        info!(kind = %self.kind, name = %name, "Instance stopped");
        true
    }

    /// Stops every instance. Returns how many were running.
    pub async fn shutdown(&self) -> usize {
        let names = self.names();
        let mut stopped = 0;
        for name in &names {
            if self.remove(name).await {
                stopped += 1;
            }
        }
        stopped
    }

    pub fn contains(&self, name: &str) -> bool {
        self.instances.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<I>> {
        self.instances
            .get(name)
            .map(|active| Arc::clone(&active.instance))
    }

    pub fn is_updating(&self, name: &str) -> bool {
        self.instances
            .get(name)
            .is_some_and(|active| active.window.is_updating())
    }

    pub fn status(&self, name: &str) -> Option<InstanceStatus> {
        self.instances
            .get(name)
            .map(|active| lock(&active.status).clone())
    }

    /// Statuses of all running instances, sorted by name.
    pub fn statuses(&self) -> Vec<InstanceStatus> {
        let mut statuses: Vec<InstanceStatus> = self
            .instances
            .iter()
            .map(|active| lock(&active.status).clone())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Takes the updates rolled back since the last call.
    pub fn take_update_failures(&self) -> Vec<UpdateFailure<C>> {
        std::mem::take(&mut *lock(&self.failures))
    }

    pub fn has_update_failures(&self) -> bool {
        !lock(&self.failures).is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn timer_key(&self, name: &str) -> String {
        format!("{}:{}", self.kind, name)
    }

    async fn start(&self, name: &str, configuration: C) -> Result<(), SnampError> {
        let type_name = configuration.type_name().to_string();
        let factory = self
            .factories
            .get(&type_name)
            .cloned()
            .ok_or_else(|| SnampError::UnknownEntityType {
                kind: self.kind,
                type_name: type_name.clone(),
            })?;

        let instance = factory
            .create(name, &configuration)
            .await
            .map_err(|e| SnampError::connection_failure(self.kind, name, &e))?;

        let status = Arc::new(Mutex::new(InstanceStatus::new(self.kind, name, &type_name)));
        let duration = self
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .update_window();
        let submitted = Arc::new(Mutex::new(configuration.clone()));
        let updater = InstanceUpdater {
            kind: self.kind,
            name: name.to_string(),
            instance: Arc::clone(&instance),
            applied: Mutex::new(configuration),
            submitted: Arc::clone(&submitted),
            status: Arc::clone(&status),
            failures: Arc::clone(&self.failures),
            hooks: Arc::clone(&self.hooks),
        };
        let window = Arc::new(UpdateWindow::new(self.timer_key(name), duration, updater));
        let active = Arc::new(Active {
            instance: Arc::clone(&instance),
            window: Arc::clone(&window),
            status,
            submitted,
        });

        let inserted = match self.instances.entry(name.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(active);
                true
            }
        };
        if !inserted {
            // Lost a race with a concurrent start of the same name
            warn!(kind = %self.kind, name = %name, "Instance started twice, closing duplicate");
            if let Err(e) = instance.close().await {
                warn!(
                    kind = %self.kind,
                    name = %name,
                    error = %e,
                    "Duplicate did not close cleanly"
                );
            }
            return Ok(());
        }

        self.timer.register(self.timer_key(name), window);
        self.hooks.attached(name, &instance);
        info!(
            kind = %self.kind,
            name = %name,
            type_name = %type_name,
            window_ms = duration.as_millis() as u64,
            "Instance started"
        );
        Ok(())
    }

    async fn reconfigure(&self, name: &str, configuration: C) -> Result<(), SnampError> {
        let Some(active) = self.instances.get(name).map(|e| Arc::clone(e.value())) else {
            return self.start(name, configuration).await;
        };

        let running_type = lock(&active.status).type_name.clone();
        if configuration.type_name() != running_type {
            info!(
                kind = %self.kind,
                name = %name,
                from = %running_type,
                to = %configuration.type_name(),
                "Instance type changed, recreating"
            );
            self.remove(name).await;
            return self.start(name, configuration).await;
        }

        {
            let mut submitted = lock(&active.submitted);
            if *submitted == configuration {
                debug!(
                    kind = %self.kind,
                    name = %name,
                    "Configuration unchanged, nothing to queue"
                );
                return Ok(());
            }
            *submitted = configuration.clone();
        }

        active.window.begin_update(configuration).await?;
        debug!(kind = %self.kind, name = %name, "Update queued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InstanceFactory;
    use anyhow::bail;
    use snamp::config::{new_runtime_settings, SnampConfig};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    /// Gateway stand-in recording every hook call.
    struct FakeGateway {
        name: String,
        updates: Mutex<Vec<CoalescedUpdate<GatewayConfiguration>>>,
        begins: AtomicUsize,
        closed: AtomicBool,
    }

    #[async_trait]
    impl ManagedInstance<GatewayConfiguration> for FakeGateway {
        fn name(&self) -> &str {
            &self.name
        }

        async fn begin_update(&self) -> anyhow::Result<()> {
            self.begins.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn end_update(
            &self,
            update: &CoalescedUpdate<GatewayConfiguration>,
        ) -> anyhow::Result<()> {
            self.updates.lock().unwrap().push(update.clone());
            match update.configuration.parameters.get("reject").map(String::as_str) {
                Some("always") => bail!("rejected"),
                Some("once") if update.change_count > 0 => bail!("rejected"),
                _ => Ok(()),
            }
        }

        async fn close(&self) -> anyhow::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            if self.name == "sticky" {
                bail!("socket still in use");
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeGatewayFactory {
        created: Mutex<HashMap<String, Arc<FakeGateway>>>,
    }

    #[async_trait]
    impl InstanceFactory<GatewayConfiguration, FakeGateway> for FakeGatewayFactory {
        async fn create(
            &self,
            name: &str,
            configuration: &GatewayConfiguration,
        ) -> anyhow::Result<Arc<FakeGateway>> {
            if configuration.parameters.contains_key("unreachable") {
                bail!("connection refused");
            }
            let gateway = Arc::new(FakeGateway {
                name: name.to_string(),
                updates: Mutex::new(Vec::new()),
                begins: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            });
            self.created
                .lock()
                .unwrap()
                .insert(name.to_string(), Arc::clone(&gateway));
            Ok(gateway)
        }
    }

    impl FakeGatewayFactory {
        fn instance(&self, name: &str) -> Arc<FakeGateway> {
            Arc::clone(&self.created.lock().unwrap()[name])
        }
    }

    fn supervisor() -> (
        Supervisor<GatewayConfiguration, FakeGateway>,
        Arc<FakeGatewayFactory>,
        Arc<WindowTimer>,
    ) {
        let factory = Arc::new(FakeGatewayFactory::default());
        let mut factories: FactoryMap<GatewayConfiguration, FakeGateway> = HashMap::new();
        factories.insert("fake".to_string(), factory.clone());

        let mut config = SnampConfig::default();
        config.update_window.duration_ms = 1000;
        let timer = WindowTimer::new(Duration::from_millis(50));
        timer.start();

        let supervisor = Supervisor::new(
            factories,
            Arc::clone(&timer),
            new_runtime_settings(&config),
            Arc::new(NoHooks),
        );
        (supervisor, factory, timer)
    }

    fn gateway_config(param: &str) -> GatewayConfiguration {
        GatewayConfiguration::new("fake").with_parameter("param", param)
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_unknown_type_fails() {
        let (supervisor, _factory, _timer) = supervisor();

        let err = supervisor
            .add("g1", GatewayConfiguration::new("snmp"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SnampError::UnknownEntityType {
                kind: EntityKind::Gateway,
                type_name: "snmp".to_string(),
            }
        );
        assert!(!supervisor.contains("g1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_create_leaves_no_instance() {
        let (supervisor, _factory, timer) = supervisor();

        let err = supervisor
            .add("g1", gateway_config("1").with_parameter("unreachable", "yes"))
            .await
            .unwrap_err();
        assert!(matches!(err, SnampError::ConnectionFailure { .. }));
        assert!(supervisor.is_empty());
        assert_eq!(timer.window_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_modifications_coalesce_into_one_update() {
        let (supervisor, factory, _timer) = supervisor();
        supervisor.add("g1", gateway_config("1")).await.unwrap();
        let gateway = factory.instance("g1");

        supervisor.modify("g1", gateway_config("2")).await.unwrap();
        sleep(Duration::from_millis(300)).await;
        supervisor
            .modify("g1", gateway_config("3").with_parameter("extra", "x"))
            .await
            .unwrap();
        assert!(supervisor.is_updating("g1"));
        assert_eq!(supervisor.status("g1").unwrap().state, InstanceState::Updating);

        sleep(Duration::from_millis(1500)).await;
        assert!(!supervisor.is_updating("g1"));

        let updates = gateway.updates.lock().unwrap().clone();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].change_count, 2);
        assert_eq!(updates[0].configuration, gateway_config("3").with_parameter("extra", "x"));
        assert_eq!(updates[0].parameters.set.len(), 2);
        assert_eq!(gateway.begins.load(Ordering::SeqCst), 1);

        let status = supervisor.status("g1").unwrap();
        assert_eq!(status.state, InstanceState::Active);
        assert_eq!(status.update_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_modify_is_not_queued() {
        let (supervisor, _factory, _timer) = supervisor();
        supervisor.add("g1", gateway_config("1")).await.unwrap();

        supervisor.modify("g1", gateway_config("1")).await.unwrap();
        assert!(!supervisor.is_updating("g1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_update_rolls_back() {
        let (supervisor, factory, _timer) = supervisor();
        supervisor.add("g1", gateway_config("1")).await.unwrap();
        let gateway = factory.instance("g1");

        supervisor
            .modify("g1", gateway_config("2").with_parameter("reject", "once"))
            .await
            .unwrap();
        sleep(Duration::from_millis(1200)).await;

        let updates = gateway.updates.lock().unwrap().clone();
        assert_eq!(updates.len(), 2);
        // Second call re-applies the original configuration
        assert_eq!(updates[1].configuration, gateway_config("1"));
        assert_eq!(updates[1].change_count, 0);
        assert!(updates[1].parameters.removed.contains("reject"));

        let status = supervisor.status("g1").unwrap();
        assert_eq!(status.state, InstanceState::Active);
        assert_eq!(status.error_count, 1);
        assert!(status.last_error.unwrap().contains("rejected"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_update_is_recorded_and_can_be_resubmitted() {
        let (supervisor, factory, _timer) = supervisor();
        supervisor.add("g1", gateway_config("1")).await.unwrap();
        let gateway = factory.instance("g1");
        let rejected = gateway_config("2").with_parameter("reject", "once");

        supervisor.modify("g1", rejected.clone()).await.unwrap();
        sleep(Duration::from_millis(1200)).await;

        assert!(supervisor.has_update_failures());
        let failures = supervisor.take_update_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name, "g1");
        assert_eq!(failures[0].configuration, gateway_config("1"));
        assert!(matches!(failures[0].error, SnampError::ConnectionFailure { .. }));
        assert!(!supervisor.has_update_failures());

        // Same target again is queued, not swallowed as unchanged
        supervisor.modify("g1", rejected).await.unwrap();
        assert!(supervisor.is_updating("g1"));
        sleep(Duration::from_millis(1200)).await;
        assert_eq!(gateway.updates.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delta_after_rollback_is_relative_to_running_configuration() {
        let (supervisor, factory, _timer) = supervisor();
        supervisor.add("g1", gateway_config("1")).await.unwrap();
        let gateway = factory.instance("g1");

        supervisor
            .modify("g1", gateway_config("2").with_parameter("reject", "once"))
            .await
            .unwrap();
        sleep(Duration::from_millis(1200)).await;

        supervisor.modify("g1", gateway_config("2")).await.unwrap();
        sleep(Duration::from_millis(1200)).await;

        let updates = gateway.updates.lock().unwrap().clone();
        assert_eq!(updates.len(), 3);
        let last = &updates[2];
        assert_eq!(last.configuration, gateway_config("2"));
        assert_eq!(last.parameters.set.get("param").map(String::as_str), Some("2"));
        assert_eq!(last.parameters.set.len(), 1);
        assert!(last.parameters.removed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_instance_drops_its_failures() {
        let (supervisor, _factory, _timer) = supervisor();
        supervisor.add("g1", gateway_config("1")).await.unwrap();

        supervisor
            .modify("g1", gateway_config("2").with_parameter("reject", "once"))
            .await
            .unwrap();
        // Flushed by remove, rejected and rolled back
        assert!(supervisor.remove("g1").await);
        assert!(!supervisor.has_update_failures());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_rollback_degrades_instance() {
        let (supervisor, _factory, _timer) = supervisor();
        supervisor
            .add("g1", gateway_config("1").with_parameter("reject", "always"))
            .await
            .unwrap();

        supervisor
            .modify("g1", gateway_config("2").with_parameter("reject", "always"))
            .await
            .unwrap();
        sleep(Duration::from_millis(1200)).await;

        let status = supervisor.status("g1").unwrap();
        assert_eq!(status.state, InstanceState::Degraded);
        assert_eq!(status.error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_flushes_window_and_closes() {
        let (supervisor, factory, timer) = supervisor();
        supervisor.add("g1", gateway_config("1")).await.unwrap();
        let gateway = factory.instance("g1");

        supervisor.modify("g1", gateway_config("2")).await.unwrap();
        assert!(supervisor.remove("g1").await);

        assert_eq!(gateway.updates.lock().unwrap().len(), 1);
        assert!(gateway.closed.load(Ordering::SeqCst));
        assert!(!supervisor.contains("g1"));
        assert_eq!(timer.window_count(), 0);
        assert!(!supervisor.remove("g1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_despite_close_error() {
        let (supervisor, _factory, _timer) = supervisor();
        supervisor.add("sticky", gateway_config("1")).await.unwrap();

        assert!(supervisor.remove("sticky").await);
        assert!(!supervisor.contains("sticky"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_modify_absent_starts_instance() {
        let (supervisor, _factory, _timer) = supervisor();

        supervisor.modify("g1", gateway_config("1")).await.unwrap();
        assert!(supervisor.contains("g1"));
        assert!(!supervisor.is_updating("g1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let (supervisor, factory, _timer) = supervisor();
        supervisor.add("a", gateway_config("1")).await.unwrap();
        supervisor.add("b", gateway_config("1")).await.unwrap();
        supervisor.modify("b", gateway_config("2")).await.unwrap();

        assert_eq!(supervisor.shutdown().await, 2);
        assert!(supervisor.is_empty());
        assert_eq!(factory.instance("b").updates.lock().unwrap().len(), 1);
        assert_eq!(supervisor.statuses().len(), 0);
    }
}
