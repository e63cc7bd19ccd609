//! Journal gateway.
//!
//! Mirrors the set of bound features per resource by following binding
//! events, and logs every change. It stands in for real protocol gateways
//! (SNMP, NSCA, XMPP) which would maintain an OID tree or endpoint set the
//! same way.

use crate::connector::{CoalescedUpdate, FeatureBindings, Gateway, ManagedInstance};
use crate::registry::InstanceFactory;
use anyhow::Result;
use async_trait::async_trait;
use snamp::binding::{BindingEvent, FeatureDescriptor};
use snamp::configuration::GatewayConfiguration;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Only resources matching this parameter (exact name) are mirrored.
pub const RESOURCE_FILTER: &str = "resource";

type Exposed = BTreeMap<String, BTreeMap<String, FeatureDescriptor>>;

/// Gateway keeping a journal of exposed features.
pub struct JournalGateway {
    name: String,
    bindings: Arc<FeatureBindings>,
    filter: Arc<RwLock<Option<String>>>,
    exposed: Arc<RwLock<Exposed>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl JournalGateway {
    /// Creates the gateway and starts following `bindings`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        name: &str,
        configuration: &GatewayConfiguration,
        bindings: Arc<FeatureBindings>,
    ) -> Self {
        let filter = Arc::new(RwLock::new(
            configuration.parameters.get(RESOURCE_FILTER).cloned(),
        ));
        let exposed = Arc::new(RwLock::new(Exposed::new()));

        // Subscribe before seeding so nothing bound in between is missed
        let mut subscription = bindings.subscribe();
        reseed(&exposed, &filter, name, &bindings);

        let task = {
            let exposed = Arc::clone(&exposed);
            let filter = Arc::clone(&filter);
            let name = name.to_string();
            tokio::spawn(async move {
                while let Some(event) = subscription.recv().await {
                    record(&exposed, &filter, &name, &event);
                }
                debug!(gateway = %name, "Binding event stream ended");
            })
        };

        Self {
            name: name.to_string(),
            bindings,
            filter,
            exposed,
            task: Mutex::new(Some(task)),
        }
    }
}

/// Rebuilds the exposed set from the registry under the current filter.
fn reseed(
    exposed: &RwLock<Exposed>,
    filter: &RwLock<Option<String>>,
    gateway: &str,
    bindings: &FeatureBindings,
) {
    exposed
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
    for resource in bindings.resources() {
        for descriptor in bindings.features(&resource) {
            let event = BindingEvent::Bound {
                resource: resource.clone(),
                feature: descriptor,
            };
            record(exposed, filter, gateway, &event);
        }
    }
}

fn record(
    exposed: &RwLock<Exposed>,
    filter: &RwLock<Option<String>>,
    gateway: &str,
    event: &BindingEvent,
) {
    let accepted = filter
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .as_deref()
        .map_or(true, |only| only == event.resource());
    if !accepted {
        return;
    }

    let mut exposed = exposed.write().unwrap_or_else(PoisonError::into_inner);
    match event {
        BindingEvent::Bound { resource, feature } => {
            exposed
                .entry(resource.clone())
                .or_default()
                .insert(feature.name.clone(), feature.clone());
            info!(
                gateway = %gateway,
                resource = %resource,
                feature = %feature.name,
                "Feature exposed"
            );
        }
        BindingEvent::Unbound { resource, feature } => {
            if let Some(features) = exposed.get_mut(resource) {
                features.remove(&feature.name);
                if features.is_empty() {
                    exposed.remove(resource);
                }
            }
            info!(
                gateway = %gateway,
                resource = %resource,
                feature = %feature.name,
                "Feature withdrawn"
            );
        }
    }
}

#[async_trait]
impl ManagedInstance<GatewayConfiguration> for JournalGateway {
    fn name(&self) -> &str {
        &self.name
    }

    async fn end_update(&self, update: &CoalescedUpdate<GatewayConfiguration>) -> Result<()> {
        let filter = update.configuration.parameters.get(RESOURCE_FILTER).cloned();
        let changed = {
            let mut current = self.filter.write().unwrap_or_else(PoisonError::into_inner);
            let changed = *current != filter;
            *current = filter;
            changed
        };
        if changed {
            reseed(&self.exposed, &self.filter, &self.name, &self.bindings);
        }
        info!(
            gateway = %self.name,
            changes = update.change_count,
            parameters = update.parameters.len(),
            "Journal gateway reconfigured"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.abort();
        }
        info!(gateway = %self.name, "Journal gateway closed");
        Ok(())
    }
}

impl Gateway for JournalGateway {
    fn exposed_features(&self) -> BTreeMap<String, Vec<FeatureDescriptor>> {
        self.exposed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(resource, features)| (resource.clone(), features.values().cloned().collect()))
            .collect()
    }
}

/// Factory for the `journal` gateway type.
pub struct JournalGatewayFactory {
    bindings: Arc<FeatureBindings>,
}

impl JournalGatewayFactory {
    pub fn new(bindings: Arc<FeatureBindings>) -> Self {
        Self { bindings }
    }
}

#[async_trait]
impl InstanceFactory<GatewayConfiguration, dyn Gateway> for JournalGatewayFactory {
    async fn create(
        &self,
        name: &str,
        configuration: &GatewayConfiguration,
    ) -> Result<Arc<dyn Gateway>> {
        let gateway = JournalGateway::start(name, configuration, Arc::clone(&self.bindings));
        info!(gateway = %name, "Journal gateway created");
        Ok(Arc::new(gateway))
    }
}
