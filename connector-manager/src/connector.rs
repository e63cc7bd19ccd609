use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use snamp::binding::{BindingRegistry, FeatureDescriptor};
use snamp::configuration::{GatewayConfiguration, ParameterDelta, ResourceConfiguration};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Everything collected by one update window, handed to the instance at once.
#[derive(Clone, Debug, PartialEq)]
pub struct CoalescedUpdate<C> {
    /// Configuration the instance must end up with
    pub configuration: C,
    /// Merged parameter changes relative to the previously applied configuration
    pub parameters: ParameterDelta,
    /// Number of changes folded into this update (0 for a rollback)
    pub change_count: usize,
}

/// Lifecycle hooks shared by connectors and gateways.
///
/// Instances are created by a factory with their resolved configuration and
/// afterwards only reconfigured through `begin_update` / `end_update`. The
/// manager guarantees the two hooks never overlap for the same instance.
#[async_trait]
pub trait ManagedInstance<C>: Send + Sync {
    /// Instance name as declared in configuration.
    fn name(&self) -> &str;

    /// Called when a burst of changes starts. Default: nothing to suspend.
    async fn begin_update(&self) -> Result<()> {
        Ok(())
    }

    /// Applies the coalesced changes of one update window in a single pass.
    ///
    /// On error the manager re-applies the previous configuration through
    /// this same hook, so implementations must accept being handed an older
    /// configuration.
    async fn end_update(&self, update: &CoalescedUpdate<C>) -> Result<()>;

    /// Releases the instance. Called once; errors are logged, not retried.
    async fn close(&self) -> Result<()>;
}

/// A managed resource connector.
///
/// Exposes the features of one external system. Values are untyped JSON;
/// connectors document their own value shapes.
#[async_trait]
pub trait Connector: ManagedInstance<ResourceConfiguration> {
    /// Features currently enabled by the connector.
    fn list_features(&self) -> Vec<FeatureDescriptor>;

    async fn read_feature(&self, name: &str) -> Result<Value>;

    async fn write_feature(&self, name: &str, value: Value) -> Result<()>;
}

/// A gateway republishing connector features through some outward protocol.
pub trait Gateway: ManagedInstance<GatewayConfiguration> {
    /// Features the gateway currently exposes, per resource.
    fn exposed_features(&self) -> BTreeMap<String, Vec<FeatureDescriptor>>;
}

/// Live handle on one bound feature of a running connector.
#[derive(Clone)]
pub struct FeatureAccessor {
    resource: String,
    descriptor: FeatureDescriptor,
    connector: Arc<dyn Connector>,
}

impl FeatureAccessor {
    pub fn new(
        resource: &str,
        descriptor: FeatureDescriptor,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            resource: resource.to_string(),
            descriptor,
            connector,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn descriptor(&self) -> &FeatureDescriptor {
        &self.descriptor
    }

    pub async fn read(&self) -> Result<Value> {
        self.connector.read_feature(&self.descriptor.name).await
    }

    pub async fn write(&self, value: Value) -> Result<()> {
        self.connector.write_feature(&self.descriptor.name, value).await
    }
}

impl fmt::Debug for FeatureAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureAccessor")
            .field("resource", &self.resource)
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Binding registry holding connector feature accessors.
pub type FeatureBindings = BindingRegistry<FeatureAccessor>;

/// Brings the bindings of `resource` in line with what `connector` exposes.
///
/// Features that disappeared (or changed kind) are unbound, new ones bound.
/// Returns the number of bindings touched.
pub fn sync_bindings(
    bindings: &FeatureBindings,
    resource: &str,
    connector: &Arc<dyn Connector>,
) -> usize {
    let exposed = connector.list_features();
    let bound = bindings.features(resource);
    let mut touched = 0;

    for descriptor in &bound {
        if !exposed.contains(descriptor) {
            bindings.unbind(resource, &descriptor.name);
            touched += 1;
        }
    }

    for descriptor in exposed {
        if bound.contains(&descriptor) {
            continue;
        }
        let accessor = FeatureAccessor::new(resource, descriptor.clone(), Arc::clone(connector));
        match bindings.bind(resource, descriptor, accessor) {
            Ok(()) => touched += 1,
            Err(e) => warn!(resource = %resource, error = %e, "Failed to bind feature"),
        }
    }

    touched
}
