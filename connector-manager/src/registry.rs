//! Plugin registry - maps connector and gateway type names to factories.
//!
//! Factories are registered explicitly at startup; nothing is discovered at
//! runtime.

use crate::connector::{Connector, FeatureBindings, Gateway};
use crate::connectors::memory::MemoryConnectorFactory;
use crate::gateways::journal::JournalGatewayFactory;
use anyhow::Result;
use async_trait::async_trait;
use snamp::configuration::{GatewayConfiguration, ResourceConfiguration};
use std::collections::HashMap;
use std::sync::Arc;

/// Creates live instances of one plugin type.
#[async_trait]
pub trait InstanceFactory<C, I: ?Sized>: Send + Sync {
    /// Instantiates `name` with its resolved configuration.
    ///
    /// Connection failures are returned as errors; the caller keeps the
    /// instance out of the active set.
    async fn create(&self, name: &str, configuration: &C) -> Result<Arc<I>>;
}

pub type ConnectorFactory = dyn InstanceFactory<ResourceConfiguration, dyn Connector>;
pub type GatewayFactory = dyn InstanceFactory<GatewayConfiguration, dyn Gateway>;

/// Type name to factory, for one kind of instance.
pub type FactoryMap<C, I> = HashMap<String, Arc<dyn InstanceFactory<C, I>>>;

/// All known connector and gateway types.
#[derive(Default)]
pub struct PluginRegistry {
    connectors: FactoryMap<ResourceConfiguration, dyn Connector>,
    gateways: FactoryMap<GatewayConfiguration, dyn Gateway>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connector type, replacing any previous factory of that name.
    pub fn register_connector(
        &mut self,
        type_name: impl Into<String>,
        factory: Arc<ConnectorFactory>,
    ) {
        self.connectors.insert(type_name.into(), factory);
    }

    pub fn register_gateway(&mut self, type_name: impl Into<String>, factory: Arc<GatewayFactory>) {
        self.gateways.insert(type_name.into(), factory);
    }

    pub fn connector_factory(&self, type_name: &str) -> Option<Arc<ConnectorFactory>> {
        self.connectors.get(type_name).cloned()
    }

    pub fn gateway_factory(&self, type_name: &str) -> Option<Arc<GatewayFactory>> {
        self.gateways.get(type_name).cloned()
    }

    pub fn connector_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.connectors.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn gateway_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.gateways.keys().cloned().collect();
        types.sort();
        types
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        FactoryMap<ResourceConfiguration, dyn Connector>,
        FactoryMap<GatewayConfiguration, dyn Gateway>,
    ) {
        (self.connectors, self.gateways)
    }
}

/// Registry with the built-in plugins: the `memory` connector and the
/// `journal` gateway.
pub fn builtin_registry(bindings: Arc<FeatureBindings>) -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry.register_connector("memory", Arc::new(MemoryConnectorFactory));
    registry.register_gateway("journal", Arc::new(JournalGatewayFactory::new(bindings)));
    registry
}
