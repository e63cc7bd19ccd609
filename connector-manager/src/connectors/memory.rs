//! In-memory connector.
//!
//! Every declared attribute holds a JSON value seeded from its `default`
//! parameter (parsed as JSON, otherwise kept as a string). Events and
//! operations are listed as features but hold no value.
//!
//! Two parameters make it misbehave on purpose: `fail_connect = "true"`
//! refuses instantiation and `fail_update = "true"` rejects reconfiguration.

use crate::connector::{CoalescedUpdate, Connector, ManagedInstance};
use crate::registry::InstanceFactory;
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use snamp::binding::FeatureDescriptor;
use snamp::configuration::{AttributeConfiguration, EntityMap, FeatureKind, ResourceConfiguration};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

pub const FAIL_CONNECT: &str = "fail_connect";
pub const FAIL_UPDATE: &str = "fail_update";
const DEFAULT_VALUE: &str = "default";

struct MemoryState {
    connection_string: String,
    attributes: EntityMap<AttributeConfiguration>,
    features: BTreeMap<String, FeatureKind>,
    values: BTreeMap<String, Value>,
}

impl MemoryState {
    fn new(configuration: &ResourceConfiguration) -> Self {
        let mut state = Self {
            connection_string: String::new(),
            attributes: EntityMap::new(),
            features: BTreeMap::new(),
            values: BTreeMap::new(),
        };
        state.apply(configuration);
        state
    }

    /// Rebuilds the feature set. Attributes whose declaration is unchanged
    /// keep their current value.
    fn apply(&mut self, configuration: &ResourceConfiguration) {
        self.connection_string.clone_from(&configuration.connection_string);

        let mut values = BTreeMap::new();
        for (name, attribute) in configuration.attributes.iter() {
            let value = match (self.attributes.get(name), self.values.remove(name)) {
                (Some(previous), Some(value)) if previous == attribute => value,
                _ => seed_value(attribute),
            };
            values.insert(name.to_string(), value);
        }
        self.values = values;
        self.attributes = configuration.attributes.clone();

        self.features.clear();
        for name in configuration.attributes.names() {
            self.features.insert(name.to_string(), FeatureKind::Attribute);
        }
        for name in configuration.events.names() {
            self.features.insert(name.to_string(), FeatureKind::Event);
        }
        for name in configuration.operations.names() {
            self.features.insert(name.to_string(), FeatureKind::Operation);
        }
    }
}

fn seed_value(attribute: &AttributeConfiguration) -> Value {
    match attribute.parameters.get(DEFAULT_VALUE) {
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone())),
        None => Value::Null,
    }
}

fn flag(configuration: &ResourceConfiguration, key: &str) -> bool {
    configuration.parameters.get(key).is_some_and(|v| v == "true")
}

/// Connector keeping attribute values in process memory.
pub struct MemoryConnector {
    name: String,
    state: RwLock<MemoryState>,
    /// Writes are refused while an update window is open
    suspended: AtomicBool,
    closed: AtomicBool,
}

impl MemoryConnector {
    pub fn new(name: &str, configuration: &ResourceConfiguration) -> Self {
        Self {
            name: name.to_string(),
            state: RwLock::new(MemoryState::new(configuration)),
            suspended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn connection_string(&self) -> String {
        self.read_state().connection_string.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            bail!("resource '{}' is closed", self.name);
        }
        Ok(())
    }

    fn read_state(&self) -> RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ManagedInstance<ResourceConfiguration> for MemoryConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn begin_update(&self) -> Result<()> {
        self.suspended.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn end_update(&self, update: &CoalescedUpdate<ResourceConfiguration>) -> Result<()> {
        // Access resumes whatever the outcome
        self.suspended.store(false, Ordering::SeqCst);
        self.ensure_open()?;
        if flag(&update.configuration, FAIL_UPDATE) {
            bail!("resource '{}' rejected the new configuration", self.name);
        }

        self.write_state().apply(&update.configuration);
        debug!(
            resource = %self.name,
            changes = update.change_count,
            parameters = update.parameters.len(),
            "Memory connector reconfigured"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        info!(resource = %self.name, "Memory connector closed");
        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn list_features(&self) -> Vec<FeatureDescriptor> {
        self.read_state()
            .features
            .iter()
            .map(|(name, kind)| FeatureDescriptor::new(name.clone(), *kind))
            .collect()
    }

    async fn read_feature(&self, name: &str) -> Result<Value> {
        self.ensure_open()?;
        let state = self.read_state();
        match state.features.get(name) {
            Some(FeatureKind::Attribute) => {
                Ok(state.values.get(name).cloned().unwrap_or(Value::Null))
            }
            Some(kind) => bail!("{} '{}' of resource '{}' is not readable", kind, name, self.name),
            None => bail!("resource '{}' has no feature '{}'", self.name, name),
        }
    }

    async fn write_feature(&self, name: &str, value: Value) -> Result<()> {
        self.ensure_open()?;
        if self.suspended.load(Ordering::SeqCst) {
            bail!("resource '{}' is being reconfigured", self.name);
        }
        let mut state = self.write_state();
        match state.features.get(name) {
            Some(FeatureKind::Attribute) => {
                state.values.insert(name.to_string(), value);
                Ok(())
            }
            Some(kind) => bail!("{} '{}' of resource '{}' is not writable", kind, name, self.name),
            None => bail!("resource '{}' has no feature '{}'", self.name, name),
        }
    }
}

/// Factory for the `memory` connector type.
pub struct MemoryConnectorFactory;

#[async_trait]
impl InstanceFactory<ResourceConfiguration, dyn Connector> for MemoryConnectorFactory {
    async fn create(
        &self,
        name: &str,
        configuration: &ResourceConfiguration,
    ) -> Result<Arc<dyn Connector>> {
        if flag(configuration, FAIL_CONNECT) {
            bail!("connection to '{}' refused", configuration.connection_string);
        }
        info!(
            resource = %name,
            connection_string = %configuration.connection_string,
            features = configuration.feature_count(),
            "Memory connector created"
        );
        Ok(Arc::new(MemoryConnector::new(name, configuration)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use snamp::configuration::{EventConfiguration, OperationConfiguration, ParameterDelta};

    fn configuration() -> ResourceConfiguration {
        ResourceConfiguration::new("memory", "mem://plant")
            .with_attribute(
                "temperature",
                AttributeConfiguration::new().with_parameter("default", "21.5"),
            )
            .with_attribute(
                "label",
                AttributeConfiguration::new().with_parameter("default", "boiler"),
            )
            .with_attribute("spare", AttributeConfiguration::new())
            .with_event("overheat", EventConfiguration::new())
            .with_operation("reset", OperationConfiguration::new())
    }

    fn update(configuration: ResourceConfiguration) -> CoalescedUpdate<ResourceConfiguration> {
        CoalescedUpdate {
            configuration,
            parameters: ParameterDelta::default(),
            change_count: 1,
        }
    }

    #[tokio::test]
    async fn test_seeded_values() {
        let connector = MemoryConnector::new("r1", &configuration());

        assert_eq!(connector.read_feature("temperature").await.unwrap(), json!(21.5));
        assert_eq!(connector.read_feature("label").await.unwrap(), json!("boiler"));
        assert_eq!(connector.read_feature("spare").await.unwrap(), Value::Null);
        assert!(connector.read_feature("overheat").await.is_err());
        assert!(connector.read_feature("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_list_features() {
        let connector = MemoryConnector::new("r1", &configuration());
        let features = connector.list_features();

        assert_eq!(features.len(), 5);
        assert!(features.contains(&FeatureDescriptor::event("overheat")));
        assert!(features.contains(&FeatureDescriptor::operation("reset")));
        assert!(features.contains(&FeatureDescriptor::attribute("temperature")));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let connector = MemoryConnector::new("r1", &configuration());

        connector.write_feature("temperature", json!(80)).await.unwrap();
        assert_eq!(connector.read_feature("temperature").await.unwrap(), json!(80));
        assert!(connector.write_feature("reset", json!(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_writes_refused_during_update() {
        let connector = MemoryConnector::new("r1", &configuration());

        connector.begin_update().await.unwrap();
        assert!(connector.write_feature("temperature", json!(1)).await.is_err());
        // Reads keep working
        assert_eq!(connector.read_feature("temperature").await.unwrap(), json!(21.5));

        connector.end_update(&update(configuration())).await.unwrap();
        connector.write_feature("temperature", json!(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_keeps_unchanged_values() {
        let connector = MemoryConnector::new("r1", &configuration());
        connector.write_feature("temperature", json!(30)).await.unwrap();
        connector.write_feature("label", json!("old")).await.unwrap();

        let mut next = configuration();
        next.attributes.remove("spare");
        next.attributes
            .insert("label", AttributeConfiguration::new().with_parameter("default", "furnace"));
        next.connection_string = "mem://plant2".to_string();
        connector.end_update(&update(next)).await.unwrap();

        assert_eq!(connector.read_feature("temperature").await.unwrap(), json!(30));
        // Redeclared attribute is reseeded
        assert_eq!(connector.read_feature("label").await.unwrap(), json!("furnace"));
        assert!(connector.read_feature("spare").await.is_err());
        assert_eq!(connector.connection_string(), "mem://plant2");
    }

    #[tokio::test]
    async fn test_fail_update_flag() {
        let connector = MemoryConnector::new("r1", &configuration());

        let err = connector
            .end_update(&update(configuration().with_parameter(FAIL_UPDATE, "true")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rejected"));
        // State untouched
        assert_eq!(connector.list_features().len(), 5);
    }

    #[tokio::test]
    async fn test_factory_fail_connect() {
        let factory = MemoryConnectorFactory;

        let result = factory
            .create("r1", &configuration().with_parameter(FAIL_CONNECT, "true"))
            .await;
        assert!(result.is_err());

        let connector = factory.create("r1", &configuration()).await.unwrap();
        assert_eq!(connector.name(), "r1");
    }

    #[tokio::test]
    async fn test_closed_connector_refuses_access() {
        let connector = MemoryConnector::new("r1", &configuration());
        connector.close().await.unwrap();

        assert!(connector.is_closed());
        assert!(connector.read_feature("temperature").await.is_err());
    }
}
