use crate::error::SnampError;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::{self, Entry};
use std::collections::BTreeMap;
use std::fmt;

/// Free-form parameters attached to every configuration entity.
///
/// Keys are unique, the last write wins. Ordering carries no meaning; a
/// `BTreeMap` only keeps persisted files stable.
pub type Parameters = BTreeMap<String, String>;

/// Every kind of configurable thing known to the agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Resource,
    ResourceGroup,
    Gateway,
    ThreadPool,
    Attribute,
    Event,
    Operation,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EntityKind::Resource => "resource",
            EntityKind::ResourceGroup => "resource group",
            EntityKind::Gateway => "gateway",
            EntityKind::ThreadPool => "thread pool",
            EntityKind::Attribute => "attribute",
            EntityKind::Event => "event",
            EntityKind::Operation => "operation",
        };
        f.write_str(label)
    }
}

/// The subset of entity kinds a connector exposes at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Attribute,
    Event,
    Operation,
}

impl From<FeatureKind> for EntityKind {
    fn from(kind: FeatureKind) -> Self {
        match kind {
            FeatureKind::Attribute => EntityKind::Attribute,
            FeatureKind::Event => EntityKind::Event,
            FeatureKind::Operation => EntityKind::Operation,
        }
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        EntityKind::from(*self).fmt(f)
    }
}

/// Shared behaviour of all configuration entities.
///
/// Equality is structural: two entities are equal iff their typed fields,
/// nested collections and parameter maps are equal.
pub trait ConfigurationEntity: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    const KIND: EntityKind;

    fn parameters(&self) -> &Parameters;

    fn parameters_mut(&mut self) -> &mut Parameters;

    /// Makes `self` structurally equal to `target`.
    ///
    /// Nested collections are reconciled key by key instead of being replaced
    /// wholesale, so unchanged children keep their allocation.
    fn overwrite_from(&mut self, target: &Self);
}

/// Named collection of entities of one kind.
///
/// Names are unique within the collection; iteration order is unspecified.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityMap<T> {
    entries: BTreeMap<String, T>,
}

impl<T> Default for EntityMap<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T: ConfigurationEntity> EntityMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a new entity. Fails with `ConfigurationKeyConflict` if the name is taken.
    pub fn add(&mut self, name: impl Into<String>, entity: T) -> Result<&mut T, SnampError> {
        match self.entries.entry(name.into()) {
            Entry::Occupied(e) => Err(SnampError::ConfigurationKeyConflict {
                kind: T::KIND,
                name: e.key().clone(),
            }),
            Entry::Vacant(e) => Ok(e.insert(entity)),
        }
    }

    /// Inserts or replaces an entity, returning the previous one.
    pub fn insert(&mut self, name: impl Into<String>, entity: T) -> Option<T> {
        self.entries.insert(name.into(), entity)
    }

    /// Removes an entity. Absent names are a no-op.
    pub fn remove(&mut self, name: &str) -> Option<T> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut T> {
        self.entries.get_mut(name)
    }

    /// Returns the entity under `name`, inserting `T::default()` first if absent.
    pub fn get_or_insert_default(&mut self, name: &str) -> &mut T
    where
        T: Default,
    {
        self.entries.entry(name.to_string()).or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<'a, T> IntoIterator for &'a EntityMap<T> {
    type Item = (&'a String, &'a T);
    type IntoIter = btree_map::Iter<'a, String, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl<T: ConfigurationEntity> FromIterator<(String, T)> for EntityMap<T> {
    fn from_iter<I: IntoIterator<Item = (String, T)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

/// Declared attribute of a managed resource.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeConfiguration {
    /// Upper bound for a single read or write, if the connector honours one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_write_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Parameters::is_empty")]
    pub parameters: Parameters,
}

/// Declared notification source of a managed resource.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfiguration {
    #[serde(skip_serializing_if = "Parameters::is_empty")]
    pub parameters: Parameters,
}

/// Declared invocable operation of a managed resource.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invocation_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Parameters::is_empty")]
    pub parameters: Parameters,
}

impl AttributeConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.read_write_timeout_ms = Some(timeout_ms);
        self
    }
}

impl EventConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

impl OperationConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.invocation_timeout_ms = Some(timeout_ms);
        self
    }
}

// ---------------------------------------------------------------------------
// Top-level entities
// ---------------------------------------------------------------------------

/// A managed resource: one connector instance talking to one external system.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfiguration {
    /// Connector type handling this resource (e.g. "jmx", "snmp").
    pub connection_type: String,
    /// Opaque connector-specific address.
    pub connection_string: String,
    /// Resource group this resource inherits parameters and features from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Parameters::is_empty")]
    pub parameters: Parameters,
    #[serde(skip_serializing_if = "EntityMap::is_empty")]
    pub attributes: EntityMap<AttributeConfiguration>,
    #[serde(skip_serializing_if = "EntityMap::is_empty")]
    pub events: EntityMap<EventConfiguration>,
    #[serde(skip_serializing_if = "EntityMap::is_empty")]
    pub operations: EntityMap<OperationConfiguration>,
}

/// Shared settings inherited by every resource referencing the group.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceGroupConfiguration {
    pub connection_type: String,
    #[serde(skip_serializing_if = "Parameters::is_empty")]
    pub parameters: Parameters,
    #[serde(skip_serializing_if = "EntityMap::is_empty")]
    pub attributes: EntityMap<AttributeConfiguration>,
    #[serde(skip_serializing_if = "EntityMap::is_empty")]
    pub events: EntityMap<EventConfiguration>,
    #[serde(skip_serializing_if = "EntityMap::is_empty")]
    pub operations: EntityMap<OperationConfiguration>,
}

/// A gateway republishing connector features through some outward protocol.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfiguration {
    pub gateway_type: String,
    #[serde(skip_serializing_if = "Parameters::is_empty")]
    pub parameters: Parameters,
}

/// Worker pool shared by connectors and gateways.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolConfiguration {
    pub min_pool_size: u32,
    pub max_pool_size: u32,
    /// Bounded queue capacity; `None` means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<u32>,
    pub keep_alive_ms: u64,
    #[serde(skip_serializing_if = "Parameters::is_empty")]
    pub parameters: Parameters,
}

impl Default for ThreadPoolConfiguration {
    fn default() -> Self {
        Self {
            min_pool_size: 0,
            max_pool_size: 2,
            queue_size: None,
            keep_alive_ms: 1000,
            parameters: Parameters::new(),
        }
    }
}

impl ResourceConfiguration {
    pub fn new(connection_type: impl Into<String>, connection_string: impl Into<String>) -> Self {
        Self {
            connection_type: connection_type.into(),
            connection_string: connection_string.into(),
            ..Self::default()
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_attribute(
        mut self,
        name: impl Into<String>,
        attribute: AttributeConfiguration,
    ) -> Self {
        self.attributes.insert(name, attribute);
        self
    }

    pub fn with_event(mut self, name: impl Into<String>, event: EventConfiguration) -> Self {
        self.events.insert(name, event);
        self
    }

    pub fn with_operation(
        mut self,
        name: impl Into<String>,
        operation: OperationConfiguration,
    ) -> Self {
        self.operations.insert(name, operation);
        self
    }

    /// Number of declared features across all three feature collections.
    pub fn feature_count(&self) -> usize {
        self.attributes.len() + self.events.len() + self.operations.len()
    }
}

impl ResourceGroupConfiguration {
    pub fn new(connection_type: impl Into<String>) -> Self {
        Self {
            connection_type: connection_type.into(),
            ..Self::default()
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_attribute(
        mut self,
        name: impl Into<String>,
        attribute: AttributeConfiguration,
    ) -> Self {
        self.attributes.insert(name, attribute);
        self
    }
}

impl GatewayConfiguration {
    pub fn new(gateway_type: impl Into<String>) -> Self {
        Self {
            gateway_type: gateway_type.into(),
            parameters: Parameters::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// ConfigurationEntity impls
// ---------------------------------------------------------------------------

macro_rules! plain_entity {
    ($ty:ty, $kind:expr) => {
        impl ConfigurationEntity for $ty {
            const KIND: EntityKind = $kind;

            fn parameters(&self) -> &Parameters {
                &self.parameters
            }

            fn parameters_mut(&mut self) -> &mut Parameters {
                &mut self.parameters
            }

            fn overwrite_from(&mut self, target: &Self) {
                let parameters = std::mem::take(&mut self.parameters);
                *self = Self {
                    parameters,
                    ..target.clone()
                };
                super::diff::reconcile_parameters(&mut self.parameters, &target.parameters);
            }
        }
    };
}

plain_entity!(AttributeConfiguration, EntityKind::Attribute);
plain_entity!(EventConfiguration, EntityKind::Event);
plain_entity!(OperationConfiguration, EntityKind::Operation);
plain_entity!(GatewayConfiguration, EntityKind::Gateway);
plain_entity!(ThreadPoolConfiguration, EntityKind::ThreadPool);

impl ConfigurationEntity for ResourceConfiguration {
    const KIND: EntityKind = EntityKind::Resource;

    fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.parameters
    }

    fn overwrite_from(&mut self, target: &Self) {
        use super::diff::{reconcile, reconcile_parameters};

        self.connection_type.clone_from(&target.connection_type);
        self.connection_string.clone_from(&target.connection_string);
        self.group.clone_from(&target.group);
        reconcile_parameters(&mut self.parameters, &target.parameters);
        reconcile(&mut self.attributes, &target.attributes);
        reconcile(&mut self.events, &target.events);
        reconcile(&mut self.operations, &target.operations);
    }
}

impl ConfigurationEntity for ResourceGroupConfiguration {
    const KIND: EntityKind = EntityKind::ResourceGroup;

    fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.parameters
    }

    fn overwrite_from(&mut self, target: &Self) {
        use super::diff::{reconcile, reconcile_parameters};

        self.connection_type.clone_from(&target.connection_type);
        reconcile_parameters(&mut self.parameters, &target.parameters);
        reconcile(&mut self.attributes, &target.attributes);
        reconcile(&mut self.events, &target.events);
        reconcile(&mut self.operations, &target.operations);
    }
}
