//! Configuration entity model.
//!
//! An [`AgentConfiguration`] is the root aggregate: four named collections
//! (resources, resource groups, gateways, thread pools) plus global
//! parameters. Cloning it is a full deep copy, which is what the diff engine
//! relies on when a caller mutates a working copy against the live baseline.

mod entity;
pub mod diff;
pub mod manager;


pub use diff::{diff_and_apply, Change, ChangeKind, Changeset, ParameterDelta};
pub use entity::{
    AttributeConfiguration, ConfigurationEntity, EntityKind, EntityMap, EventConfiguration,
    FeatureKind, GatewayConfiguration, OperationConfiguration, Parameters,
    ResourceConfiguration, ResourceGroupConfiguration, ThreadPoolConfiguration,
};
pub use manager::{AppliedChanges, ConfigurationManager};

use serde::{Deserialize, Serialize};

/// Root configuration of a running agent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfiguration {
    /// Agent-wide parameters
    #[serde(skip_serializing_if = "Parameters::is_empty")]
    pub parameters: Parameters,
    pub resources: EntityMap<ResourceConfiguration>,
    pub resource_groups: EntityMap<ResourceGroupConfiguration>,
    pub gateways: EntityMap<GatewayConfiguration>,
    pub thread_pools: EntityMap<ThreadPoolConfiguration>,
}

impl AgentConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes every entity and global parameter.
    pub fn clear(&mut self) {
        self.parameters.clear();
        self.resources.clear();
        self.resource_groups.clear();
        self.gateways.clear();
        self.thread_pools.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
            && self.resources.is_empty()
            && self.resource_groups.is_empty()
            && self.gateways.is_empty()
            && self.thread_pools.is_empty()
    }

    /// Total number of top-level entities.
    pub fn entity_count(&self) -> usize {
        self.resources.len()
            + self.resource_groups.len()
            + self.gateways.len()
            + self.thread_pools.len()
    }

    /// Returns the resource with its group inheritance applied.
    ///
    /// Local parameters override group parameters, an empty local connection
    /// type falls back to the group's, and group features are added where the
    /// resource does not declare a feature of the same name. A reference to a
    /// group that does not exist is left unresolved.
    pub fn resolve_resource(&self, name: &str) -> Option<ResourceConfiguration> {
        let resource = self.resources.get(name)?;
        let group = resource
            .group
            .as_deref()
            .and_then(|g| self.resource_groups.get(g));

        let Some(group) = group else {
            return Some(resource.clone());
        };

        let mut resolved = resource.clone();
        if resolved.connection_type.is_empty() {
            resolved.connection_type.clone_from(&group.connection_type);
        }
        for (key, value) in &group.parameters {
            resolved
                .parameters
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        for (feature, attribute) in &group.attributes {
            if !resolved.attributes.contains(feature) {
                resolved.attributes.insert(feature.clone(), attribute.clone());
            }
        }
        for (feature, event) in &group.events {
            if !resolved.events.contains(feature) {
                resolved.events.insert(feature.clone(), event.clone());
            }
        }
        for (feature, operation) in &group.operations {
            if !resolved.operations.contains(feature) {
                resolved.operations.insert(feature.clone(), operation.clone());
            }
        }
        Some(resolved)
    }

    /// Names of resources referencing `group`.
    pub fn resources_in_group<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.resources
            .iter()
            .filter(move |(_, r)| r.group.as_deref() == Some(group))
            .map(|(name, _)| name)
    }
}
