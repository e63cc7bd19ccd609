//! Configuration diff engine.
//!
//! Computes the changes needed to turn a baseline configuration into a target
//! one and applies them to the baseline in place. Collections are reconciled
//! per key: names only in the target are added, names only in the baseline
//! are removed, and names in both are modified when the entities differ
//! structurally. A rename is therefore a remove plus an add.

use super::{
    AgentConfiguration, ConfigurationEntity, EntityMap, GatewayConfiguration, Parameters,
    ResourceConfiguration, ResourceGroupConfiguration, ThreadPoolConfiguration,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Kind of a single change record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

/// One change to one named entity of a collection.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum Change<T> {
    Added {
        name: String,
        entity: T,
    },
    Removed {
        name: String,
    },
    /// `entity` is the full target state; `parameters` lists what changed in
    /// the entity's own parameter map.
    Modified {
        name: String,
        entity: T,
        parameters: ParameterDelta,
    },
}

impl<T> Change<T> {
    pub fn name(&self) -> &str {
        match self {
            Change::Added { name, .. }
            | Change::Removed { name }
            | Change::Modified { name, .. } => name,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::Added { .. } => ChangeKind::Added,
            Change::Removed { .. } => ChangeKind::Removed,
            Change::Modified { .. } => ChangeKind::Modified,
        }
    }
}

/// Parameter-level difference between two parameter maps.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDelta {
    /// Keys that were added or whose value changed, with their new value
    pub set: Parameters,
    /// Keys that disappeared
    pub removed: BTreeSet<String>,
}

impl ParameterDelta {
    pub fn between(baseline: &Parameters, target: &Parameters) -> Self {
        let set = target
            .iter()
            .filter(|(key, value)| baseline.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let removed = baseline
            .keys()
            .filter(|key| !target.contains_key(*key))
            .cloned()
            .collect();
        Self { set, removed }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.removed.is_empty()
    }

    /// Number of changed keys.
    pub fn len(&self) -> usize {
        self.set.len() + self.removed.len()
    }

    /// Folds a later delta into this one; the later delta wins per key.
    pub fn merge(&mut self, later: &ParameterDelta) {
        for (key, value) in &later.set {
            self.removed.remove(key);
            self.set.insert(key.clone(), value.clone());
        }
        for key in &later.removed {
            self.set.remove(key);
            self.removed.insert(key.clone());
        }
    }

    pub fn apply_to(&self, parameters: &mut Parameters) {
        for key in &self.removed {
            parameters.remove(key);
        }
        for (key, value) in &self.set {
            parameters.insert(key.clone(), value.clone());
        }
    }

    /// Every key touched by this delta.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.set
            .keys()
            .map(String::as_str)
            .chain(self.removed.iter().map(String::as_str))
    }
}

/// Replaces `baseline` key by key so it ends up with exactly the keys of `target`.
///
/// Returns true if anything changed.
pub fn reconcile_parameters(baseline: &mut Parameters, target: &Parameters) -> bool {
    let before = baseline.len();
    baseline.retain(|key, _| target.contains_key(key));
    let mut changed = baseline.len() != before;
    for (key, value) in target {
        if baseline.get(key) != Some(value) {
            baseline.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

/// Diffs one collection: all adds, then all removes, then all modifies.
pub fn diff_entities<T: ConfigurationEntity>(
    baseline: &EntityMap<T>,
    target: &EntityMap<T>,
) -> Vec<Change<T>> {
    let mut changes = Vec::new();

    for (name, entity) in target.iter() {
        if !baseline.contains(name) {
            changes.push(Change::Added {
                name: name.to_string(),
                entity: entity.clone(),
            });
        }
    }

    for name in baseline.names() {
        if !target.contains(name) {
            changes.push(Change::Removed {
                name: name.to_string(),
            });
        }
    }

    for (name, entity) in target.iter() {
        if let Some(current) = baseline.get(name) {
            if current != entity {
                changes.push(Change::Modified {
                    name: name.to_string(),
                    entity: entity.clone(),
                    parameters: ParameterDelta::between(current.parameters(), entity.parameters()),
                });
            }
        }
    }

    changes
}

/// Applies changes to a collection, returning how many actually changed it.
///
/// Applying the same changes again is a no-op and returns 0.
pub fn apply_changes<T: ConfigurationEntity>(
    map: &mut EntityMap<T>,
    changes: &[Change<T>],
) -> usize {
    let mut applied = 0;
    for change in changes {
        match change {
            Change::Added { name, entity } | Change::Modified { name, entity, .. } => {
                match map.get_mut(name) {
                    Some(current) if current == entity => {}
                    Some(current) => {
                        current.overwrite_from(entity);
                        applied += 1;
                    }
                    None => {
                        map.insert(name.clone(), entity.clone());
                        applied += 1;
                    }
                }
            }
            Change::Removed { name } => {
                if map.remove(name).is_some() {
                    applied += 1;
                }
            }
        }
    }
    applied
}

/// Makes `baseline` equal to `target` in place.
pub fn reconcile<T: ConfigurationEntity>(
    baseline: &mut EntityMap<T>,
    target: &EntityMap<T>,
) -> usize {
    let changes = diff_entities(baseline, target);
    apply_changes(baseline, &changes)
}

/// Per-kind counts of a changeset, for logging and reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
}

impl ChangeSummary {
    fn record<T>(&mut self, changes: &[Change<T>]) {
        for change in changes {
            match change.kind() {
                ChangeKind::Added => self.added += 1,
                ChangeKind::Removed => self.removed += 1,
                ChangeKind::Modified => self.modified += 1,
            }
        }
    }
}

/// Ordered set of changes between two agent configurations.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Changeset {
    /// Agent-wide parameter changes (not counted as top-level changes)
    pub parameters: ParameterDelta,
    pub resources: Vec<Change<ResourceConfiguration>>,
    pub resource_groups: Vec<Change<ResourceGroupConfiguration>>,
    pub gateways: Vec<Change<GatewayConfiguration>>,
    pub thread_pools: Vec<Change<ThreadPoolConfiguration>>,
}

impl Changeset {
    pub fn compute(baseline: &AgentConfiguration, target: &AgentConfiguration) -> Self {
        Self {
            parameters: ParameterDelta::between(&baseline.parameters, &target.parameters),
            resources: diff_entities(&baseline.resources, &target.resources),
            resource_groups: diff_entities(&baseline.resource_groups, &target.resource_groups),
            gateways: diff_entities(&baseline.gateways, &target.gateways),
            thread_pools: diff_entities(&baseline.thread_pools, &target.thread_pools),
        }
    }

    /// Number of top-level entity changes.
    ///
    /// Feature changes inside a modified resource are part of that resource's
    /// single Modify and are not counted separately.
    pub fn len(&self) -> usize {
        self.resources.len()
            + self.resource_groups.len()
            + self.gateways.len()
            + self.thread_pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.parameters.is_empty()
    }

    /// Applies the changeset to `baseline`, returning the number of top-level
    /// entities it actually changed.
    pub fn apply(&self, baseline: &mut AgentConfiguration) -> usize {
        self.parameters.apply_to(&mut baseline.parameters);
        apply_changes(&mut baseline.resources, &self.resources)
            + apply_changes(&mut baseline.resource_groups, &self.resource_groups)
            + apply_changes(&mut baseline.gateways, &self.gateways)
            + apply_changes(&mut baseline.thread_pools, &self.thread_pools)
    }

    pub fn summary(&self) -> ChangeSummary {
        let mut summary = ChangeSummary::default();
        summary.record(&self.resources);
        summary.record(&self.resource_groups);
        summary.record(&self.gateways);
        summary.record(&self.thread_pools);
        summary
    }

    /// Names of resource groups that were added, removed or modified.
    pub fn touched_groups(&self) -> BTreeSet<&str> {
        self.resource_groups.iter().map(Change::name).collect()
    }
}

/// Diffs `target` against `baseline` and applies the result to `baseline`.
///
/// Returns the number of top-level Add/Remove/Modify operations.
pub fn diff_and_apply(baseline: &mut AgentConfiguration, target: &AgentConfiguration) -> usize {
    Changeset::compute(baseline, target).apply(baseline)
}
