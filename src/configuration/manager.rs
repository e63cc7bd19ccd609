use super::{AgentConfiguration, Changeset, GatewayConfiguration, ResourceConfiguration};
use crate::persistence::ConfigurationStore;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Outcome of applying a target configuration to the baseline.
#[derive(Clone, Debug)]
pub struct AppliedChanges {
    /// Changes computed against the previous baseline
    pub changeset: Changeset,
    /// Number of top-level entities changed
    pub change_count: usize,
    /// Baseline version after the apply
    pub version: u64,
}

/// Owner of the currently applied baseline configuration.
///
/// The baseline is only mutated through [`apply`](Self::apply) and friends,
/// under a single writer lock. Readers get a cloned snapshot instead of
/// holding the lock.
pub struct ConfigurationManager {
    baseline: RwLock<AgentConfiguration>,
    /// Bumped every time the baseline changes
    version: AtomicU64,
    store: Option<Arc<dyn ConfigurationStore>>,
}

impl ConfigurationManager {
    /// Creates a manager whose baseline is `initial`, without persistence.
    pub fn new(initial: AgentConfiguration) -> Self {
        Self {
            baseline: RwLock::new(initial),
            version: AtomicU64::new(0),
            store: None,
        }
    }

    /// Creates a manager with an empty baseline backed by `store`.
    ///
    /// The stored configuration is not applied here; callers load it with
    /// [`load_target`](Self::load_target) and run it through a reconcile cycle
    /// so the running instances are created.
    pub fn with_store(store: Arc<dyn ConfigurationStore>) -> Self {
        Self {
            baseline: RwLock::new(AgentConfiguration::default()),
            version: AtomicU64::new(0),
            store: Some(store),
        }
    }

    pub fn store(&self) -> Option<&Arc<dyn ConfigurationStore>> {
        self.store.as_ref()
    }

    /// Deep copy of the current baseline.
    pub fn snapshot(&self) -> AgentConfiguration {
        self.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Diffs `target` against the baseline and applies the changes.
    pub fn apply(&self, target: &AgentConfiguration) -> AppliedChanges {
        let mut baseline = self.write();
        let changeset = Changeset::compute(&baseline, target);
        let change_count = changeset.apply(&mut baseline);
        let version = if changeset.is_empty() {
            self.version.load(Ordering::SeqCst)
        } else {
            self.version.fetch_add(1, Ordering::SeqCst) + 1
        };
        drop(baseline);

        if changeset.is_empty() {
            debug!(version = version, "Configuration unchanged");
        } else {
            let summary = changeset.summary();
            info!(
                version = version,
                added = summary.added,
                removed = summary.removed,
                modified = summary.modified,
                "Configuration applied"
            );
        }

        AppliedChanges {
            changeset,
            change_count,
            version,
        }
    }

    /// Clones the baseline, lets `edit` mutate the copy, then applies it.
    pub fn update<F>(&self, edit: F) -> AppliedChanges
    where
        F: FnOnce(&mut AgentConfiguration),
    {
        let mut target = self.snapshot();
        edit(&mut target);
        self.apply(&target)
    }

    /// Drops resources and gateways from the baseline without touching the
    /// running system.
    ///
    /// Used for entities whose activation failed, so the next diff against
    /// the same target sees them as new and retries them.
    pub fn discard(&self, resources: &[String], gateways: &[String]) -> usize {
        if resources.is_empty() && gateways.is_empty() {
            return 0;
        }
        let mut baseline = self.write();
        let mut removed = 0;
        for name in resources {
            if baseline.resources.remove(name).is_some() {
                removed += 1;
            }
        }
        for name in gateways {
            if baseline.gateways.remove(name).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            self.version.fetch_add(1, Ordering::SeqCst);
            debug!(count = removed, "Discarded failed entities from baseline");
        }
        removed
    }

    /// Puts back the configuration running instances ended up with after
    /// rejecting an update.
    ///
    /// Entries no longer in the baseline are skipped. The next diff against
    /// the rejected target sees the entry as modified and queues it again.
    pub fn revert(
        &self,
        resources: &[(String, ResourceConfiguration)],
        gateways: &[(String, GatewayConfiguration)],
    ) -> usize {
        if resources.is_empty() && gateways.is_empty() {
            return 0;
        }
        let mut baseline = self.write();
        let mut reverted = 0;
        for (name, configuration) in resources {
            if let Some(entry) = baseline.resources.get_mut(name) {
                if entry != configuration {
                    *entry = configuration.clone();
                    reverted += 1;
                }
            }
        }
        for (name, configuration) in gateways {
            if let Some(entry) = baseline.gateways.get_mut(name) {
                if entry != configuration {
                    *entry = configuration.clone();
                    reverted += 1;
                }
            }
        }
        if reverted > 0 {
            self.version.fetch_add(1, Ordering::SeqCst);
            debug!(count = reverted, "Reverted rejected entities in baseline");
        }
        reverted
    }

    /// Loads the persisted target configuration, if a store is attached.
    pub fn load_target(&self) -> Result<Option<AgentConfiguration>> {
        match &self.store {
            Some(store) => store
                .load()
                .context("Failed to load configuration from store")
                .map(Some),
            None => Ok(None),
        }
    }

    /// Persists the current baseline. Returns false when no store is attached.
    pub fn save(&self) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let snapshot = self.snapshot();
        store
            .save(&snapshot)
            .context("Failed to save configuration to store")?;
        info!(
            entities = snapshot.entity_count(),
            version = self.version(),
            "Configuration saved"
        );
        Ok(true)
    }

    fn read(&self) -> RwLockReadGuard<'_, AgentConfiguration> {
        self.baseline.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, AgentConfiguration> {
        self.baseline.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ConfigurationManager {
    fn default() -> Self {
        Self::new(AgentConfiguration::default())
    }
}
