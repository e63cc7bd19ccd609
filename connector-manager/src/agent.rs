//! Agent - ties the configuration baseline to the running system.
//!
//! A reconcile cycle diffs a target configuration against the baseline,
//! routes the changes to the lifecycle manager, persists the result and
//! finally forgets entities whose activation failed so the next cycle
//! retries them. Updates an instance rejected after its window expired are
//! picked up by the next cycle: they are reported, and the baseline entry is
//! put back to what the instance runs so the same target is queued again.
//! Cycles never overlap.

use crate::manager::{ApplyReport, LifecycleManager};
use anyhow::Result;
use serde::Serialize;
use snamp::config::SharedRuntimeSettings;
use snamp::configuration::{AgentConfiguration, ConfigurationManager, EntityKind};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Result of one reconcile cycle.
#[derive(Clone, Debug, Serialize)]
pub struct ReconcileOutcome {
    pub cycle_id: Uuid,
    /// Top-level entities changed in the baseline
    pub change_count: usize,
    /// Baseline version once the cycle completed
    pub version: u64,
    #[serde(flatten)]
    pub report: ApplyReport,
    /// Whether the baseline was written to the store
    pub saved: bool,
}

impl ReconcileOutcome {
    pub fn is_success(&self) -> bool {
        self.report.is_success()
    }
}

/// The configuration manager and the lifecycle manager, driven together.
pub struct Agent {
    configuration: ConfigurationManager,
    lifecycle: LifecycleManager,
    settings: SharedRuntimeSettings,
    save_on_apply: bool,
    cycle: Mutex<()>,
}

impl Agent {
    pub fn new(
        configuration: ConfigurationManager,
        lifecycle: LifecycleManager,
        settings: SharedRuntimeSettings,
        save_on_apply: bool,
    ) -> Self {
        Self {
            configuration,
            lifecycle,
            settings,
            save_on_apply,
            cycle: Mutex::new(()),
        }
    }

    pub fn configuration(&self) -> &ConfigurationManager {
        &self.configuration
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn settings(&self) -> &SharedRuntimeSettings {
        &self.settings
    }

    /// Brings the baseline and the running instances in line with `target`.
    ///
    /// Per-entity failures end up in the outcome's report. A failed save is
    /// logged and reported through `saved`.
    pub async fn reconcile(&self, target: &AgentConfiguration) -> ReconcileOutcome {
        let _cycle = self.cycle.lock().await;
        let cycle_id = Uuid::now_v7();

        let rolled_back = self.lifecycle.take_update_failures();
        if !rolled_back.is_empty() {
            let resources: Vec<_> = rolled_back
                .resources
                .iter()
                .map(|failure| (failure.name.clone(), failure.configuration.clone()))
                .collect();
            let gateways: Vec<_> = rolled_back
                .gateways
                .iter()
                .map(|failure| (failure.name.clone(), failure.configuration.clone()))
                .collect();
            let reverted = self.configuration.revert(&resources, &gateways);
            warn!(
                cycle_id = %cycle_id,
                rejected = rolled_back.len(),
                reverted = reverted,
                "Instances rejected their last update, retrying"
            );
        }

        let applied = self.configuration.apply(target);
        let mut report = if applied.changeset.is_empty() {
            ApplyReport::default()
        } else {
            self.lifecycle.apply_changeset(&applied.changeset, target).await
        };
        for failure in &rolled_back.resources {
            report.record_rolled_back(EntityKind::Resource, failure);
        }
        for failure in &rolled_back.gateways {
            report.record_rolled_back(EntityKind::Gateway, failure);
        }

        // Persist what was asked for, failed entities included
        let saved = if applied.change_count > 0 && self.save_on_apply {
            match self.configuration.save() {
                Ok(saved) => saved,
                Err(e) => {
                    error!(cycle_id = %cycle_id, error = %e, "Failed to persist configuration");
                    false
                }
            }
        } else {
            false
        };

        let resources: Vec<String> = report
            .failed_names(EntityKind::Resource)
            .into_iter()
            .filter(|name| !self.lifecycle.resources().contains(name))
            .collect();
        let gateways: Vec<String> = report
            .failed_names(EntityKind::Gateway)
            .into_iter()
            .filter(|name| !self.lifecycle.gateways().contains(name))
            .collect();
        let discarded = self.configuration.discard(&resources, &gateways);
        if discarded > 0 {
            warn!(
                cycle_id = %cycle_id,
                discarded = discarded,
                "Entities failed to start, they will be retried"
            );
        }

        let outcome = ReconcileOutcome {
            cycle_id,
            change_count: applied.change_count,
            version: self.configuration.version(),
            report,
            saved,
        };
        info!(
            cycle_id = %cycle_id,
            changes = outcome.change_count,
            applied = outcome.report.applied_count,
            failed = outcome.report.failures.len(),
            version = outcome.version,
            saved = saved,
            "Reconcile cycle completed"
        );
        outcome
    }

    /// Loads the persisted configuration and reconciles against it.
    ///
    /// Returns `None` when no store is attached.
    pub async fn load_and_reconcile(&self) -> Result<Option<ReconcileOutcome>> {
        let Some(target) = self.configuration.load_target()? else {
            return Ok(None);
        };
        Ok(Some(self.reconcile(&target).await))
    }

    /// True when an instance rejected an update no cycle has reported yet.
    pub fn has_rejected_updates(&self) -> bool {
        self.lifecycle.has_update_failures()
    }

    /// Stops every running instance. The baseline is left untouched.
    pub async fn shutdown(&self) {
        let _cycle = self.cycle.lock().await;
        self.lifecycle.shutdown().await;
    }
}
