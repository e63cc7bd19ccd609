//! Reload loop - reconciles against the persisted configuration when it changes.
//!
//! The store's modification time is polled on a fixed interval. A cycle that
//! reported failures is retried on the next tick even if the file is
//! untouched, so a resource that failed to connect keeps being retried. The
//! same holds once an instance rejects an update after its window expired.

use crate::agent::{Agent, ReconcileOutcome};
use anyhow::Result;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// What the loop remembers between ticks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReloadState {
    /// Modification time seen after the last cycle
    pub last_modified: Option<SystemTime>,
    /// The last cycle reported failures
    pub retry: bool,
}

impl ReloadState {
    /// State matching the store as it is now, so an unchanged file is not
    /// reloaded on the first tick.
    pub fn current(agent: &Agent) -> Self {
        Self {
            last_modified: agent
                .configuration()
                .store()
                .and_then(|store| store.modified_at()),
            retry: false,
        }
    }
}

/// Runs one reload check. Returns the outcome when a cycle actually ran.
pub async fn run_reload_cycle(
    agent: &Agent,
    state: &mut ReloadState,
) -> Result<Option<ReconcileOutcome>> {
    let enabled = agent
        .settings()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .reload_enabled;
    if !enabled {
        debug!("Reload disabled, skipping");
        return Ok(None);
    }

    let Some(store) = agent.configuration().store() else {
        return Ok(None);
    };
    let modified = store.modified_at();
    if modified == state.last_modified && !state.retry && !agent.has_rejected_updates() {
        return Ok(None);
    }

    let outcome = match agent.load_and_reconcile().await {
        Ok(outcome) => outcome,
        Err(e) => {
            // A broken file is reported once, not on every tick
            state.last_modified = modified;
            state.retry = false;
            return Err(e);
        }
    };

    // Read after the cycle so the agent's own save does not trigger a reload
    state.last_modified = store.modified_at();
    state.retry = outcome.as_ref().is_some_and(|o| !o.is_success());

    if let Some(outcome) = &outcome {
        info!(
            cycle_id = %outcome.cycle_id,
            changes = outcome.change_count,
            failed = outcome.report.failures.len(),
            "Configuration reloaded"
        );
    }
    Ok(outcome)
}

/// Spawns the reload loop. Abort the returned handle to stop it.
pub fn spawn_reload_loop(agent: Arc<Agent>, interval: Duration) -> JoinHandle<()> {
    let mut state = ReloadState::current(&agent);
    tokio::spawn(async move {
        let mut interval = time::interval(interval);
        interval.tick().await; // consume immediate first tick

        loop {
            interval.tick().await;
            if let Err(e) = run_reload_cycle(&agent, &mut state).await {
                warn!(error = %format!("{:#}", e), "Reload cycle failed");
            }
        }
    })
}
