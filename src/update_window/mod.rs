//! Update-window state machine.
//!
//! Each running connector or gateway owns one [`UpdateWindow`]. A burst of
//! changes aimed at the instance opens the window once, keeps sliding its
//! deadline forward, and is handed to the instance in a single `end_update`
//! call after the window has been quiet for its full duration.
//!
//! Deadlines are checked by one shared [`WindowTimer`]. The timer never runs
//! hooks itself: every expiry is spawned onto its own task, so a slow
//! instance cannot hold back another instance's window.

use crate::error::SnampError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};


/// Hooks invoked by an [`UpdateWindow`] on the instance it guards.
#[async_trait]
pub trait UpdateHandler<C>: Send + Sync + 'static {
    /// Called once when the window opens. The instance should suspend or
    /// queue normal access until `end_update`.
    async fn begin_update(&self) -> anyhow::Result<()>;

    /// Called once per window with every change collected while it was open,
    /// in submission order.
    async fn end_update(&self, changes: Vec<C>) -> anyhow::Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Updating { deadline: Instant },
    Closed,
}

struct WindowState<C> {
    phase: Phase,
    pending: Vec<C>,
}

/// Debounces changes to one instance into a single activation cycle.
///
/// State transitions happen under a short synchronous lock. Hook invocations
/// are serialized by a separate async activation lock, so a begin hook and an
/// end hook for the same instance never overlap.
pub struct UpdateWindow<C, H> {
    name: String,
    duration: Duration,
    state: Mutex<WindowState<C>>,
    activation: tokio::sync::Mutex<()>,
    /// Set while the timer has an expiry in flight for this window
    expiring: AtomicBool,
    handler: H,
}

impl<C, H> UpdateWindow<C, H>
where
    C: Send + 'static,
    H: UpdateHandler<C>,
{
    pub fn new(name: impl Into<String>, duration: Duration, handler: H) -> Self {
        Self {
            name: name.into(),
            duration,
            state: Mutex::new(WindowState {
                phase: Phase::Idle,
                pending: Vec::new(),
            }),
            activation: tokio::sync::Mutex::new(()),
            expiring: AtomicBool::new(false),
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Records a change and opens or extends the window.
    ///
    /// Opening invokes the begin hook; extending only moves the deadline.
    pub async fn begin_update(&self, change: C) -> Result<(), SnampError> {
        let _activation = self.activation.lock().await;

        let opened = {
            let mut state = self.lock_state();
            let deadline = Instant::now() + self.duration;
            let phase = state.phase;
            match phase {
                Phase::Closed => return Err(SnampError::UpdateWindowClosed(self.name.clone())),
                Phase::Updating { .. } => {
                    state.phase = Phase::Updating { deadline };
                    state.pending.push(change);
                    debug!(
                        window = %self.name,
                        pending = state.pending.len(),
                        "Update window extended"
                    );
                    false
                }
                Phase::Idle => {
                    state.phase = Phase::Updating { deadline };
                    state.pending.push(change);
                    debug!(window = %self.name, "Update window opened");
                    true
                }
            }
        };

        if opened {
            if let Err(e) = self.handler.begin_update().await {
                warn!(window = %self.name, error = %e, "Begin update hook failed");
            }
        }
        Ok(())
    }

    /// Pure read of the current state.
    pub fn is_updating(&self) -> bool {
        matches!(self.lock_state().phase, Phase::Updating { .. })
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().phase == Phase::Closed
    }

    /// Number of changes collected by the open window.
    pub fn pending_len(&self) -> usize {
        self.lock_state().pending.len()
    }

    /// True once the window is open and its deadline has passed.
    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.lock_state().phase, Phase::Updating { deadline } if now >= deadline)
    }

    /// Closes the window if its deadline has passed and runs the end hook.
    ///
    /// The deadline is re-checked after the activation lock is taken, so a
    /// `begin_update` that slipped in first pushes the expiry back. Returns
    /// true if the end hook ran.
    pub async fn expire_if_due(&self) -> bool {
        let _activation = self.activation.lock().await;

        let changes = {
            let mut state = self.lock_state();
            let phase = state.phase;
            match phase {
                Phase::Updating { deadline } if Instant::now() >= deadline => {
                    state.phase = Phase::Idle;
                    std::mem::take(&mut state.pending)
                }
                _ => return false,
            }
        };

        self.run_end_hook(changes).await;
        true
    }

    /// Disposes of the window.
    ///
    /// An open window is flushed first: the end hook runs exactly once before
    /// this returns. Any later call fails with `UpdateWindowClosed`.
    pub async fn close(&self) -> Result<(), SnampError> {
        let _activation = self.activation.lock().await;

        let flush = {
            let mut state = self.lock_state();
            let phase = state.phase;
            match phase {
                Phase::Closed => return Err(SnampError::UpdateWindowClosed(self.name.clone())),
                Phase::Updating { .. } => {
                    state.phase = Phase::Closed;
                    Some(std::mem::take(&mut state.pending))
                }
                Phase::Idle => {
                    state.phase = Phase::Closed;
                    None
                }
            }
        };

        if let Some(changes) = flush {
            debug!(window = %self.name, "Flushing open update window on close");
            self.run_end_hook(changes).await;
        }
        Ok(())
    }

    async fn run_end_hook(&self, changes: Vec<C>) {
        let count = changes.len();
        match self.handler.end_update(changes).await {
            Ok(()) => info!(window = %self.name, changes = count, "Update window flushed"),
            Err(e) => error!(
                window = %self.name,
                changes = count,
                error = %e,
                "End update hook failed"
            ),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, WindowState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Something the [`WindowTimer`] can expire.
#[async_trait]
pub trait ExpiryTarget: Send + Sync {
    fn is_due(&self, now: Instant) -> bool;

    /// Marks an expiry as in flight. Returns false if one already is.
    fn claim(&self) -> bool;

    /// Runs the expiry and releases the claim.
    async fn expire(&self);
}

#[async_trait]
impl<C, H> ExpiryTarget for UpdateWindow<C, H>
where
    C: Send + 'static,
    H: UpdateHandler<C>,
{
    fn is_due(&self, now: Instant) -> bool {
        UpdateWindow::is_due(self, now)
    }

    fn claim(&self) -> bool {
        self.expiring
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    async fn expire(&self) {
        let _claim = ExpiryClaim(&self.expiring);
        self.expire_if_due().await;
    }
}

/// Releases an expiry claim when dropped, including on a panicking hook.
struct ExpiryClaim<'a>(&'a AtomicBool);

impl Drop for ExpiryClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Shared background timer driving the deadlines of all registered windows.
///
/// The polling task only holds a weak reference: dropping the last `Arc`
/// stops it, as does `stop()`.
pub struct WindowTimer {
    tick: Duration,
    windows: DashMap<String, Arc<dyn ExpiryTarget>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WindowTimer {
    pub fn new(tick: Duration) -> Arc<Self> {
        Arc::new(Self {
            tick,
            windows: DashMap::new(),
            handle: Mutex::new(None),
        })
    }

    pub fn register(&self, key: impl Into<String>, window: Arc<dyn ExpiryTarget>) {
        self.windows.insert(key.into(), window);
    }

    pub fn unregister(&self, key: &str) {
        self.windows.remove(key);
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Starts the polling task. Calling it again while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let timer = Arc::downgrade(self);
        let tick = self.tick;
        *handle = Some(tokio::spawn(async move {
            let mut interval = time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(timer) = timer.upgrade() else {
                    break;
                };
                timer.poll();
            }
        }));
        debug!(tick_ms = self.tick.as_millis() as u64, "Update window timer started");
    }

    /// Spawns an expiry for every due window not already expiring.
    pub fn poll(&self) -> usize {
        let now = Instant::now();
        // Collect first so no map shard stays locked while tasks are spawned
        let due: Vec<Arc<dyn ExpiryTarget>> = self
            .windows
            .iter()
            .filter(|entry| entry.value().is_due(now))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut spawned = 0;
        for window in due {
            if window.claim() {
                tokio::spawn(async move { window.expire().await });
                spawned += 1;
            }
        }
        spawned
    }

    pub fn stop(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            debug!("Update window timer stopped");
        }
    }
}

impl Drop for WindowTimer {
    fn drop(&mut self) {
        if let Ok(mut handle) = self.handle.lock() {
            if let Some(handle) = handle.take() {
                handle.abort();
            }
        }
    }
}
