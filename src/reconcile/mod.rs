//! Status reconciliation loop.
//!
//! Keeps a near-real-time view of whether a project's sandbox is alive:
//!
//! - a check runs on start and then every `interval`;
//! - a check requested while another is in flight joins it, so at most one
//!   probe per project is outstanding at any instant; a check stays in flight
//!   until its status callback has returned;
//! - a check requested within `burst_window` of the previous one's start is
//!   answered with a synthesized "likely running" result, without probing;
//! - probe failures are counted and reported through the status callback, the
//!   loop keeps running;
//! - an `expired` result stops the loop, awaits the sync callback, and restarts
//!   the loop for the same project if the sync succeeded.

pub mod probe;

pub use probe::{HttpStatusProbe, StatusProbe};

use crate::error::{SyncError, SyncResult};
use crate::model::{SandboxStatus, StatusCheckResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Invoked once per completed probe.
pub type StatusCallback = Arc<dyn Fn(&StatusCheckResult) + Send + Sync>;

/// Recovery workflow run when a sandbox lease has expired.
#[async_trait]
pub trait SyncRequired: Send + Sync {
    async fn sync_required(&self, project_id: &str) -> SyncResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub interval: Duration,
    pub burst_window: Duration,
    /// Consecutive errors at which the loop reports itself unhealthy.
    pub unhealthy_after: u32,
    /// Consecutive errors at which embedders should consider backing off.
    pub backoff_after: u32,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            burst_window: Duration::from_secs(1),
            unhealthy_after: 3,
            backoff_after: 5,
        }
    }
}

/// Diagnostic view of the loop's recent probe outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorStatus {
    pub consecutive_errors: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub is_healthy: bool,
}

type SharedCheck = Shared<BoxFuture<'static, StatusCheckResult>>;

#[derive(Default)]
struct Callbacks {
    on_status: Option<StatusCallback>,
    on_sync_required: Option<Arc<dyn SyncRequired>>,
}

#[derive(Default)]
struct LoopState {
    project_id: Option<String>,
    active: bool,
    /// Bumped on every start/stop; results from an older generation are stale.
    generation: u64,
    timer: Option<CancellationToken>,
    in_flight: HashMap<String, SharedCheck>,
    last_started: HashMap<String, Instant>,
    consecutive_errors: u32,
    last_success_at: Option<DateTime<Utc>>,
}

struct Inner {
    probe: Arc<dyn StatusProbe>,
    settings: LoopSettings,
    state: Mutex<LoopState>,
    callbacks: RwLock<Callbacks>,
}

/// Periodic sandbox status checker for one project at a time.
///
/// `start` must be called from within a tokio runtime.
pub struct StatusLoop {
    inner: Arc<Inner>,
}

impl StatusLoop {
    pub fn new(probe: Arc<dyn StatusProbe>, settings: LoopSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                probe,
                settings,
                state: Mutex::new(LoopState::default()),
                callbacks: RwLock::new(Callbacks::default()),
            }),
        }
    }

    pub fn set_status_callback(&self, callback: StatusCallback) {
        self.inner.callbacks.write().on_status = Some(callback);
    }

    pub fn set_sync_callback(&self, handler: Arc<dyn SyncRequired>) {
        self.inner.callbacks.write().on_sync_required = Some(handler);
    }

    /// Begin checking `project_id`, replacing any project checked before.
    pub fn start(&self, project_id: &str) {
        self.inner.start(project_id);
    }

    /// Cancel the timer and forget in-flight checks. Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// User-triggered check, subject to the same coalescing as timer checks.
    pub async fn check_now(&self) -> SyncResult<StatusCheckResult> {
        let project_id = {
            let state = self.inner.state.lock();
            match (&state.project_id, state.active) {
                (Some(id), true) => id.clone(),
                _ => {
                    return Err(SyncError::Validation(
                        "status loop is not running".to_string(),
                    ))
                }
            }
        };
        Ok(Inner::check(&self.inner, &project_id).await)
    }

    pub fn error_status(&self) -> ErrorStatus {
        let state = self.inner.state.lock();
        ErrorStatus {
            consecutive_errors: state.consecutive_errors,
            last_success_at: state.last_success_at,
            is_healthy: state.consecutive_errors < self.inner.settings.unhealthy_after,
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }

    pub fn project_id(&self) -> Option<String> {
        self.inner.state.lock().project_id.clone()
    }

    /// Stop, then drop callbacks and the project id. Safe to call repeatedly.
    pub fn dispose(&self) {
        self.inner.stop();
        *self.inner.callbacks.write() = Callbacks::default();
        self.inner.state.lock().project_id = None;
    }
}

impl Drop for StatusLoop {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Inner {
    fn start(self: &Arc<Self>, project_id: &str) {
        let token = CancellationToken::new();
        let generation = {
            let mut state = self.state.lock();
            if let Some(old) = state.timer.take() {
                old.cancel();
            }
            state.in_flight.clear();
            state.last_started.clear();
            state.project_id = Some(project_id.to_string());
            state.active = true;
            state.generation += 1;
            state.timer = Some(token.clone());
            state.generation
        };

        tracing::info!(project_id = %project_id, generation, "status loop started");
        tokio::spawn(Self::run_timer(
            Arc::clone(self),
            project_id.to_string(),
            token,
        ));
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
        if state.active {
            tracing::info!(project_id = ?state.project_id, "status loop stopped");
        }
        state.active = false;
        state.generation += 1;
        state.in_flight.clear();
        state.last_started.clear();
    }

    async fn run_timer(inner: Arc<Self>, project_id: String, token: CancellationToken) {
        let mut ticker = tokio::time::interval(inner.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    Self::check(&inner, &project_id).await;
                }
            }
        }
    }

    async fn check(inner: &Arc<Self>, project_id: &str) -> StatusCheckResult {
        let shared = {
            let mut state = inner.state.lock();
            if let Some(existing) = state.in_flight.get(project_id) {
                tracing::debug!(project_id = %project_id, "joining in-flight status check");
                existing.clone()
            } else {
                if let Some(started) = state.last_started.get(project_id) {
                    if started.elapsed() < inner.settings.burst_window {
                        tracing::debug!(project_id = %project_id, "status check suppressed (burst)");
                        return StatusCheckResult::likely_running();
                    }
                }
                state
                    .last_started
                    .insert(project_id.to_string(), Instant::now());
                let fut = Self::run_probe(Arc::clone(inner), project_id.to_string(), state.generation)
                    .boxed()
                    .shared();
                state
                    .in_flight
                    .insert(project_id.to_string(), fut.clone());
                fut
            }
        };
        shared.await
    }

    async fn run_probe(inner: Arc<Self>, project_id: String, generation: u64) -> StatusCheckResult {
        tracing::debug!(project_id = %project_id, "probing sandbox status");
        let outcome = inner.probe.probe(&project_id).await;

        let (result, current) = {
            let mut state = inner.state.lock();
            let current = state.active && state.generation == generation;

            let result = match outcome {
                Ok(result) => {
                    if current {
                        state.consecutive_errors = 0;
                        state.last_success_at = Some(Utc::now());
                    }
                    result
                }
                Err(e) => {
                    if current {
                        state.consecutive_errors += 1;
                        let errors = state.consecutive_errors;
                        tracing::warn!(project_id = %project_id, errors, error = %e, "sandbox status check failed");
                        if errors >= inner.settings.backoff_after {
                            tracing::warn!(
                                project_id = %project_id,
                                errors,
                                "status checks keep failing, consider backing off"
                            );
                        }
                    }
                    StatusCheckResult::probe_failed(e)
                }
            };
            (result, current)
        };

        if !current {
            return result;
        }

        let (on_status, on_sync) = {
            let callbacks = inner.callbacks.read();
            (
                callbacks.on_status.clone(),
                callbacks.on_sync_required.clone(),
            )
        };

        if let Some(callback) = on_status {
            callback(&result);
        }

        // Callers arriving while the callback ran joined this check; release
        // the slot only now so the next check starts after it.
        {
            let mut state = inner.state.lock();
            if state.generation == generation {
                state.in_flight.remove(&project_id);
            }
        }

        if result.status == SandboxStatus::Expired {
            if let Some(handler) = on_sync {
                Self::handle_expiry(&inner, project_id, handler);
            }
        }

        result
    }

    fn handle_expiry(inner: &Arc<Self>, project_id: String, handler: Arc<dyn SyncRequired>) {
        inner.stop();
        tracing::info!(project_id = %project_id, "sandbox expired, running sync");

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            match handler.sync_required(&project_id).await {
                Ok(()) => {
                    let resume = {
                        let state = inner.state.lock();
                        !state.active && state.project_id.as_deref() == Some(project_id.as_str())
                    };
                    if resume {
                        inner.start(&project_id);
                    }
                }
                Err(e) => {
                    tracing::error!(
                        project_id = %project_id,
                        error = %e,
                        "sync after expiry failed, status loop stays stopped"
                    );
                }
            }
        });
    }
}
