//! Lifecycle controllers for the ephemeral preview sandbox.
//!
//! Two independent, idempotent concerns: a keep-alive loop that pings the
//! provider so the sandbox is not reclaimed, and a cleanup controller
//! that releases it exactly once when the owning context goes away. They
//! share nothing but the sandbox id, which only the owning context may
//! change.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::api::SandboxApi;
use crate::errors::ApiError;

const EVENT_BUFFER_CAPACITY: usize = 32;

/// Keep-alive tuning.
#[derive(Clone, Copy, Debug)]
pub struct HeartbeatOptions {
    pub interval: Duration,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Notifications from the keep-alive loop.
#[derive(Clone, Debug, PartialEq)]
pub enum HeartbeatEvent {
    Pinged {
        sandbox_id: String,
    },
    /// A ping failed. The loop keeps running — the sandbox may recover;
    /// recovery policy belongs to the caller.
    PingFailed {
        sandbox_id: String,
        error: ApiError,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
struct HeartbeatTarget {
    sandbox_id: Option<String>,
    enabled: bool,
    shutdown: bool,
}

/// Periodic keep-alive driven purely by an `(id, enabled)` pair.
///
/// Toggling either part off stops the timer immediately; toggling back on
/// restarts from a fresh interval with no catch-up ping. One task owns
/// the timer, so no two timers ever run for the same controller.
pub struct HeartbeatController {
    target: watch::Sender<HeartbeatTarget>,
}

impl HeartbeatController {
    /// Spawns the keep-alive task. The controller starts with no target
    /// and enabled.
    pub fn spawn(
        api: Arc<dyn SandboxApi>,
        options: HeartbeatOptions,
    ) -> (Self, mpsc::Receiver<HeartbeatEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER_CAPACITY);
        let (target_tx, target_rx) = watch::channel(HeartbeatTarget {
            sandbox_id: None,
            enabled: true,
            shutdown: false,
        });
        tokio::spawn(heartbeat_task(api, options.interval, target_rx, events_tx));
        (Self { target: target_tx }, events_rx)
    }

    /// Points the loop at a sandbox, or at nothing.
    pub fn set_target(&self, sandbox_id: Option<String>) {
        self.target.send_if_modified(|target| {
            if target.sandbox_id == sandbox_id {
                return false;
            }
            target.sandbox_id = sandbox_id;
            true
        });
    }

    /// Pauses or resumes pinging without forgetting the target.
    pub fn set_enabled(&self, enabled: bool) {
        self.target.send_if_modified(|target| {
            if target.enabled == enabled {
                return false;
            }
            target.enabled = enabled;
            true
        });
    }

    /// Stops the task permanently.
    pub fn shutdown(&self) {
        self.target.send_modify(|target| target.shutdown = true);
    }
}

async fn heartbeat_task(
    api: Arc<dyn SandboxApi>,
    interval: Duration,
    mut target_rx: watch::Receiver<HeartbeatTarget>,
    events_tx: mpsc::Sender<HeartbeatEvent>,
) {
    loop {
        let current = target_rx.borrow_and_update().clone();
        if current.shutdown {
            return;
        }
        let Some(sandbox_id) = current.sandbox_id.filter(|_| current.enabled) else {
            if target_rx.changed().await.is_err() {
                return;
            }
            continue;
        };

        debug!(%sandbox_id, "heartbeat active");
        loop {
            tokio::select! {
                // Target changes win races against an expiring timer so a
                // ping is never issued for a stale id.
                biased;
                changed = target_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let next = target_rx.borrow_and_update().clone();
                    if next.shutdown {
                        return;
                    }
                    if next.sandbox_id.as_deref() != Some(sandbox_id.as_str()) || !next.enabled {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    match api.ping(&sandbox_id).await {
                        Ok(()) => {
                            let _ = events_tx.try_send(HeartbeatEvent::Pinged {
                                sandbox_id: sandbox_id.clone(),
                            });
                        }
                        Err(error) => {
                            warn!(%sandbox_id, %error, "sandbox ping failed");
                            let _ = events_tx.try_send(HeartbeatEvent::PingFailed {
                                sandbox_id: sandbox_id.clone(),
                                error,
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Why a cleanup trigger did not release.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Cleanup is currently gated off by the caller.
    Disabled,
    /// The id was marked preserved for a sibling flow.
    Preserved,
    /// This id was already released in this controller's lifetime.
    AlreadyReleased,
}

/// Before/after notifications around a release.
#[derive(Clone, Debug, PartialEq)]
pub enum CleanupEvent {
    Releasing {
        sandbox_id: String,
    },
    Released {
        sandbox_id: String,
    },
    ReleaseFailed {
        sandbox_id: String,
        error: ApiError,
    },
    Skipped {
        sandbox_id: String,
        reason: SkipReason,
    },
}

/// Cleanup trigger policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReleasePolicy {
    /// Also release when the page reports itself hidden, not only on
    /// dispose.
    pub on_hidden: bool,
}

#[derive(Default)]
struct CleanupState {
    target: Option<String>,
    enabled: bool,
    preserved: HashSet<String>,
    released: HashSet<String>,
}

/// Releases the sandbox exactly once when its owning context goes away.
///
/// `dispose()` is the unmount hook; call it from whatever glue owns the
/// component lifecycle. Release is fire-and-forget: dispose never waits
/// on the network.
pub struct CleanupController {
    api: Arc<dyn SandboxApi>,
    policy: ReleasePolicy,
    events: mpsc::Sender<CleanupEvent>,
    state: Mutex<CleanupState>,
}

impl CleanupController {
    pub fn new(
        api: Arc<dyn SandboxApi>,
        policy: ReleasePolicy,
    ) -> (Self, mpsc::Receiver<CleanupEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER_CAPACITY);
        (
            Self {
                api,
                policy,
                events: events_tx,
                state: Mutex::new(CleanupState {
                    enabled: true,
                    ..CleanupState::default()
                }),
            },
            events_rx,
        )
    }

    /// Points the controller at a sandbox, or at nothing.
    pub fn set_target(&self, sandbox_id: Option<String>) {
        self.lock().target = sandbox_id;
    }

    /// Gates release off during operations a premature release would
    /// corrupt. Callers must flip it back on afterward; a gated-off
    /// trigger does not consume the once-only budget.
    pub fn set_enabled(&self, enabled: bool) {
        self.lock().enabled = enabled;
    }

    /// Suppresses the next release of `sandbox_id` even if dispose fires,
    /// handing ownership to a sibling flow.
    pub fn preserve(&self, sandbox_id: &str) {
        self.lock().preserved.insert(sandbox_id.to_string());
    }

    /// Unmount trigger. At most one release per id per controller
    /// lifetime; extra calls are reported as skipped.
    pub fn dispose(&self) {
        self.trigger();
    }

    /// Tab-hide trigger; only acts under `ReleasePolicy { on_hidden: true }`.
    pub fn notify_hidden(&self) {
        if self.policy.on_hidden {
            self.trigger();
        }
    }

    fn trigger(&self) {
        let decision = {
            let mut state = self.lock();
            let Some(sandbox_id) = state.target.clone() else {
                return;
            };
            if state.released.contains(&sandbox_id) {
                Err((sandbox_id, SkipReason::AlreadyReleased))
            } else if state.preserved.remove(&sandbox_id) {
                // The unmount happened and the sibling flow now owns the
                // sandbox; burn the budget so later triggers stay no-ops.
                state.released.insert(sandbox_id.clone());
                Err((sandbox_id, SkipReason::Preserved))
            } else if !state.enabled {
                Err((sandbox_id, SkipReason::Disabled))
            } else {
                state.released.insert(sandbox_id.clone());
                Ok(sandbox_id)
            }
        };

        match decision {
            Ok(sandbox_id) => {
                let _ = self.events.try_send(CleanupEvent::Releasing {
                    sandbox_id: sandbox_id.clone(),
                });
                let api = self.api.clone();
                let events = self.events.clone();
                tokio::spawn(async move {
                    match api.release(&sandbox_id).await {
                        Ok(()) => {
                            debug!(%sandbox_id, "sandbox released");
                            let _ = events.try_send(CleanupEvent::Released { sandbox_id });
                        }
                        Err(error) => {
                            warn!(%sandbox_id, %error, "sandbox release failed");
                            let _ = events.try_send(CleanupEvent::ReleaseFailed {
                                sandbox_id,
                                error,
                            });
                        }
                    }
                });
            }
            Err((sandbox_id, reason)) => {
                debug!(%sandbox_id, ?reason, "sandbox release skipped");
                let _ = self.events.try_send(CleanupEvent::Skipped { sandbox_id, reason });
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CleanupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
