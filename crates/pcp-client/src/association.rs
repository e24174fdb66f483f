//! Session Association (v1 only, §4.5): the handshake that binds a
//! WebSocket to a PCP client identity at the broker.
//!
//! Modeled as `tokio::sync::Mutex<AssociationState>` plus a `Notify`: the
//! same reset-under-lock, wait-on-condition structure as a mutex+condvar
//! pairing (§3 `SessionAssociation`), without blocking a worker thread.

use tokio::sync::{Mutex, Notify};
use tracing::warn;

use crate::types::AssociationTimings;

#[derive(Debug, Default)]
pub(crate) struct AssociationState {
    pub in_progress: bool,
    pub success: bool,
    pub got_messaging_failure: bool,
    pub request_id: String,
    pub error: String,
    pub timings: AssociationTimings,
}

/// Guards at most one concurrent Session Association attempt per Connector
/// (§3 invariant, §4.5).
pub(crate) struct Association {
    state: Mutex<AssociationState>,
    notify: Notify,
}

impl Association {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(AssociationState::default()),
            notify: Notify::new(),
        }
    }

    /// Resets association state and marks `in_progress = true` ahead of
    /// sending a fresh `associate_request` (§4.5 step 2).
    pub(crate) async fn begin(&self, request_id: String) {
        let mut state = self.state.lock().await;
        *state = AssociationState {
            in_progress: true,
            request_id,
            timings: {
                let mut t = AssociationTimings::default();
                t.start = Some(std::time::Instant::now());
                t
            },
            ..Default::default()
        };
    }

    pub(crate) async fn request_id(&self) -> String {
        self.state.lock().await.request_id.clone()
    }

    /// Records a terminal `associate_response` and wakes any waiter. A
    /// response arriving after the association has already settled (no
    /// attempt `in_progress`) is stale or replayed and is discarded.
    pub(crate) async fn complete_response(&self, success: bool, reason: Option<String>) {
        let mut state = self.state.lock().await;
        if !state.in_progress {
            warn!("associate_response received with no association in progress, discarding");
            return;
        }
        state.in_progress = false;
        state.success = success;
        state.timings.completed = true;
        state.timings.success = success;
        state.timings.association = Some(std::time::Instant::now());
        if let Some(reason) = reason {
            state.error = reason;
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Records a correlated failure (error_message/ttl_expired/version_error
    /// matching our request id) and wakes any waiter. Discarded if no
    /// association is currently in progress, same as `complete_response`.
    pub(crate) async fn fail(&self, error: String) {
        let mut state = self.state.lock().await;
        if !state.in_progress {
            warn!(%error, "correlated association failure received with no association in progress, discarding");
            return;
        }
        state.in_progress = false;
        state.got_messaging_failure = true;
        state.error = error;
        drop(state);
        self.notify.notify_waiters();
    }

    pub(crate) async fn note_closed(&self) {
        let mut state = self.state.lock().await;
        state.timings.closed = true;
        state.timings.close = Some(std::time::Instant::now());
    }

    /// Waits until `in_progress` clears (response arrived), a messaging
    /// failure is recorded, or `timeout` elapses (§4.5 step 4).
    pub(crate) async fn wait(&self, timeout: std::time::Duration) -> AssociationOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let state = self.state.lock().await;
                if state.got_messaging_failure {
                    return AssociationOutcome::Failed(state.error.clone());
                }
                if !state.in_progress {
                    return if state.success {
                        AssociationOutcome::Succeeded
                    } else {
                        AssociationOutcome::ResponseFailure(state.error.clone())
                    };
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return AssociationOutcome::TimedOut;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(remaining) => return AssociationOutcome::TimedOut,
            }
        }
    }

    pub(crate) async fn timings(&self) -> AssociationTimings {
        self.state.lock().await.timings.clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AssociationOutcome {
    Succeeded,
    ResponseFailure(String),
    Failed(String),
    TimedOut,
}
