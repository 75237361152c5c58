//! Per-request deadlines.
//!
//! Every arm bumps the request's timer generation. A timer that wakes up only
//! resolves the request if the entry is still pending and its generation is
//! unchanged, so a fire that loses a race with a response, a keep-alive or a
//! disconnect does nothing.

use std::sync::Arc;
use std::time::Duration;

use fleet_relay_error::RelayError;
use tokio::time::Instant;

use crate::registry::{AgentConnection, PendingRequest};

impl PendingRequest {
    pub(crate) fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl AgentConnection {
    /// Schedules (or reschedules) the deadline of `pending`. Callers hold the
    /// tables lock, which keeps arming atomic with resolution.
    pub(crate) fn arm_deadline(self: &Arc<Self>, pending: &mut PendingRequest, duration: Duration) {
        pending.timeout = duration;
        self.arm_deadline_at(pending, Instant::now() + duration);
    }

    /// Like `arm_deadline`, against an absolute instant. `pending.timeout`
    /// is left as the caller set it.
    pub(crate) fn arm_deadline_at(self: &Arc<Self>, pending: &mut PendingRequest, deadline: Instant) {
        pending.disarm();
        pending.timer_generation += 1;
        pending.deadline = deadline;

        let agent = Arc::downgrade(self);
        let correlation_id = pending.correlation_id.clone();
        let generation = pending.timer_generation;
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(agent) = agent.upgrade() {
                agent.fire_deadline(&correlation_id, generation).await;
            }
        });
        pending.timer = Some(timer.abort_handle());
    }

    /// Pushes the deadline of a pending request `duration` into the future.
    /// Returns `false` if the request has already been resolved.
    pub async fn extend_deadline(self: &Arc<Self>, correlation_id: &str, duration: Duration) -> bool {
        let mut tables = self.tables.lock().await;
        let Some(pending) = tables.pending.get_mut(correlation_id) else {
            return false;
        };
        self.arm_deadline(pending, duration);
        tracing::debug!(
            agent_id = %self.id(),
            correlation_id = %correlation_id,
            extension_ms = duration.as_millis() as u64,
            "deadline extended"
        );
        true
    }

    async fn fire_deadline(&self, correlation_id: &str, generation: u64) {
        let mut tables = self.tables.lock().await;
        let Some(pending) = tables.pending.get_mut(correlation_id) else {
            return;
        };
        if pending.timer_generation != generation {
            return;
        }
        // This task is the timer; nothing left to abort.
        pending.timer = None;
        let timeout_ms = pending.timeout.as_millis() as u64;
        tracing::warn!(
            agent_id = %self.id(),
            correlation_id = %correlation_id,
            kind = %pending.kind,
            timeout_ms,
            age_ms = pending.created_at.elapsed().as_millis() as u64,
            "request timed out"
        );
        tables.resolve(
            correlation_id,
            Err(RelayError::Timeout {
                correlation_id: correlation_id.to_string(),
                timeout_ms,
            }),
        );
    }
}
