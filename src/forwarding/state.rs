use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// point-in-time view of a tunnel's health
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct TunnelStatus {
    pub healthy: bool,
    /// cleared whenever the tunnel is marked healthy
    pub last_error: Option<String>,
    /// how many times the forward primitive was invoked for this tunnel
    pub invocations: u64,
}

/// Health record shared between a tunnel's worker, the health checker and
/// the dashboard. Every update and every read happens under one lock, so
/// readers never observe `healthy` and `last_error` from different writers.
#[derive(Debug, Clone, Default)]
pub(crate) struct TunnelState {
    inner: Arc<Mutex<TunnelStatus>>,
}

impl TunnelState {
    pub fn mark_healthy(&self) {
        let mut status = self.lock();
        status.healthy = true;
        status.last_error = None;
    }
    pub fn mark_failed(&self, error: impl ToString) {
        let mut status = self.lock();
        status.healthy = false;
        status.last_error = Some(error.to_string());
    }
    pub fn record_invocation(&self) {
        self.lock().invocations += 1;
    }
    pub fn snapshot(&self) -> TunnelStatus {
        self.lock().clone()
    }
    fn lock(&self) -> MutexGuard<'_, TunnelStatus> {
        // the record stays meaningful even if a writer panicked mid-update
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unhealthy_without_error() {
        let state = TunnelState::default();
        assert_eq!(state.snapshot(), TunnelStatus::default());
    }

    #[test]
    fn healthy_clears_error() {
        let state = TunnelState::default();
        state.mark_failed("dial tcp: connection refused");
        let failed = state.snapshot();
        assert!(!failed.healthy);
        assert_eq!(
            failed.last_error.as_deref(),
            Some("dial tcp: connection refused")
        );

        state.mark_healthy();
        let healed = state.snapshot();
        assert!(healed.healthy);
        assert!(healed.last_error.is_none());
    }

    #[test]
    fn clones_share_the_record() {
        let state = TunnelState::default();
        let writer = state.clone();
        writer.record_invocation();
        writer.record_invocation();
        writer.mark_healthy();
        assert_eq!(state.snapshot().invocations, 2);
        assert!(state.snapshot().healthy);
    }
}
