//! Server lifecycle: health state, intake stop signal, in-flight tracking.
//!
//! The in-flight count lives in a `watch` channel so draining can wait on
//! the count reaching zero instead of sampling it.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Server health state.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Connected, main loop not started.
    Starting,
    /// Taking inbound calls.
    Ready,
    /// Intake stopped; dispatched calls are finishing.
    Draining,
    /// Drained.
    Stopped,
}

/// Intake control and in-flight accounting for one [`RpcServer`](super::RpcServer).
#[derive(Debug)]
pub struct Lifecycle {
    state: ArcSwap<HealthState>,
    intake: CancellationToken,
    in_flight: Arc<watch::Sender<u64>>,
}

impl Lifecycle {
    #[must_use]
    pub fn new() -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            state: ArcSwap::from_pointee(HealthState::Starting),
            intake: CancellationToken::new(),
            in_flight: Arc::new(in_flight),
        }
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.state.load()
    }

    pub fn set_ready(&self) {
        self.state.store(Arc::new(HealthState::Ready));
    }

    /// Cancelled once intake must stop.
    #[must_use]
    pub fn intake(&self) -> &CancellationToken {
        &self.intake
    }

    /// Enters `Draining` and stops intake.
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(HealthState::Draining));
        self.intake.cancel();
    }

    /// Enters `Stopped` directly and stops intake. Used when the link is
    /// lost for good and nothing can be drained.
    pub fn mark_stopped(&self) {
        self.state.store(Arc::new(HealthState::Stopped));
        self.intake.cancel();
    }

    /// Counts one call as in flight until the guard drops. Unwinding drops
    /// it too.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.send_modify(|count| *count += 1);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        *self.in_flight.borrow()
    }

    /// Waits until no call is in flight, for at most `timeout`.
    ///
    /// On success the state becomes `Stopped` and `true` is returned. On
    /// timeout the state is left at `Draining`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let mut count = self.in_flight.subscribe();
        let drained = tokio::time::timeout(timeout, count.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|idle| idle.is_ok());
        if drained {
            self.state.store(Arc::new(HealthState::Stopped));
        }
        drained
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks one call in flight; see [`Lifecycle::in_flight_guard`].
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<watch::Sender<u64>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}
