//! In-flight request tracking for graceful draining.
//!
//! Every request handled by the gateway holds an [`InFlightGuard`] for its
//! whole lifetime. During shutdown the serve loop waits, bounded by the grace
//! period, until the count drops to zero.
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::time::{Instant, sleep};

/// Counts requests currently being processed.
#[derive(Clone, Default)]
pub struct InFlightTracker {
    active: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request. The count drops when the guard is dropped.
    pub fn track(&self) -> InFlightGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            active: self.active.clone(),
        }
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Requests seen since startup.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Wait until no request is in flight or the timeout elapses.
    /// Returns whether the drain completed.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let mut check_interval = Duration::from_millis(50);

        while start.elapsed() < timeout {
            let active = self.active();
            if active == 0 {
                tracing::info!("All in-flight requests drained");
                return true;
            }

            tracing::debug!(
                active,
                elapsed = ?start.elapsed(),
                "Waiting for in-flight requests to drain"
            );

            sleep(check_interval.min(timeout.saturating_sub(start.elapsed()))).await;

            // Exponential backoff up to 1 second
            check_interval = std::cmp::min(check_interval * 2, Duration::from_secs(1));
        }

        let remaining = self.active();
        if remaining == 0 {
            return true;
        }
        tracing::warn!(
            remaining,
            ?timeout,
            "Drain timeout exceeded, abandoning in-flight requests"
        );
        false
    }
}

/// Decrements the in-flight count on drop.
pub struct InFlightGuard {
    active: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_tracks_request_lifetime() {
        let tracker = InFlightTracker::new();
        let first = tracker.track();
        let second = tracker.track();
        assert_eq!(tracker.active(), 2);

        drop(first);
        assert_eq!(tracker.active(), 1);
        drop(second);
        assert_eq!(tracker.active(), 0);
        assert_eq!(tracker.total(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out_with_active_requests() {
        let tracker = InFlightTracker::new();
        let _guard = tracker.track();
        assert!(!tracker.wait_for_drain(Duration::from_secs(2)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_completes_when_requests_finish() {
        let tracker = InFlightTracker::new();
        let guard = tracker.track();

        tokio::spawn(async move {
            sleep(Duration::from_millis(300)).await;
            drop(guard);
        });

        assert!(tracker.wait_for_drain(Duration::from_secs(60)).await);
    }
}
