//! Activity heartbeat tracking.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Time of the last observed activity.
///
/// Stored as milliseconds since a fixed epoch in one atomic, so writers never
/// need a lock and the value never moves backwards.
#[derive(Debug)]
pub struct Liveness {
    epoch: Instant,
    last_activity_ms: AtomicU64,
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    /// Create a liveness tracker whose last activity is "now".
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Mark activity at the current time.
    pub fn record(&self) {
        self.last_activity_ms
            .fetch_max(self.now_ms(), Ordering::AcqRel);
    }

    /// Instant of the last recorded activity.
    pub fn last_activity(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire))
    }

    /// Time elapsed since the last recorded activity.
    pub fn idle(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Acquire);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }
}

/// Clonable handle that lets arbitrary callers report activity.
#[derive(Debug, Clone)]
pub struct ActivityHandle(Arc<Liveness>);

impl ActivityHandle {
    pub(crate) fn new(liveness: Arc<Liveness>) -> Self {
        Self(liveness)
    }

    pub fn record_activity(&self) {
        self.0.record();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_idle_grows_until_activity() {
        let liveness = Liveness::new();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(liveness.idle(), Duration::from_secs(5));

        liveness.record();
        assert_eq!(liveness.idle(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_activity_is_monotonic() {
        let liveness = Arc::new(Liveness::new());
        let handle = ActivityHandle::new(liveness.clone());

        tokio::time::advance(Duration::from_secs(2)).await;
        handle.record_activity();
        let first = liveness.last_activity();

        // A stale write cannot move the timestamp backwards.
        liveness.last_activity_ms.fetch_max(0, Ordering::AcqRel);
        assert_eq!(liveness.last_activity(), first);

        tokio::time::advance(Duration::from_secs(1)).await;
        handle.record_activity();
        assert!(liveness.last_activity() > first);
    }
}
