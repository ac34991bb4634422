//! Runtime counters with periodic roll-up
//!
//! Cheap atomic counters incremented on the hot paths, drained by a
//! background task that emits one summary line per configured interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::AbortHandle;
use tokio::time::Duration;
use tracing::info;

#[derive(Debug, Default)]
pub struct Counters {
    pub connections_opened: AtomicU64,
    pub connections_closed: AtomicU64,
    pub auth_failures: AtomicU64,
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub broadcasts: AtomicU64,
    pub encodes_started: AtomicU64,
    pub encodes_completed: AtomicU64,
    pub encodes_failed: AtomicU64,
}

impl Counters {
    /// Spawn the roll-up loop. Each line reports activity since the
    /// previous line, not process totals.
    pub fn spawn_summary(self: Arc<Self>, interval: Duration) -> AbortHandle {
        let counters = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so the first
            // summary covers a full interval.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                counters.emit();
            }
        })
        .abort_handle()
    }

    fn emit(&self) {
        info!(
            connections_opened = self.connections_opened.swap(0, Ordering::Relaxed),
            connections_closed = self.connections_closed.swap(0, Ordering::Relaxed),
            auth_failures = self.auth_failures.swap(0, Ordering::Relaxed),
            frames_in = self.frames_in.swap(0, Ordering::Relaxed),
            frames_out = self.frames_out.swap(0, Ordering::Relaxed),
            broadcasts = self.broadcasts.swap(0, Ordering::Relaxed),
            encodes_started = self.encodes_started.swap(0, Ordering::Relaxed),
            encodes_completed = self.encodes_completed.swap(0, Ordering::Relaxed),
            encodes_failed = self.encodes_failed.swap(0, Ordering::Relaxed),
            "activity summary"
        );
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_drains_counters() {
        let counters = Counters::default();
        counters.frames_in.fetch_add(5, Ordering::Relaxed);
        counters.emit();
        assert_eq!(counters.frames_in.load(Ordering::Relaxed), 0);
    }
}
