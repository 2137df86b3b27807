use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

/// Sentinel stored in `cursor` before the first non-empty batch.
const NO_CURSOR: i64 = i64::MIN;

/// Counters shared between the polling loop and the heartbeat job.
#[derive(Debug)]
pub struct PollStats {
    cycles: AtomicU64,
    updates_handled: AtomicU64,
    update_failures: AtomicU64,
    fetch_failures: AtomicU64,
    consecutive_fetch_failures: AtomicU32,
    cursor: AtomicI64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub cycles: u64,
    pub updates_handled: u64,
    pub update_failures: u64,
    pub fetch_failures: u64,
    pub consecutive_fetch_failures: u32,
    pub cursor: Option<i64>,
}

impl Default for PollStats {
    fn default() -> Self {
        Self {
            cycles: AtomicU64::new(0),
            updates_handled: AtomicU64::new(0),
            update_failures: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
            consecutive_fetch_failures: AtomicU32::new(0),
            cursor: AtomicI64::new(NO_CURSOR),
        }
    }
}

impl PollStats {
    pub fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self, handled: usize, failed: usize, cursor: Option<i64>) {
        self.updates_handled
            .fetch_add(handled as u64, Ordering::Relaxed);
        self.update_failures.fetch_add(failed as u64, Ordering::Relaxed);
        self.consecutive_fetch_failures.store(0, Ordering::Relaxed);
        if let Some(cursor) = cursor {
            self.cursor.store(cursor, Ordering::Relaxed);
        }
    }

    pub fn record_empty_poll(&self) {
        self.consecutive_fetch_failures.store(0, Ordering::Relaxed);
    }

    /// Returns the new consecutive failure count.
    pub fn record_fetch_failure(&self) -> u32 {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_fetch_failures
            .fetch_add(1, Ordering::Relaxed)
            .saturating_add(1)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let cursor = self.cursor.load(Ordering::Relaxed);
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            updates_handled: self.updates_handled.load(Ordering::Relaxed),
            update_failures: self.update_failures.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            consecutive_fetch_failures: self.consecutive_fetch_failures.load(Ordering::Relaxed),
            cursor: (cursor != NO_CURSOR).then_some(cursor),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_reset_on_success() {
        let stats = PollStats::default();
        assert_eq!(stats.record_fetch_failure(), 1);
        assert_eq!(stats.record_fetch_failure(), 2);
        assert_eq!(stats.snapshot().consecutive_fetch_failures, 2);

        stats.record_batch(3, 1, Some(10));
        let snap = stats.snapshot();
        assert_eq!(snap.consecutive_fetch_failures, 0);
        assert_eq!(snap.fetch_failures, 2);
        assert_eq!(snap.updates_handled, 3);
        assert_eq!(snap.update_failures, 1);
        assert_eq!(snap.cursor, Some(10));
    }

    #[test]
    fn test_cursor_starts_unset() {
        let stats = PollStats::default();
        stats.record_cycle();
        stats.record_empty_poll();
        let snap = stats.snapshot();
        assert_eq!(snap.cycles, 1);
        assert_eq!(snap.cursor, None);
    }
}
