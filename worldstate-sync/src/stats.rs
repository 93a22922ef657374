//! Pipeline health counters.
//!
//! Updated by the worker with relaxed atomics, read via [`PipelineStats::snapshot`].

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Raw messages waiting in the ingress queue
    pub queue_len: u64,
    /// Tick messages fully applied
    pub ticks_processed: u64,
    /// Messages dropped because they could not be decoded
    pub messages_failed: u64,
    /// Individual changes skipped (malformed or invalid patch)
    pub patches_rejected: u64,
    /// Tick regressions observed
    pub protocol_violations: u64,
    pub process_time_total: Duration,
    pub process_time_max: Duration,
    /// Wall time minus `ts` of the last applied tick, in milliseconds
    pub last_tick_delay_ms: i64,
    pub max_tick_delay_ms: i64,
    pub snapshot_loads: u64,
    pub snapshot_failures: u64,
    pub resets: u64,
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    queue_len: AtomicU64,
    ticks_processed: AtomicU64,
    messages_failed: AtomicU64,
    patches_rejected: AtomicU64,
    protocol_violations: AtomicU64,
    process_micros_total: AtomicU64,
    process_micros_max: AtomicU64,
    last_tick_delay_ms: AtomicI64,
    max_tick_delay_ms: AtomicI64,
    snapshot_loads: AtomicU64,
    snapshot_failures: AtomicU64,
    resets: AtomicU64,
}

impl PipelineStats {
    pub(crate) fn set_queue_len(&self, len: usize) {
        self.queue_len.store(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_tick(&self, elapsed: Duration, delay_ms: i64) {
        let micros = elapsed.as_micros() as u64;
        self.ticks_processed.fetch_add(1, Ordering::Relaxed);
        self.process_micros_total.fetch_add(micros, Ordering::Relaxed);
        self.process_micros_max.fetch_max(micros, Ordering::Relaxed);
        self.last_tick_delay_ms.store(delay_ms, Ordering::Relaxed);
        self.max_tick_delay_ms.fetch_max(delay_ms, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_message(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected_patches(&self, count: usize) {
        self.patches_rejected.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_snapshot_load(&self) {
        self.snapshot_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_snapshot_failure(&self) {
        self.snapshot_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queue_len: self.queue_len.load(Ordering::Relaxed),
            ticks_processed: self.ticks_processed.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            patches_rejected: self.patches_rejected.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            process_time_total: Duration::from_micros(self.process_micros_total.load(Ordering::Relaxed)),
            process_time_max: Duration::from_micros(self.process_micros_max.load(Ordering::Relaxed)),
            last_tick_delay_ms: self.last_tick_delay_ms.load(Ordering::Relaxed),
            max_tick_delay_ms: self.max_tick_delay_ms.load(Ordering::Relaxed),
            snapshot_loads: self.snapshot_loads.load(Ordering::Relaxed),
            snapshot_failures: self.snapshot_failures.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_recording_tracks_max() {
        let stats = PipelineStats::default();
        stats.record_tick(Duration::from_micros(300), 40);
        stats.record_tick(Duration::from_micros(100), 15);

        let snap = stats.snapshot();
        assert_eq!(snap.ticks_processed, 2);
        assert_eq!(snap.process_time_total, Duration::from_micros(400));
        assert_eq!(snap.process_time_max, Duration::from_micros(300));
        assert_eq!(snap.last_tick_delay_ms, 15);
        assert_eq!(snap.max_tick_delay_ms, 40);
    }
}
