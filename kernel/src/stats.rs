//! Observability counters (§6 "Stats").
//!
//! Plain atomics rather than a histogram crate: the counters here are
//! cheap running totals a host kernel samples periodically, not a
//! latency-distribution product — matching the teacher's own
//! `AtomicUsize`/`AtomicU64` style counters rather than reaching for a
//! metrics crate the rest of the stack doesn't otherwise use.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Process-wide (or per-`Core`) running counters.
#[derive(Default)]
pub struct Stats {
    pub context_switches: AtomicU64,
    pub migrations: AtomicU64,
    pub spin_hits: AtomicU64,
    pub spin_misses: AtomicU64,
    pub priority_inversions_detected: AtomicU64,
    pub frame_deadline_misses: AtomicU64,

    wait_latency_total_ns: AtomicU64,
    wait_latency_count: AtomicU64,
    wait_latency_max_ns: AtomicU64,

    /// Set once and never cleared if the host reported no usable cycle
    /// counter and the timebase fell back to nanosecond precision (§9
    /// resolved Open Question 3).
    pub degraded_precision: AtomicBool,
}

impl Stats {
    pub fn record_context_switch(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_migration(&self) {
        self.migrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_priority_inversion(&self) {
        self.priority_inversions_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_deadline_miss(&self) {
        self.frame_deadline_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wait_latency_ns(&self, latency_ns: u64) {
        self.wait_latency_total_ns.fetch_add(latency_ns, Ordering::Relaxed);
        self.wait_latency_count.fetch_add(1, Ordering::Relaxed);
        self.wait_latency_max_ns.fetch_max(latency_ns, Ordering::Relaxed);
    }

    pub fn mark_degraded_precision(&self) {
        self.degraded_precision.store(true, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let count = self.wait_latency_count.load(Ordering::Relaxed);
        let total = self.wait_latency_total_ns.load(Ordering::Relaxed);
        StatsSnapshot {
            context_switches: self.context_switches.load(Ordering::Relaxed),
            migrations: self.migrations.load(Ordering::Relaxed),
            spin_hits: self.spin_hits.load(Ordering::Relaxed),
            spin_misses: self.spin_misses.load(Ordering::Relaxed),
            priority_inversions_detected: self.priority_inversions_detected.load(Ordering::Relaxed),
            frame_deadline_misses: self.frame_deadline_misses.load(Ordering::Relaxed),
            avg_wait_latency_ns: if count == 0 { 0 } else { total / count },
            max_wait_latency_ns: self.wait_latency_max_ns.load(Ordering::Relaxed),
            degraded_precision: self.degraded_precision.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time, plain-data copy of [`Stats`] for reporting across an
/// FFI or log-line boundary where atomics themselves aren't useful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub context_switches: u64,
    pub migrations: u64,
    pub spin_hits: u64,
    pub spin_misses: u64,
    pub priority_inversions_detected: u64,
    pub frame_deadline_misses: u64,
    pub avg_wait_latency_ns: u64,
    pub max_wait_latency_ns: u64,
    pub degraded_precision: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_averages_recorded_latencies() {
        let stats = Stats::default();
        stats.record_wait_latency_ns(100);
        stats.record_wait_latency_ns(300);
        let snap = stats.snapshot();
        assert_eq!(snap.avg_wait_latency_ns, 200);
        assert_eq!(snap.max_wait_latency_ns, 300);
    }

    #[test]
    fn degraded_precision_latches_true() {
        let stats = Stats::default();
        assert!(!stats.snapshot().degraded_precision);
        stats.mark_degraded_precision();
        assert!(stats.snapshot().degraded_precision);
    }
}
