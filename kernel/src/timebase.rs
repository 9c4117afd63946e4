//! Timebase: the monotonic clock every deadline in this crate is measured
//! against (§6 "Consumed from collaborators").
//!
//! The teacher reads a single MMIO generic-timer register
//! (`arch/aarch64/timer.rs`); a host kernel implementing this core has many
//! more plausible clock sources (TSC, HPET, ARM generic timer, a
//! hypervisor-supplied counter), so the core only depends on the
//! [`Timebase`] trait and never reads hardware itself.

use core::sync::atomic::{AtomicU64, Ordering};

/// Monotonic nanosecond clock plus a cycle counter with a calibrated
/// cycles-per-ns conversion (§6).
pub trait Timebase: Send + Sync {
    /// Monotonically non-decreasing nanosecond timestamp.
    fn now_ns(&self) -> u64;
    /// Monotonically non-decreasing cycle counter. Implementations without
    /// an invariant cycle counter may derive this from `now_ns` times
    /// `cycles_per_ns`, per §9's degraded-precision note.
    fn now_cycles(&self) -> u64;
    /// Calibrated cycles-per-nanosecond ratio. `1.0` is a valid "no real
    /// cycle counter available" fallback.
    fn cycles_per_ns(&self) -> f64;

    /// Whether `now_cycles`/`cycles_per_ns` are backed by a real invariant
    /// counter. `false` means frame-deadline accounting has degraded to
    /// the ns timebase (§4.9, §9 Open Question).
    fn has_invariant_cycles(&self) -> bool {
        true
    }
}

/// Hosted, wall-clock-backed [`Timebase`], grounded on the teacher's
/// `GenericTimer::freq()`/`read()` pair but calibrated against
/// [`std::time::Instant`] instead of a memory-mapped counter, since a hosted
/// test binary has no generic timer to read.
pub struct SystemTimebase {
    start: std::time::Instant,
    cycles_per_ns: f64,
}

impl SystemTimebase {
    /// Calibrates against the host's `Instant`/TSC pairing. `cycles_per_ns`
    /// is fixed at 1.0 (i.e. "cycles" and "nanoseconds" coincide) because a
    /// portable hosted build has no architectural cycle counter to read;
    /// a real kernel's `Timebase` impl overrides this with a measured
    /// ratio.
    pub fn new() -> Self {
        SystemTimebase {
            start: std::time::Instant::now(),
            cycles_per_ns: 1.0,
        }
    }

    /// Builds a timebase with an explicit, already-calibrated
    /// cycles-per-ns ratio (e.g. measured once at boot against an
    /// invariant TSC).
    pub fn with_calibration(cycles_per_ns: f64) -> Self {
        SystemTimebase {
            start: std::time::Instant::now(),
            cycles_per_ns,
        }
    }
}

impl Default for SystemTimebase {
    fn default() -> Self {
        Self::new()
    }
}

impl Timebase for SystemTimebase {
    fn now_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    fn now_cycles(&self) -> u64 {
        (self.now_ns() as f64 * self.cycles_per_ns) as u64
    }

    fn cycles_per_ns(&self) -> f64 {
        self.cycles_per_ns
    }

    fn has_invariant_cycles(&self) -> bool {
        self.cycles_per_ns != 1.0
    }
}

/// Deterministic, manually-advanced [`Timebase`] for scenario tests (§8):
/// the end-to-end scenarios need to fast-forward through slices without a
/// real sleep.
pub struct FakeTimebase {
    ns: AtomicU64,
    cycles_per_ns: f64,
}

impl FakeTimebase {
    pub fn new() -> Self {
        FakeTimebase {
            ns: AtomicU64::new(0),
            cycles_per_ns: 3.0,
        }
    }

    pub fn with_cycles_per_ns(cycles_per_ns: f64) -> Self {
        FakeTimebase {
            ns: AtomicU64::new(0),
            cycles_per_ns,
        }
    }

    pub fn advance_ns(&self, delta: u64) {
        self.ns.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Default for FakeTimebase {
    fn default() -> Self {
        Self::new()
    }
}

impl Timebase for FakeTimebase {
    fn now_ns(&self) -> u64 {
        self.ns.load(Ordering::SeqCst)
    }

    fn now_cycles(&self) -> u64 {
        (self.now_ns() as f64 * self.cycles_per_ns) as u64
    }

    fn cycles_per_ns(&self) -> f64 {
        self.cycles_per_ns
    }

    fn has_invariant_cycles(&self) -> bool {
        self.cycles_per_ns != 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_timebase_advances_monotonically() {
        let tb = FakeTimebase::new();
        assert_eq!(tb.now_ns(), 0);
        tb.advance_ns(1_000_000);
        assert_eq!(tb.now_ns(), 1_000_000);
        tb.advance_ns(500);
        assert_eq!(tb.now_ns(), 1_000_500);
    }

    #[test]
    fn fake_timebase_cycles_track_calibration() {
        let tb = FakeTimebase::with_cycles_per_ns(2.0);
        tb.advance_ns(1_000);
        assert_eq!(tb.now_cycles(), 2_000);
    }

    #[test]
    fn system_timebase_is_monotonic() {
        let tb = SystemTimebase::new();
        let a = tb.now_ns();
        let b = tb.now_ns();
        assert!(b >= a);
    }
}
