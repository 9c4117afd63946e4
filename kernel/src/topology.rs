//! Topology map (§2, §3 "Topology CPU record", §6 "Consumed from
//! collaborators: Topology").
//!
//! Static per-boot description of CPUs, built once from collaborator-
//! supplied [`CpuFacts`] and then mutated only through the live counters
//! (load average, cache pressure, temperature) that [`crate::placement`]
//! and the scheduler tick update. The teacher has no topology concept at
//! all (one aarch64 board, one class of CPU); this module is grounded on
//! the hybrid/cache-asymmetric vocabulary spelled out in spec.md §3-4.3.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use smallvec::SmallVec;

/// A CPU's scheduling class in a hybrid topology (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuClass {
    Performance,
    Efficiency,
    CacheOptimized,
}

/// One level of a cache hierarchy (§3 "cache-sharing membership set per
/// level").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheLevel {
    L1,
    L2,
    L3,
}

/// Static facts about one CPU, supplied by the collaborator at boot
/// (§6 "CPU-class capabilities").
#[derive(Debug, Clone)]
pub struct CpuFacts {
    pub id: u32,
    pub class: CpuClass,
    pub numa_node: u32,
    pub max_freq_mhz: u32,
    pub baseline_freq_mhz: u32,
    /// Sets of CPU ids sharing each cache level with this CPU (including
    /// itself).
    pub cache_sharing: [CacheShareSet; 3],
    /// Last-level cache capacity in bytes, used for the cache-pressure
    /// estimate (`resident footprint / capacity`, §3).
    pub llc_capacity_bytes: u64,
    /// Whether the last-level cache is 3D-stacked / augmented (§4.3
    /// "cache score doubles if C has augmented cache").
    pub augmented_cache: bool,
    /// Static efficiency rating in `[0, 1]` (§4.3 "efficiency bonus").
    pub efficiency_rating: f64,
    /// Whether this CPU is additionally marked as a preferred target for
    /// gaming workloads (§4.3 "+5 if C also tagged gaming-preferred").
    pub gaming_preferred: bool,
}

/// A CPU-id membership set for one cache level. At most a few dozen CPUs
/// share any given cache, so a small inline vector beats a general-purpose
/// bitset crate here.
#[derive(Debug, Clone, Default)]
pub struct CacheShareSet(SmallVec<[u32; 8]>);

impl CacheShareSet {
    pub fn new(ids: impl IntoIterator<Item = u32>) -> Self {
        CacheShareSet(ids.into_iter().collect())
    }

    pub fn contains(&self, id: u32) -> bool {
        self.0.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Live, frequently-updated counters for one CPU (§3). Updated with atomic
/// read-modify-write per §5 ("aggregate consumers tolerate transient
/// inconsistency"), so no lock is taken to read or update them.
#[derive(Debug)]
pub struct CpuLive {
    /// Exponential load average, α = 0.1, fixed-point with 16 fractional
    /// bits so it can live in an `AtomicU64`.
    load_avg_fx: AtomicU64,
    /// Cache pressure estimate in `[0, 1]`, same fixed-point encoding.
    cache_pressure_fx: AtomicU64,
    /// Degrees C ×100, or `u32::MAX` if temperature is unavailable.
    temperature_centi_c: AtomicU32,
}

const FX_SHIFT: u32 = 32;
const FX_ONE: u64 = 1 << FX_SHIFT;
const LOAD_AVG_ALPHA: f64 = 0.1;

fn to_fx(x: f64) -> u64 {
    (x.clamp(0.0, 1024.0) * FX_ONE as f64) as u64
}

fn from_fx(x: u64) -> f64 {
    x as f64 / FX_ONE as f64
}

impl CpuLive {
    fn new() -> Self {
        CpuLive {
            load_avg_fx: AtomicU64::new(0),
            cache_pressure_fx: AtomicU64::new(0),
            temperature_centi_c: AtomicU32::new(u32::MAX),
        }
    }

    pub fn load_avg(&self) -> f64 {
        from_fx(self.load_avg_fx.load(Ordering::Relaxed))
    }

    /// Folds one fresh sample into the exponential moving average:
    /// `avg = avg*(1-α) + sample*α` (§3).
    pub fn record_load_sample(&self, sample: f64) {
        let prev = from_fx(self.load_avg_fx.load(Ordering::Relaxed));
        let next = prev * (1.0 - LOAD_AVG_ALPHA) + sample * LOAD_AVG_ALPHA;
        self.load_avg_fx.store(to_fx(next), Ordering::Relaxed);
    }

    pub fn cache_pressure(&self) -> f64 {
        from_fx(self.cache_pressure_fx.load(Ordering::Relaxed)).clamp(0.0, 1.0)
    }

    /// Sets the cache-pressure estimate directly: sum of resident-task
    /// memory footprints divided by shared-cache capacity, clamped to
    /// `[0, 1]` (§3).
    pub fn set_cache_pressure(&self, resident_bytes: u64, capacity_bytes: u64) {
        let pressure = if capacity_bytes == 0 {
            0.0
        } else {
            (resident_bytes as f64 / capacity_bytes as f64).clamp(0.0, 1.0)
        };
        self.cache_pressure_fx.store(to_fx(pressure), Ordering::Relaxed);
    }

    pub fn temperature_c(&self) -> Option<f64> {
        let raw = self.temperature_centi_c.load(Ordering::Relaxed);
        if raw == u32::MAX {
            None
        } else {
            Some(raw as f64 / 100.0)
        }
    }

    pub fn set_temperature_c(&self, celsius: f64) {
        self.temperature_centi_c
            .store((celsius * 100.0) as u32, Ordering::Relaxed);
    }
}

/// One CPU's complete record: static facts plus live counters.
pub struct CpuRecord {
    pub facts: CpuFacts,
    pub live: CpuLive,
}

impl CpuRecord {
    fn new(facts: CpuFacts) -> Self {
        CpuRecord {
            facts,
            live: CpuLive::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.facts.id
    }

    pub fn class(&self) -> CpuClass {
        self.facts.class
    }

    pub fn numa_node(&self) -> u32 {
        self.facts.numa_node
    }

    pub fn shares_cache(&self, level: CacheLevel, other: u32) -> bool {
        self.facts.cache_sharing[level as usize].contains(other)
    }
}

/// Exactly one process-wide instance per §9 "Global state": the static
/// per-boot description of CPUs.
pub struct Topology {
    cpus: Vec<CpuRecord>,
}

impl Topology {
    /// Builds the topology map from collaborator-supplied facts. Called
    /// once at boot, per §9's init order (timebase → topology → graph →
    /// wait-words → run-queues).
    pub fn new(facts: Vec<CpuFacts>) -> Self {
        Topology {
            cpus: facts.into_iter().map(CpuRecord::new).collect(),
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn cpu(&self, id: u32) -> Option<&CpuRecord> {
        self.cpus.get(id as usize)
    }

    pub fn cpus(&self) -> impl Iterator<Item = &CpuRecord> {
        self.cpus.iter()
    }
}

#[cfg(test)]
pub(crate) fn uniform_test_topology(n: u32, class: CpuClass) -> Topology {
    let facts = (0..n)
        .map(|id| CpuFacts {
            id,
            class,
            numa_node: 0,
            max_freq_mhz: 3_000,
            baseline_freq_mhz: 2_000,
            cache_sharing: [
                CacheShareSet::new(0..n),
                CacheShareSet::new(0..n),
                CacheShareSet::new(0..n),
            ],
            llc_capacity_bytes: 32 * 1024 * 1024,
            augmented_cache: false,
            efficiency_rating: 0.5,
            gaming_preferred: false,
        })
        .collect();
    Topology::new(facts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_avg_ema_converges_toward_repeated_sample() {
        let live = CpuLive::new();
        for _ in 0..200 {
            live.record_load_sample(1.0);
        }
        assert!((live.load_avg() - 1.0).abs() < 0.01);
    }

    #[test]
    fn cache_pressure_clamped_to_unit_interval() {
        let live = CpuLive::new();
        live.set_cache_pressure(64 * 1024 * 1024, 32 * 1024 * 1024);
        assert_eq!(live.cache_pressure(), 1.0);
    }

    #[test]
    fn temperature_starts_unavailable() {
        let live = CpuLive::new();
        assert_eq!(live.temperature_c(), None);
        live.set_temperature_c(72.5);
        assert_eq!(live.temperature_c(), Some(72.5));
    }

    #[test]
    fn topology_looks_up_by_id() {
        let topo = uniform_test_topology(4, CpuClass::Performance);
        assert_eq!(topo.cpu_count(), 4);
        assert_eq!(topo.cpu(2).unwrap().id(), 2);
        assert!(topo.cpu(9).is_none());
    }
}
