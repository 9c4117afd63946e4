//! Tunable knobs for the scheduling core.
//!
//! `spec.md` fixes these as literal constants; here they are fields of a
//! config struct with defaults matching the literals exactly, so a host
//! kernel can override them at boot rather than needing a recompile.

/// Minimum effective slice, in nanoseconds.
pub const SLICE_MIN: u64 = 750_000;
/// Maximum effective slice, in nanoseconds.
pub const SLICE_MAX: u64 = 6_000_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedConfig {
    /// Base slice unit (§4.1): effective slice = 6 * slice_min scaled by weight.
    pub slice_min_ns: u64,
    pub slice_max_ns: u64,

    /// Burst penalty applied per point above the threshold (§4.2).
    pub burst_penalty_non_gaming: u64,
    pub burst_penalty_gaming: u64,
    /// Burst score threshold above which enqueue-time penalty applies.
    pub burst_penalty_threshold: i32,
    /// Burst score bounds (§3 invariant f).
    pub burst_score_max: i32,

    /// Gaming-class weight boosts added to `weight_effective` (§4.1).
    pub gaming_boost_gaming: u32,
    pub gaming_boost_frame_critical: u32,
    pub gaming_boost_input: u32,
    pub gaming_boost_audio: u32,

    /// Migration hysteresis thresholds (§4.3), as fractions (0.20 == 20%).
    pub migration_threshold_normal: f64,
    pub migration_threshold_gaming: f64,
    pub migration_min_interval_ns: u64,

    /// Periodic rebalance cadence (§4.3).
    pub rebalance_period_normal_ns: u64,
    pub rebalance_period_gaming_ns: u64,
    pub rebalance_load_avg_threshold: f64,

    /// Placement thermal cutoff, degrees C (§4.3).
    pub thermal_limit_celsius: f64,

    /// Adaptive spin base cycle counts (§4.5).
    pub spin_base_cycles: u64,
    pub spin_base_cycles_gaming: u64,
    pub spin_base_cycles_frame_critical: u64,
    pub spin_multiplier_min: f64,
    pub spin_multiplier_max: f64,
    pub spin_multiplier_success_factor: f64,
    pub spin_multiplier_miss_factor: f64,

    /// Dependency-edge staleness window (§3, §4.4).
    pub edge_stale_after_ns: u64,

    /// Frame-deadline hook (§4.6).
    pub frame_miss_boost_cap_misses: u32,
    pub frame_miss_boost_floor_nice: i32,
    pub vrr_stable_frames_to_adjust: u32,

    /// Input-eligible tie-break window for "frame deadline within X% of
    /// frame time" (§4.1 pick_next tie-break b).
    pub frame_deadline_near_fraction: f64,
}

impl Default for SchedConfig {
    fn default() -> Self {
        SchedConfig {
            slice_min_ns: SLICE_MIN,
            slice_max_ns: SLICE_MAX,

            burst_penalty_non_gaming: 8,
            burst_penalty_gaming: 4,
            burst_penalty_threshold: 20,
            burst_score_max: 39,

            gaming_boost_gaming: 2048,
            gaming_boost_frame_critical: 4096,
            gaming_boost_input: 8192,
            gaming_boost_audio: 3072,

            migration_threshold_normal: 0.20,
            migration_threshold_gaming: 0.15,
            migration_min_interval_ns: 10_000_000_000,

            rebalance_period_normal_ns: 16_670_000,
            rebalance_period_gaming_ns: 8_330_000,
            rebalance_load_avg_threshold: 2.0,

            thermal_limit_celsius: 80.0,

            spin_base_cycles: 1_000,
            spin_base_cycles_gaming: 5_000,
            spin_base_cycles_frame_critical: 10_000,
            spin_multiplier_min: 0.5,
            spin_multiplier_max: 2.0,
            spin_multiplier_success_factor: 1.1,
            spin_multiplier_miss_factor: 0.9,

            edge_stale_after_ns: 5_000_000_000,

            frame_miss_boost_cap_misses: 3,
            frame_miss_boost_floor_nice: -18,
            vrr_stable_frames_to_adjust: 5,

            frame_deadline_near_fraction: 0.25,
        }
    }
}
