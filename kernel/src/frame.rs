//! Frame-deadline hook (§4.6, §4.9).
//!
//! Per-gaming-task frame-pacing state: an expected next-deadline cycle
//! stamp set on frame start and checked on frame complete, a bounded
//! priority boost on consecutive misses, and a variable-refresh-rate
//! controller that nudges the target FPS after a run of stable frames.
//! The teacher has no notion of frame pacing at all (a generic CFS
//! run-queue); this module's shape is grounded on the EMA/hysteresis
//! style already used in [`crate::topology`]'s live counters rather than
//! on any teacher file.

use crate::config::SchedConfig;
use crate::stats::Stats;
use crate::task::Task;
use crate::timebase::Timebase;

const DEFAULT_TARGET_FPS: f64 = 60.0;
const DEFAULT_MIN_FPS: f64 = 30.0;
const DEFAULT_MAX_FPS: f64 = 240.0;
const VRR_STEP_UP: f64 = 1.05;
const VRR_STEP_DOWN: f64 = 0.95;
/// A frame finishing this much earlier than its period counts as "fast"
/// for VRR trend purposes, distinct from simply not missing.
const FAST_FRAME_FRACTION: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameTrend {
    None,
    Faster,
    Slower,
}

/// Per-task frame-pacing state (§3, §4.6). Present on every [`Task`] but
/// inert until [`mark_frame_start`]/[`mark_frame_complete`] are called on
/// it (i.e. only gaming tasks with frame tracking enabled ever move these
/// fields away from their defaults).
#[derive(Debug, Clone, Copy)]
pub struct FrameState {
    pub target_fps: f64,
    min_fps: f64,
    max_fps: f64,

    pub expected_next_deadline_cycles: u64,
    frame_start_cycles: u64,

    pub frame_count: u64,
    pub miss_count: u64,
    pub consecutive_misses: u32,
    boosted_nice: Option<i32>,

    trend: FrameTrend,
    trend_run: u32,
}

impl Default for FrameState {
    fn default() -> Self {
        FrameState {
            target_fps: DEFAULT_TARGET_FPS,
            min_fps: DEFAULT_MIN_FPS,
            max_fps: DEFAULT_MAX_FPS,
            expected_next_deadline_cycles: 0,
            frame_start_cycles: 0,
            frame_count: 0,
            miss_count: 0,
            consecutive_misses: 0,
            boosted_nice: None,
            trend: FrameTrend::None,
            trend_run: 0,
        }
    }
}

impl FrameState {
    /// §6 `set_frame_rate(id, fps)`: sets the VRR target, clamped to the
    /// configured band.
    pub fn set_target_fps(&mut self, fps: f64) {
        self.target_fps = fps.clamp(self.min_fps, self.max_fps);
    }

    /// The nice-value override a consecutive-miss boost currently
    /// imposes, if any (§4.6 "boost priority... capped after 3 misses at
    /// nice −18"). Folded into [`Task::effective_priority`].
    pub fn priority_override(&self) -> Option<i32> {
        self.boosted_nice
    }

    fn period_cycles(&self, cycles_per_ns: f64) -> u64 {
        let period_ns = 1_000_000_000.0 / self.target_fps;
        (period_ns * cycles_per_ns) as u64
    }
}

/// §4.6 "on frame start, set [expected_next_deadline_cycles]".
pub fn mark_frame_start(task: &mut Task, timebase: &dyn Timebase) {
    let now = timebase.now_cycles();
    let period = task.frame.period_cycles(timebase.cycles_per_ns());
    task.frame.frame_start_cycles = now;
    task.frame.expected_next_deadline_cycles = now + period;
}

/// §4.6 "on frame complete, compare to current cycles and update
/// statistics; on deadline miss, boost priority...; drive [the VRR
/// controller]". Returns whether this frame missed its deadline.
pub fn mark_frame_complete(
    task: &mut Task,
    timebase: &dyn Timebase,
    cfg: &SchedConfig,
    stats: &Stats,
) -> bool {
    if !timebase.has_invariant_cycles() {
        // §9 resolved Open Question 3: no cycle counter degrades to the
        // ns timebase rather than failing frame tracking outright.
        stats.mark_degraded_precision();
    }

    let base_nice = task.base_priority();
    let now = timebase.now_cycles();
    let missed = now > task.frame.expected_next_deadline_cycles;
    let period = task.frame.period_cycles(timebase.cycles_per_ns());
    let actual = now.saturating_sub(task.frame.frame_start_cycles);

    task.frame.frame_count += 1;
    if missed {
        task.frame.miss_count += 1;
        stats.record_frame_deadline_miss();
        task.frame.consecutive_misses =
            (task.frame.consecutive_misses + 1).min(cfg.frame_miss_boost_cap_misses);
        let levels = task.frame.consecutive_misses as i32;
        let boosted = (base_nice - levels).max(cfg.frame_miss_boost_floor_nice);
        task.frame.boosted_nice = Some(boosted);
    } else {
        task.frame.consecutive_misses = 0;
        task.frame.boosted_nice = None;
    }

    let fast_threshold = (period as f64 * FAST_FRAME_FRACTION) as u64;
    let trend = if actual <= fast_threshold {
        FrameTrend::Faster
    } else if missed {
        FrameTrend::Slower
    } else {
        FrameTrend::None
    };

    if trend != FrameTrend::None && trend == task.frame.trend {
        task.frame.trend_run += 1;
    } else {
        task.frame.trend = trend;
        task.frame.trend_run = u32::from(trend != FrameTrend::None);
    }

    if task.frame.trend_run >= cfg.vrr_stable_frames_to_adjust {
        match trend {
            FrameTrend::Faster => {
                let fps = task.frame.target_fps * VRR_STEP_UP;
                task.frame.set_target_fps(fps);
            }
            FrameTrend::Slower => {
                let fps = task.frame.target_fps * VRR_STEP_DOWN;
                task.frame.set_target_fps(fps);
            }
            FrameTrend::None => {}
        }
        task.frame.trend_run = 0;
    }

    missed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timebase::FakeTimebase;

    #[test]
    fn on_time_frame_does_not_boost_priority() {
        let tb = FakeTimebase::with_cycles_per_ns(1.0);
        let cfg = SchedConfig::default();
        let stats = Stats::default();
        let mut task = Task::new(0, 0);
        task.frame.set_target_fps(60.0);

        mark_frame_start(&mut task, &tb);
        tb.advance_ns((1_000_000_000.0 / 60.0) as u64 / 2);
        let missed = mark_frame_complete(&mut task, &tb, &cfg, &stats);

        assert!(!missed);
        assert_eq!(task.frame.priority_override(), None);
        assert_eq!(task.effective_priority(), 0);
    }

    #[test]
    fn consecutive_misses_boost_priority_and_cap_at_three() {
        let tb = FakeTimebase::with_cycles_per_ns(1.0);
        let cfg = SchedConfig::default();
        let stats = Stats::default();
        let mut task = Task::new(0, 0);
        task.frame.set_target_fps(120.0);
        let period_ns = (1_000_000_000.0 / 120.0) as u64;

        for expected_level in 1..=5 {
            mark_frame_start(&mut task, &tb);
            tb.advance_ns(period_ns * 2); // always late
            let missed = mark_frame_complete(&mut task, &tb, &cfg, &stats);
            assert!(missed);
            let expected_levels = expected_level.min(cfg.frame_miss_boost_cap_misses) as i32;
            assert_eq!(task.frame.consecutive_misses, expected_levels as u32);
            assert_eq!(
                task.frame.priority_override(),
                Some((0 - expected_levels).max(cfg.frame_miss_boost_floor_nice))
            );
        }
        assert_eq!(task.frame.priority_override(), Some(-3));
    }

    #[test]
    fn a_hit_after_misses_clears_the_boost() {
        let tb = FakeTimebase::with_cycles_per_ns(1.0);
        let cfg = SchedConfig::default();
        let stats = Stats::default();
        let mut task = Task::new(0, 0);
        task.frame.set_target_fps(60.0);
        let period_ns = (1_000_000_000.0 / 60.0) as u64;

        mark_frame_start(&mut task, &tb);
        tb.advance_ns(period_ns * 2);
        mark_frame_complete(&mut task, &tb, &cfg, &stats);
        assert!(task.frame.priority_override().is_some());

        mark_frame_start(&mut task, &tb);
        tb.advance_ns(period_ns / 2);
        mark_frame_complete(&mut task, &tb, &cfg, &stats);
        assert_eq!(task.frame.priority_override(), None);
        assert_eq!(task.effective_priority(), task.base_priority());
    }

    #[test]
    fn consistently_fast_frames_raise_target_fps() {
        let tb = FakeTimebase::with_cycles_per_ns(1.0);
        let cfg = SchedConfig::default();
        let stats = Stats::default();
        let mut task = Task::new(0, 0);
        task.frame.set_target_fps(60.0);
        let initial = task.frame.target_fps;
        let period_ns = (1_000_000_000.0 / 60.0) as u64;

        for _ in 0..cfg.vrr_stable_frames_to_adjust {
            mark_frame_start(&mut task, &tb);
            tb.advance_ns(period_ns / 4); // comfortably under the fast threshold
            mark_frame_complete(&mut task, &tb, &cfg, &stats);
        }

        assert!(task.frame.target_fps > initial, "sustained headroom should raise target fps");
    }

    #[test]
    fn degraded_precision_is_reported_to_stats() {
        let tb = FakeTimebase::with_cycles_per_ns(1.0); // has_invariant_cycles() == false at 1.0
        let cfg = SchedConfig::default();
        let stats = Stats::default();
        let mut task = Task::new(0, 0);

        mark_frame_start(&mut task, &tb);
        mark_frame_complete(&mut task, &tb, &cfg, &stats);

        assert!(stats.snapshot().degraded_precision);
    }
}
