//! Burst-penalty accounting (§4.2).
//!
//! Penalizes tasks whose runs are consistently long relative to
//! `SLICE_MIN` so latency-sensitive siblings are not starved. Kept as its
//! own module (mirroring spec.md's own 4.2 split from 4.1) even though it
//! only ever touches a [`crate::task::Task`]'s `burst` field, so the state
//! machine and its single enqueue-time consumer stay easy to find and test
//! independently of the run-queue's ordering logic.
//!
//! §9's Open Question ("burst score mixed into vruntime at enqueue and
//! again as a preemption trigger") is resolved here as: the *penalty* (an
//! addition to vruntime) is applied at enqueue only; `should_preempt`'s own
//! `burst_score > 25` clause (spec.md §4.1) is a separate, already-explicit
//! trigger and is not a second instance of this mixing.

use crate::config::SchedConfig;
use crate::task::{BurstWindow, GamingTags};

/// Updates the burst score after a slice of length `delta_exec_ns` ends
/// (§4.2 "State machine"). Moves by at most ±1 per call (invariant f).
pub fn update_burst_score(burst: &mut BurstWindow, delta_exec_ns: u64, cfg: &SchedConfig) {
    burst.prev_burst_ns = burst.last_burst_ns;
    burst.last_burst_ns = delta_exec_ns;

    if delta_exec_ns > 4 * cfg.slice_min_ns {
        burst.score = (burst.score + 1).min(cfg.burst_score_max);
    } else if delta_exec_ns < cfg.slice_min_ns / 2 {
        burst.score = (burst.score - 1).max(0);
    }
}

/// Enqueue-time penalty added to vruntime (§4.2): `(score - 20) * penalty`
/// once `score` exceeds the threshold, zero otherwise. Gaming-tagged tasks
/// get the gaming penalty constant (already halved relative to
/// non-gaming, per spec.md's literal defaults) and nothing is doubled on
/// top of that.
pub fn enqueue_penalty(burst: &BurstWindow, tags: GamingTags, cfg: &SchedConfig) -> u64 {
    if burst.score <= cfg.burst_penalty_threshold {
        return 0;
    }
    let penalty_unit = if tags.is_gaming() {
        cfg.burst_penalty_gaming
    } else {
        cfg.burst_penalty_non_gaming
    };
    (burst.score - cfg.burst_penalty_threshold) as u64 * penalty_unit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_rises_on_long_slice_and_falls_on_short_slice() {
        let cfg = SchedConfig::default();
        let mut burst = BurstWindow::default();
        update_burst_score(&mut burst, 5 * cfg.slice_min_ns, &cfg);
        assert_eq!(burst.score, 1);
        update_burst_score(&mut burst, cfg.slice_min_ns / 4, &cfg);
        assert_eq!(burst.score, 0);
    }

    #[test]
    fn score_clamps_at_bounds_under_100_consecutive_bursts() {
        let cfg = SchedConfig::default();
        let mut burst = BurstWindow::default();
        for _ in 0..100 {
            update_burst_score(&mut burst, 100 * cfg.slice_min_ns, &cfg);
        }
        assert_eq!(burst.score, cfg.burst_score_max);

        for _ in 0..100 {
            update_burst_score(&mut burst, 0, &cfg);
        }
        assert_eq!(burst.score, 0);
    }

    #[test]
    fn penalty_is_zero_at_or_below_threshold() {
        let cfg = SchedConfig::default();
        let mut burst = BurstWindow::default();
        burst.score = cfg.burst_penalty_threshold;
        assert_eq!(enqueue_penalty(&burst, GamingTags::empty(), &cfg), 0);
    }

    #[test]
    fn gaming_penalty_is_smaller_than_non_gaming_at_same_score() {
        let cfg = SchedConfig::default();
        let mut burst = BurstWindow::default();
        burst.score = cfg.burst_score_max;
        let non_gaming = enqueue_penalty(&burst, GamingTags::empty(), &cfg);
        let gaming = enqueue_penalty(&burst, GamingTags::GAMING, &cfg);
        assert!(gaming < non_gaming);
    }
}
