//! Placement engine for hybrid / cache-asymmetric / NUMA topologies
//! (§4.3).

use crate::config::SchedConfig;
use crate::task::{PlacementState, Task};
use crate::topology::{CpuClass, CpuRecord, Topology};

/// §4.3 "The task's preferred class is inferred from tags and recent
/// counters".
pub fn infer_preferred_class(task: &Task) -> CpuClass {
    if task.tags.is_input() || task.tags.is_audio() {
        return CpuClass::Performance;
    }
    let cache_sensitive = task.tags.is_frame_critical()
        || task.placement.working_set_bytes > 32 * 1024 * 1024;
    if cache_sensitive {
        return CpuClass::CacheOptimized;
    }
    if task.placement.background && task.placement.io_wait_fraction > 0.5 {
        return CpuClass::Efficiency;
    }
    CpuClass::Performance
}

/// §4.3 scoring table. Returns the raw additive score; higher is better.
pub fn score_cpu(task: &Task, cpu: &CpuRecord, gaming_mode: bool) -> f64 {
    let preferred = infer_preferred_class(task);
    let mut score = 0.0;

    score += match (preferred, cpu.class()) {
        (a, b) if a == b => 10.0,
        (CpuClass::CacheOptimized, CpuClass::Performance) => 7.0,
        (CpuClass::Performance, CpuClass::Efficiency) => 2.0,
        _ => 0.0,
    };

    let cache_sensitivity = if task.tags.is_frame_critical() || task.placement.working_set_bytes > 32 * 1024 * 1024 {
        1.0
    } else {
        0.3
    };
    let mut cache_score = cache_sensitivity;
    if cpu.facts.augmented_cache {
        cache_score *= 2.0;
    }
    score += 5.0 * cache_score;

    if task.tags.is_gaming() && cpu.class() == CpuClass::Performance {
        score += 15.0;
        if cpu.facts.gaming_preferred {
            score += 5.0;
        }
    }

    score += 3.0 * (1.0 - cpu.live.load_avg().min(1.0));
    score -= 5.0 * cpu.live.cache_pressure();

    if task.placement.background {
        score += 3.0 * cpu.facts.efficiency_rating;
    }

    if let Some(temp) = cpu.live.temperature_c() {
        if temp > 80.0 {
            score -= 10.0;
        }
    }

    if task.placement.last_cpu == Some(cpu.id()) {
        score += 2.0;
    }

    if let Some(node) = task.placement.numa_node {
        if node == cpu.numa_node() {
            score += 100.0;
        }
    }

    let _ = gaming_mode; // scoring table itself is gaming-mode-agnostic; only hysteresis/rebalance cadence change.
    score
}

/// Result of a placement decision (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub cpu_id: u32,
    pub migrated: bool,
}

/// §4.3 "Choose a CPU for a newly ready or newly created task, and
/// re-evaluate placement periodically with hysteresis."
///
/// `now_ns` is used only for the migration-interval check; scoring itself
/// is stateless given `topology`'s live counters.
pub fn place_task(
    task: &Task,
    topology: &Topology,
    gaming_mode: bool,
    now_ns: u64,
    cfg: &SchedConfig,
) -> Placement {
    debug_assert!(topology.cpu_count() > 0, "topology must have at least one CPU");

    let mut best: Option<(u32, f64)> = None;
    for cpu in topology.cpus() {
        let s = score_cpu(task, cpu, gaming_mode);
        if best.map_or(true, |(_, best_score)| s > best_score) {
            best = Some((cpu.id(), s));
        }
    }
    // §4.3 "Failure semantics": an idle CPU is always admissible, so
    // `best` is always `Some` given a non-empty topology.
    let (candidate_id, candidate_score) = best.expect("topology has at least one CPU");

    let Some(current_id) = task.placement.last_cpu else {
        return Placement { cpu_id: candidate_id, migrated: false };
    };

    if current_id == candidate_id {
        return Placement { cpu_id: current_id, migrated: false };
    }

    let current_cpu = topology
        .cpu(current_id)
        .expect("last_cpu must reference a live CPU");
    let current_score = score_cpu(task, current_cpu, gaming_mode);

    let threshold = if gaming_mode {
        cfg.migration_threshold_gaming
    } else {
        cfg.migration_threshold_normal
    };
    let elapsed_ok = now_ns.saturating_sub(task.placement.last_migration_ns)
        >= cfg.migration_min_interval_ns;

    let improved_enough = current_score <= 0.0
        || (candidate_score - current_score) / current_score.abs().max(1e-9) >= threshold;

    if improved_enough && elapsed_ok {
        Placement { cpu_id: candidate_id, migrated: true }
    } else {
        Placement { cpu_id: current_id, migrated: false }
    }
}

/// §4.3 "Periodic rebalance": for each over-loaded, multi-task CPU, look
/// for a background-tagged task to move to the least-loaded CPU of its
/// preferred class. Returns `(from_cpu, task_id, to_cpu)` moves the
/// caller should actually carry out (this function only decides; it does
/// not mutate run-queues, which the engine owns).
pub fn rebalance_candidates(
    topology: &Topology,
    ready_counts: &[(u32, usize)],
    background_tasks_per_cpu: &[(u32, Vec<&Task>)],
    cfg: &SchedConfig,
) -> Vec<(u32, usize, u32)> {
    let mut moves = Vec::new();
    for &(from_cpu, count) in ready_counts {
        let Some(from) = topology.cpu(from_cpu) else { continue };
        if from.live.load_avg() <= cfg.rebalance_load_avg_threshold || count <= 1 {
            continue;
        }
        let Some((_, candidates)) = background_tasks_per_cpu.iter().find(|(c, _)| *c == from_cpu)
        else {
            continue;
        };
        let Some(task) = candidates.first() else { continue };
        let preferred = infer_preferred_class(task);

        let target = topology
            .cpus()
            .filter(|c| c.id() != from_cpu && c.class() == preferred)
            .min_by(|a, b| a.live.load_avg().partial_cmp(&b.live.load_avg()).unwrap());

        if let Some(target) = target {
            moves.push((from_cpu, task.id, target.id()));
        }
    }
    moves
}

pub fn placement_default() -> PlacementState {
    PlacementState::default()
}
