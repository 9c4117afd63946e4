//! Run-queue and virtual-deadline scheduler (§4.1).
//!
//! One [`RunQueue`] per CPU, single-writer (the CPU that owns it, per §5).
//! Ordered by virtual deadline; the teacher's own `task/executor/mod.rs`
//! uses a `priority_queue::PriorityQueue` the same way for its CFS
//! run-queue, so this module keeps that crate and that pop/peek/push-back
//! idiom rather than introducing a different ordered-set type.

use ahash::RandomState;
use core::cmp::Ordering;
use priority_queue::PriorityQueue;

use crate::config::SchedConfig;
use crate::error::CoreError;
use crate::task::{Task, TaskId, TaskState, VTime};

/// A cached, ordering-relevant snapshot of one ready task, stored as the
/// priority-queue's value so `pick_next`'s tie-break rules don't need to
/// cross-reference the task table for every candidate it scans.
#[derive(Debug, Clone, Copy)]
pub struct ReadyKey {
    pub deadline: VTime,
    pub vruntime: VTime,
    pub tid: TaskId,
    pub is_input: bool,
    pub is_frame_critical: bool,
}

impl ReadyKey {
    fn order_tuple(&self) -> (VTime, VTime, TaskId) {
        (self.deadline, self.vruntime, self.tid)
    }
}

/// Ascending by `(deadline, vruntime, tid)`, then reversed: the underlying
/// `PriorityQueue` is a max-heap, but "smallest deadline first" (with
/// smallest-vruntime, then smallest-id tie-break, §4.1c) is what
/// `pick_next` wants at the top.
impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_tuple().cmp(&other.order_tuple()).reverse()
    }
}
impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for ReadyKey {
    fn eq(&self, other: &Self) -> bool {
        self.order_tuple() == other.order_tuple()
    }
}
impl Eq for ReadyKey {}

/// Gaming-class population counters kept alongside the ready set (§3
/// "Gaming counters").
#[derive(Debug, Clone, Copy, Default)]
pub struct GamingCounts {
    pub gaming: usize,
    pub frame_critical: usize,
    pub input: usize,
    pub audio: usize,
}

impl GamingCounts {
    fn adjust(&mut self, task: &Task, sign: i64) {
        let bump = |n: &mut usize, on: bool| {
            if on {
                *n = (*n as i64 + sign).max(0) as usize;
            }
        };
        bump(&mut self.gaming, task.tags.is_gaming());
        bump(&mut self.frame_critical, task.tags.is_frame_critical());
        bump(&mut self.input, task.tags.is_input());
        bump(&mut self.audio, task.tags.is_audio());
    }
}

/// One CPU's ordered set of ready tasks (§3 "Run-queue", §4.1).
pub struct RunQueue {
    ready: PriorityQueue<TaskId, ReadyKey, RandomState>,
    /// Monotonically non-decreasing floor (§3), except at explicit resets
    /// (new CPU coming online with an empty queue).
    pub min_vruntime: VTime,
    pub sum_weight: u64,
    pub nr_running: usize,
    pub gaming: GamingCounts,
    /// Cross-CPU wakes/migrations land here and are drained at the next
    /// tick rather than mutating the queue directly (§5).
    pub inbox: Vec<TaskId>,
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RunQueue {
    pub fn new() -> Self {
        RunQueue {
            ready: PriorityQueue::with_default_hasher(),
            min_vruntime: VTime(0),
            sum_weight: 0,
            nr_running: 0,
            gaming: GamingCounts::default(),
            inbox: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    pub fn contains(&self, tid: TaskId) -> bool {
        self.ready.get(&tid).is_some()
    }

    /// §4.1 `enqueue(task)`. Rejects non-`Ready` tasks (§4.1 "Failure
    /// semantics", §7 "enqueue of non-Ready task").
    pub fn enqueue(&mut self, task: &mut Task, cfg: &SchedConfig) -> Result<(), CoreError> {
        if task.state != TaskState::Ready {
            debug_assert!(false, "enqueue of non-Ready task {}", task.id);
            return Err(CoreError::NotReady);
        }

        let slice = effective_slice(task, self, cfg);
        // `min_vruntime - SLICE_MIN/2` (§4.1 enqueue), computed with
        // wrapping arithmetic so it stays correct across a vruntime
        // wraparound (§8 boundary test).
        let vruntime_floor = VTime(self.min_vruntime.0.wrapping_sub(cfg.slice_min_ns / 2));
        task.vruntime = task.vruntime.max(vruntime_floor);

        let penalty = crate::burst::enqueue_penalty(&task.burst, task.tags, cfg);
        task.vruntime += penalty;
        task.deadline = task.vruntime + slice;

        let key = ReadyKey {
            deadline: task.deadline,
            vruntime: task.vruntime,
            tid: task.id,
            is_input: task.tags.is_input(),
            is_frame_critical: task.tags.is_frame_critical(),
        };
        self.ready.push(task.id, key);
        self.nr_running += 1;
        self.sum_weight += task.weight_effective(cfg) as u64;
        self.gaming.adjust(task, 1);
        self.update_min_vruntime();
        Ok(())
    }

    /// §4.1 `dequeue(task)`: remove by identity, adjust `min_vruntime`.
    pub fn dequeue(&mut self, task: &Task, cfg: &SchedConfig) -> Result<(), CoreError> {
        if self.ready.remove(&task.id).is_none() {
            return Err(CoreError::NotEnqueued);
        }
        self.nr_running -= 1;
        self.sum_weight = self
            .sum_weight
            .saturating_sub(task.weight_effective(cfg) as u64);
        self.gaming.adjust(task, -1);
        self.update_min_vruntime();
        Ok(())
    }

    /// Re-publishes a task's cached ordering key after its vruntime or
    /// deadline changed in place (e.g. a `charge()` on the currently
    /// running task, which re-enters via `enqueue` rather than this path
    /// — this is for tag changes while queued).
    pub fn refresh_key(&mut self, task: &Task) {
        if self.ready.get(&task.id).is_some() {
            let key = ReadyKey {
                deadline: task.deadline,
                vruntime: task.vruntime,
                tid: task.id,
                is_input: task.tags.is_input(),
                is_frame_critical: task.tags.is_frame_critical(),
            };
            self.ready.change_priority(&task.id, key);
        }
    }

    fn update_min_vruntime(&mut self) {
        if let Some((_, top)) = self.ready.peek() {
            // `peek()` on this reversed ordering returns the
            // smallest-deadline entry, not the smallest-vruntime one, so
            // scan the (small) ready set for the true minimum vruntime.
            let min = self
                .ready
                .iter()
                .map(|(_, k)| k.vruntime)
                .min()
                .unwrap_or(top.vruntime);
            // Never gain time by being placed backwards (§3 "monotonically
            // non-decreasing floor").
            self.min_vruntime = self.min_vruntime.max(min);
        }
    }

    /// §4.1 `pick_next()`. Non-mutating: returns the winning candidate's
    /// cached key without removing it from the ready set. `frame_urgent`
    /// is supplied by the caller (§4.1 tie-break b: "a frame-deadline is
    /// within 25% of frame time"), computed from the frame-deadline hook,
    /// which this module has no visibility into.
    ///
    /// Implementation note: the ready set supports O(log n) insert/remove/
    /// min-lookup via `PriorityQueue`, but the tie-break rules here (any
    /// eligible input task wins regardless of its deadline rank, etc.)
    /// require scanning the eligible subset, so this is O(n) in the
    /// current ready-task count — acceptable at the handful-of-tasks-per-
    /// CPU scale this core targets (see DESIGN.md).
    pub fn pick_next(&self, frame_urgent: bool) -> Option<ReadyKey> {
        if self.ready.is_empty() {
            return None;
        }
        let eligible = |k: &ReadyKey| k.vruntime <= self.min_vruntime;

        let mut best_any: Option<ReadyKey> = None;
        let mut best_input: Option<ReadyKey> = None;
        let mut best_frame: Option<ReadyKey> = None;

        for (_, key) in self.ready.iter() {
            if !eligible(key) {
                continue;
            }
            if best_any.map_or(true, |b| key.order_tuple() < b.order_tuple()) {
                best_any = Some(*key);
            }
            if key.is_input && best_input.map_or(true, |b| key.order_tuple() < b.order_tuple()) {
                best_input = Some(*key);
            }
            if key.is_frame_critical
                && best_frame.map_or(true, |b| key.order_tuple() < b.order_tuple())
            {
                best_frame = Some(*key);
            }
        }

        if let Some(k) = best_input {
            return Some(k);
        }
        if frame_urgent {
            if let Some(k) = best_frame {
                return Some(k);
            }
        }
        if best_any.is_some() {
            return best_any;
        }
        // No eligible task (shouldn't happen given min_vruntime is a
        // floor over the ready set, but degrade gracefully rather than
        // return nothing when the queue is non-empty): fall back to the
        // smallest-deadline task overall.
        self.ready
            .iter()
            .map(|(_, k)| *k)
            .min_by_key(|k| k.order_tuple())
    }

    /// §4.1 `charge(current, Δt)`. Operates directly on the task (it is
    /// not in the ready set while running, invariant c) rather than
    /// through the priority queue.
    pub fn charge(task: &mut Task, delta_ns: u64, cfg: &SchedConfig) {
        let weight_eff = task.weight_effective(cfg).max(1) as u64;
        task.vruntime += delta_ns * 1024 / weight_eff;
        task.sum_exec_ns += delta_ns;
        crate::burst::update_burst_score(&mut task.burst, delta_ns, cfg);
    }

    /// §4.1 `should_preempt()`.
    pub fn should_preempt(&self, current: &Task, frame_urgent: bool, cfg: &SchedConfig) -> bool {
        let Some(next) = self.pick_next(frame_urgent) else {
            return false;
        };
        if next.tid == current.id {
            return false;
        }
        let next_eligible = next.vruntime <= self.min_vruntime;
        let deadline_preempt = next_eligible && next.deadline < current.deadline;

        let next_lag = next.vruntime - self.min_vruntime;
        let burst_preempt =
            current.burst.score > 25 && next_lag < -(cfg.slice_min_ns as i64);

        deadline_preempt || burst_preempt
    }
}

/// §4.1 "Effective slice". `rq` supplies the weight-scaling context the
/// task is about to run in (none of its fields are mutated here).
pub fn effective_slice(task: &Task, _rq: &RunQueue, cfg: &SchedConfig) -> u64 {
    let weight_eff = task.weight_effective(cfg).max(1) as u64;
    let base = (6 * cfg.slice_min_ns) * 1024 / weight_eff;
    let base = base.clamp(cfg.slice_min_ns, cfg.slice_max_ns);

    let mut slice = base as f64;
    if task.tags.is_gaming() {
        slice *= 0.75;
    }
    if task.tags.is_frame_critical() {
        slice *= 0.5;
    }
    if task.tags.is_input() {
        slice *= 0.67;
    }
    (slice.round() as u64).max(1)
}
