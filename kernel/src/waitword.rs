//! Wait-word primitive (§4.5): hash-bucketed wait queues keyed by a
//! user-address, with adaptive spin, typed waiters, and priority-ordered
//! wake.
//!
//! The memory word itself lives in user address space, outside this
//! crate's reach, so reading/identifying it is modeled as a
//! [`WordSource`] collaborator trait rather than a raw pointer
//! dereference — consistent with §1's "only their interfaces matter" for
//! out-of-scope collaborators.
//!
//! §9's "Coroutine-style suspension" note applies directly here: `wait`
//! never itself blocks a host thread. It resolves the fast path (value
//! mismatch, spin-hit) synchronously and otherwise registers a waiter and
//! returns a [`WaitHandle`] the caller uses to learn the eventual result
//! once its own thread-suspension mechanism resumes — the wait-word
//! primitive does not introduce a green-thread scheduler layer of its
//! own, per §9.

use bitflags::bitflags;
use std::sync::Arc;

use crate::config::SchedConfig;
use crate::depgraph::{DependencyGraph, DependencyKind, TaskLookup};
use crate::error::{CoreError, WaitStatus};
use crate::stats::Stats;
use crate::task::TaskId;

/// Number of hash buckets. Fixed, power-of-two, never resized (§9
/// "Arenas and indices").
pub const BUCKET_COUNT: usize = 1024;

bitflags! {
    /// §6 "Flags" on the wait surface.
    pub struct WaitFlags: u32 {
        const SPIN             = 0b0000_0001;
        const PRIORITY_INHERIT = 0b0000_0010;
        const GAMING           = 0b0000_0100;
        const FRAME_CRITICAL   = 0b0000_1000;
        const AUDIO_CRITICAL   = 0b0001_0000;
        const INPUT_CRITICAL   = 0b0010_0000;
        const NO_TIMEOUT       = 0b0100_0000;
    }
}

/// §3 "Wait-word bucket" waiter `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterType {
    Normal,
    Frame,
    Audio,
    Input,
    GpuSync,
}

impl WaiterType {
    fn from_flags(flags: WaitFlags) -> Result<Self, CoreError> {
        let exclusive = [
            WaitFlags::FRAME_CRITICAL,
            WaitFlags::AUDIO_CRITICAL,
            WaitFlags::INPUT_CRITICAL,
        ];
        let set_count = exclusive.iter().filter(|f| flags.contains(**f)).count();
        if set_count > 1 {
            return Err(CoreError::InvalidFlags);
        }
        Ok(if flags.contains(WaitFlags::INPUT_CRITICAL) {
            WaiterType::Input
        } else if flags.contains(WaitFlags::FRAME_CRITICAL) {
            WaiterType::Frame
        } else if flags.contains(WaitFlags::AUDIO_CRITICAL) {
            WaiterType::Audio
        } else {
            WaiterType::Normal
        })
    }

    fn index(self) -> usize {
        match self {
            WaiterType::Normal => 0,
            WaiterType::Frame => 1,
            WaiterType::Audio => 2,
            WaiterType::Input => 3,
            WaiterType::GpuSync => 4,
        }
    }
}

/// What the caller of `wait` does with a user-space word: read it, and
/// (best-effort) identify whoever currently holds it, for priority-boost
/// purposes (§4.5 "Priority boost on wait").
pub trait WordSource: Send + Sync {
    fn load(&self, addr: u64) -> u32;
    fn holder_of(&self, addr: u64) -> Option<TaskId> {
        None
    }
}

type ResultCell = Arc<spin::Mutex<Option<WaitStatus>>>;

/// Returned to the caller of [`WaitWordTable::wait`] when it had to block.
/// The caller suspends its own thread/context and, once resumed (by
/// [`WaitWordTable::wake`] on another CPU, a fired timer, or external
/// cancellation), reads [`WaitHandle::poll`] to learn why.
#[derive(Clone)]
pub struct WaitHandle {
    addr: u64,
    task: TaskId,
    result: ResultCell,
}

impl WaitHandle {
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Non-blocking check of whether this wait has resolved yet.
    pub fn poll(&self) -> Option<WaitStatus> {
        *self.result.lock()
    }
}

/// Outcome of calling `wait`: either it resolved immediately (value
/// mismatch or a spin hit), or the caller must now suspend and wait on
/// the returned handle.
pub enum WaitOutcome {
    Immediate(WaitStatus),
    Blocked(WaitHandle),
}

struct Waiter {
    task: TaskId,
    addr: u64,
    waiter_type: WaiterType,
    effective_priority: i32,
    enqueue_ns: u64,
    edge_id: Option<usize>,
    result: ResultCell,
}

fn bucket_index(addr: u64) -> usize {
    const GOLDEN: u64 = 0x9E37_79B9_7F4A_7C15;
    ((addr ^ (addr >> 33)).wrapping_mul(GOLDEN) >> 54) as usize & (BUCKET_COUNT - 1)
}

/// Exactly one process-wide instance (§9 "Global state").
pub struct WaitWordTable {
    buckets: Vec<crate::sync::LocalLock<Vec<Waiter>>>,
    /// Dynamic adaptive-spin multiplier per waiter type, clamped to
    /// `[0.5, 2.0]` (§4.5). Tracked per waiter-type rather than per-lock,
    /// since individual wait-word addresses are not long-lived identities
    /// worth tuning per-address.
    spin_multiplier: [crate::sync::LocalLock<f64>; 5],
}

impl Default for WaitWordTable {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitWordTable {
    pub fn new() -> Self {
        WaitWordTable {
            buckets: (0..BUCKET_COUNT)
                .map(|_| crate::sync::LocalLock::new(Vec::new()))
                .collect(),
            spin_multiplier: [
                crate::sync::LocalLock::new(1.0),
                crate::sync::LocalLock::new(1.0),
                crate::sync::LocalLock::new(1.0),
                crate::sync::LocalLock::new(1.0),
                crate::sync::LocalLock::new(1.0),
            ],
        }
    }

    /// §4.5 `wait(addr, expected, timeout?, flags)`.
    #[allow(clippy::too_many_arguments)]
    pub fn wait<T: TaskLookup>(
        &self,
        tasks: &mut T,
        graph: &mut DependencyGraph,
        words: &dyn WordSource,
        task_id: TaskId,
        addr: u64,
        expected: u32,
        flags: WaitFlags,
        now_ns: u64,
        cfg: &SchedConfig,
        stats: &Stats,
    ) -> Result<WaitOutcome, CoreError> {
        let waiter_type = WaiterType::from_flags(flags)?;

        if words.load(addr) != expected {
            return Ok(WaitOutcome::Immediate(WaitStatus::Again));
        }

        if flags.contains(WaitFlags::SPIN) {
            if let Some(status) = self.spin(words, addr, expected, waiter_type, cfg, stats) {
                return Ok(WaitOutcome::Immediate(status));
            }
        }

        let mut edge_id = None;
        if flags.contains(WaitFlags::PRIORITY_INHERIT) {
            if let Some(holder) = words.holder_of(addr) {
                match graph.add_edge(tasks, task_id, holder, DependencyKind::Lock, 1.0, now_ns) {
                    Ok(id) => edge_id = Some(id),
                    Err(CoreError::WouldCreateCycle) => {
                        log::warn!(
                            "wait_word: priority-inherit edge {task_id} -> {holder} would cycle, skipping boost"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let effective_priority = tasks
            .task(task_id)
            .map(crate::task::Task::effective_priority)
            .ok_or(CoreError::UnknownTask)?;

        if edge_id.is_some() {
            // §4.5 "Priority boost on wait": every edge added here is, by
            // construction, a waiter blocked behind a lower-priority
            // holder — exactly the condition the core's "priority
            // inversions detected" counter (§6) tracks.
            stats.record_priority_inversion();
        }

        let result: ResultCell = Arc::new(spin::Mutex::new(None));
        let waiter = Waiter {
            task: task_id,
            addr,
            waiter_type,
            effective_priority,
            enqueue_ns: now_ns,
            edge_id,
            result: result.clone(),
        };
        self.buckets[bucket_index(addr)].lock().push(waiter);

        if let Some(t) = tasks.task_mut(task_id) {
            t.state = crate::task::TaskState::Blocked;
        }

        Ok(WaitOutcome::Blocked(WaitHandle {
            addr,
            task: task_id,
            result,
        }))
    }

    /// §4.5 "Adaptive spin". Returns `Some(Woken)` on a spin hit, `None`
    /// if the spin budget was exhausted without the value changing.
    fn spin(
        &self,
        words: &dyn WordSource,
        addr: u64,
        expected: u32,
        waiter_type: WaiterType,
        cfg: &SchedConfig,
        stats: &Stats,
    ) -> Option<WaitStatus> {
        let base_cycles = match waiter_type {
            WaiterType::Frame | WaiterType::GpuSync => cfg.spin_base_cycles_frame_critical,
            WaiterType::Input | WaiterType::Audio => cfg.spin_base_cycles_gaming,
            WaiterType::Normal => cfg.spin_base_cycles,
        };

        let mut multiplier = self.spin_multiplier[waiter_type.index()].lock();
        let iterations = (base_cycles as f64 * *multiplier) as u64;

        for _ in 0..iterations {
            core::hint::spin_loop();
            if words.load(addr) != expected {
                *multiplier = (*multiplier * cfg.spin_multiplier_success_factor)
                    .clamp(cfg.spin_multiplier_min, cfg.spin_multiplier_max);
                stats.spin_hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Some(WaitStatus::Woken);
            }
        }

        *multiplier = (*multiplier * cfg.spin_multiplier_miss_factor)
            .clamp(cfg.spin_multiplier_min, cfg.spin_multiplier_max);
        stats.spin_misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        None
    }

    /// §4.5 `wake(addr, max_n)`: removes up to `max_n` waiters for `addr`,
    /// in priority order, and sets each to `Ready`.
    pub fn wake<T: TaskLookup>(
        &self,
        tasks: &mut T,
        graph: &mut DependencyGraph,
        addr: u64,
        max_n: usize,
        now_ns: u64,
        stats: &Stats,
    ) -> usize {
        let mut bucket = self.buckets[bucket_index(addr)].lock();
        self.wake_locked(&mut bucket, tasks, graph, addr, max_n, now_ns, stats)
    }

    fn wake_locked<T: TaskLookup>(
        &self,
        bucket: &mut Vec<Waiter>,
        tasks: &mut T,
        graph: &mut DependencyGraph,
        addr: u64,
        max_n: usize,
        now_ns: u64,
        stats: &Stats,
    ) -> usize {
        // Priority order: most urgent effective priority first, then
        // earliest enqueue time (§4.5 "Typed wake ordering"). Waiters for
        // other addresses that landed in the same bucket via a hash
        // collision are skipped (§4.5 "Failure semantics").
        let mut indices: Vec<usize> = bucket
            .iter()
            .enumerate()
            .filter(|(_, w)| w.addr == addr)
            .map(|(i, _)| i)
            .collect();
        indices.sort_by_key(|&i| (bucket[i].effective_priority, bucket[i].enqueue_ns));
        indices.truncate(max_n);

        let mut woken = 0;
        for &i in indices.iter().rev() {
            let waiter = bucket.remove(i);
            if let Some(edge_id) = waiter.edge_id {
                graph.remove_edge_by_id(tasks, edge_id);
            }
            *waiter.result.lock() = Some(WaitStatus::Woken);
            if let Some(t) = tasks.task_mut(waiter.task) {
                t.state = crate::task::TaskState::Ready;
            }
            stats.record_wait_latency_ns(now_ns.saturating_sub(waiter.enqueue_ns));
            woken += 1;
        }
        woken
    }

    /// §4.5 `requeue(addr1, max_wake, max_requeue, addr2)`.
    #[allow(clippy::too_many_arguments)]
    pub fn requeue<T: TaskLookup>(
        &self,
        tasks: &mut T,
        graph: &mut DependencyGraph,
        addr1: u64,
        max_wake: usize,
        max_requeue: usize,
        addr2: u64,
        now_ns: u64,
        stats: &Stats,
    ) -> usize {
        let idx1 = bucket_index(addr1);
        let idx2 = bucket_index(addr2);

        let woken = if idx1 == idx2 {
            let mut bucket = self.buckets[idx1].lock();
            self.wake_locked(&mut bucket, tasks, graph, addr1, max_wake, now_ns, stats)
        } else {
            let mut bucket1 = self.buckets[idx1].lock();
            self.wake_locked(&mut bucket1, tasks, graph, addr1, max_wake, now_ns, stats)
        };

        if idx1 == idx2 {
            return woken;
        }

        let mut bucket1 = self.buckets[idx1].lock();
        let mut to_move: Vec<usize> = bucket1
            .iter()
            .enumerate()
            .filter(|(_, w)| w.addr == addr1)
            .map(|(i, _)| i)
            .collect();
        to_move.sort_by_key(|&i| (bucket1[i].effective_priority, bucket1[i].enqueue_ns));
        to_move.truncate(max_requeue);

        let mut moved = Vec::with_capacity(to_move.len());
        for &i in to_move.iter().rev() {
            let mut waiter = bucket1.remove(i);
            waiter.addr = addr2;
            moved.push(waiter);
        }
        drop(bucket1);

        let mut bucket2 = self.buckets[idx2].lock();
        bucket2.extend(moved);

        woken
    }

    /// §5 "Timeouts are armed before blocking and disarmed atomically
    /// with dequeue; if both fire, exactly one path wins and the other
    /// is a no-op."
    pub fn expire_timeout<T: TaskLookup>(
        &self,
        tasks: &mut T,
        graph: &mut DependencyGraph,
        handle: &WaitHandle,
        now_ns: u64,
        stats: &Stats,
    ) -> WaitStatus {
        self.resolve_externally(tasks, graph, handle, WaitStatus::TimedOut, now_ns, stats)
    }

    /// §5 "External cancellation delivers EINTR and unwinds all held
    /// dependency edges added for the wait."
    pub fn cancel<T: TaskLookup>(
        &self,
        tasks: &mut T,
        graph: &mut DependencyGraph,
        handle: &WaitHandle,
        now_ns: u64,
        stats: &Stats,
    ) -> WaitStatus {
        self.resolve_externally(tasks, graph, handle, WaitStatus::Interrupted, now_ns, stats)
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_externally<T: TaskLookup>(
        &self,
        tasks: &mut T,
        graph: &mut DependencyGraph,
        handle: &WaitHandle,
        desired: WaitStatus,
        now_ns: u64,
        stats: &Stats,
    ) -> WaitStatus {
        let mut guard = handle.result.lock();
        if let Some(existing) = *guard {
            // A wake already resolved this waiter; the race is decided,
            // this path is a no-op.
            return existing;
        }

        let mut bucket = self.buckets[bucket_index(handle.addr)].lock();
        if let Some(pos) = bucket
            .iter()
            .position(|w| w.task == handle.task && w.addr == handle.addr)
        {
            let waiter = bucket.remove(pos);
            if let Some(edge_id) = waiter.edge_id {
                graph.remove_edge_by_id(tasks, edge_id);
            }
            stats.record_wait_latency_ns(now_ns.saturating_sub(waiter.enqueue_ns));
        }
        if let Some(t) = tasks.task_mut(handle.task) {
            t.state = crate::task::TaskState::Ready;
        }
        *guard = Some(desired);
        desired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depgraph::TaskTable;
    use crate::task::Task;
    use std::sync::atomic::AtomicU32;

    struct FakeWord(AtomicU32);
    impl WordSource for FakeWord {
        fn load(&self, _addr: u64) -> u32 {
            self.0.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    fn table_with(nices: &[(TaskId, i32)]) -> TaskTable {
        let mut t = TaskTable::default();
        for &(id, nice) in nices {
            let mut task = Task::new(id, nice);
            task.state = crate::task::TaskState::Blocked;
            t.0.insert(id, task);
        }
        t
    }

    #[test]
    fn eagain_on_mismatch_has_no_side_effects() {
        let ww = WaitWordTable::new();
        let mut tasks = table_with(&[(0, 0)]);
        let mut graph = DependencyGraph::new();
        let cfg = SchedConfig::default();
        let stats = Stats::default();
        let word = FakeWord(AtomicU32::new(42));

        let outcome = ww
            .wait(
                &mut tasks,
                &mut graph,
                &word,
                0,
                0x1000,
                7,
                WaitFlags::empty(),
                0,
                &cfg,
                &stats,
            )
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::Immediate(WaitStatus::Again)));
        assert_eq!(tasks.0[&0].state, crate::task::TaskState::Blocked);
    }

    #[test]
    fn wake_resolves_blocked_waiter() {
        let ww = WaitWordTable::new();
        let mut tasks = table_with(&[(0, 0)]);
        let mut graph = DependencyGraph::new();
        let cfg = SchedConfig::default();
        let stats = Stats::default();
        let word = FakeWord(AtomicU32::new(1));

        let outcome = ww
            .wait(
                &mut tasks,
                &mut graph,
                &word,
                0,
                0x2000,
                1,
                WaitFlags::empty(),
                0,
                &cfg,
                &stats,
            )
            .unwrap();
        let handle = match outcome {
            WaitOutcome::Blocked(h) => h,
            _ => panic!("expected block"),
        };
        assert_eq!(tasks.0[&0].state, crate::task::TaskState::Blocked);

        let count = ww.wake(&mut tasks, &mut graph, 0x2000, 1, 0, &stats);
        assert_eq!(count, 1);
        assert_eq!(handle.poll(), Some(WaitStatus::Woken));
        assert_eq!(tasks.0[&0].state, crate::task::TaskState::Ready);
    }

    #[test]
    fn timeout_is_noop_once_already_woken() {
        let ww = WaitWordTable::new();
        let mut tasks = table_with(&[(0, 0)]);
        let mut graph = DependencyGraph::new();
        let cfg = SchedConfig::default();
        let stats = Stats::default();
        let word = FakeWord(AtomicU32::new(1));

        let outcome = ww
            .wait(
                &mut tasks, &mut graph, &word, 0, 0x3000, 1, WaitFlags::empty(), 0, &cfg, &stats,
            )
            .unwrap();
        let handle = match outcome {
            WaitOutcome::Blocked(h) => h,
            _ => panic!("expected block"),
        };
        ww.wake(&mut tasks, &mut graph, 0x3000, 1, 0, &stats);
        let status = ww.expire_timeout(&mut tasks, &mut graph, &handle, 0, &stats);
        assert_eq!(status, WaitStatus::Woken, "wake already won the race");
    }

    #[test]
    fn invalid_flag_combination_rejected() {
        let ww = WaitWordTable::new();
        let mut tasks = table_with(&[(0, 0)]);
        let mut graph = DependencyGraph::new();
        let cfg = SchedConfig::default();
        let stats = Stats::default();
        let word = FakeWord(AtomicU32::new(1));

        let err = ww.wait(
            &mut tasks,
            &mut graph,
            &word,
            0,
            0x4000,
            1,
            WaitFlags::FRAME_CRITICAL | WaitFlags::INPUT_CRITICAL,
            0,
            &cfg,
            &stats,
        );
        assert_eq!(err.err(), Some(CoreError::InvalidFlags));
    }

    /// A word that flips away from `expected` after a handful of spin
    /// iterations, simulating a concurrent producer's store landing while
    /// the consumer is still spinning (§4.5 "adaptive spin").
    struct FlipsAfter {
        calls: std::sync::atomic::AtomicU32,
        flip_at: u32,
        before: u32,
        after: u32,
    }
    impl WordSource for FlipsAfter {
        fn load(&self, _addr: u64) -> u32 {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n < self.flip_at {
                self.before
            } else {
                self.after
            }
        }
    }

    #[test]
    fn spin_hit_resolves_without_blocking_and_grows_the_multiplier() {
        let ww = WaitWordTable::new();
        let mut tasks = table_with(&[(0, 0)]);
        let mut graph = DependencyGraph::new();
        let cfg = SchedConfig::default();
        let stats = Stats::default();
        let word = FlipsAfter {
            calls: std::sync::atomic::AtomicU32::new(0),
            flip_at: 5,
            before: 1,
            after: 2,
        };

        let outcome = ww
            .wait(&mut tasks, &mut graph, &word, 0, 0x6000, 1, WaitFlags::SPIN, 0, &cfg, &stats)
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::Immediate(WaitStatus::Woken)));
        assert_eq!(stats.snapshot().spin_hits, 1);
        assert_eq!(stats.snapshot().spin_misses, 0);

        // A spin hit resolves immediately rather than registering a waiter,
        // so a later wake on the same address finds nobody to wake.
        let woken = ww.wake(&mut tasks, &mut graph, 0x6000, 1, 0, &stats);
        assert_eq!(woken, 0, "spin hit must never enqueue a waiter");
    }

    #[test]
    fn spin_miss_falls_through_to_a_real_block() {
        let ww = WaitWordTable::new();
        let mut tasks = table_with(&[(0, 0)]);
        let mut graph = DependencyGraph::new();
        let cfg = SchedConfig::default();
        let stats = Stats::default();
        let word = FakeWord(AtomicU32::new(1));

        let outcome = ww
            .wait(&mut tasks, &mut graph, &word, 0, 0x7000, 1, WaitFlags::SPIN, 0, &cfg, &stats)
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::Blocked(_)));
        assert_eq!(stats.snapshot().spin_misses, 1);
        assert_eq!(stats.snapshot().spin_hits, 0);
        assert_eq!(tasks.0[&0].state, crate::task::TaskState::Blocked);
    }

    #[test]
    fn wake_ordering_prefers_most_urgent_effective_priority() {
        let ww = WaitWordTable::new();
        let mut tasks = table_with(&[(0, 10), (1, -10)]);
        let mut graph = DependencyGraph::new();
        let cfg = SchedConfig::default();
        let stats = Stats::default();
        let word = FakeWord(AtomicU32::new(1));

        ww.wait(&mut tasks, &mut graph, &word, 0, 0x5000, 1, WaitFlags::empty(), 0, &cfg, &stats)
            .unwrap();
        ww.wait(&mut tasks, &mut graph, &word, 1, 0x5000, 1, WaitFlags::empty(), 1, &cfg, &stats)
            .unwrap();

        ww.wake(&mut tasks, &mut graph, 0x5000, 1, 0, &stats);
        assert_eq!(tasks.0[&1].state, crate::task::TaskState::Ready, "nice -10 wakes first");
        assert_eq!(tasks.0[&0].state, crate::task::TaskState::Blocked);
    }
}
