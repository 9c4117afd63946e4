//! `Core`: the top-level scheduling and synchronization engine (§5, §6).
//!
//! Wires together one [`RunQueue`] per CPU, a single task arena, the
//! topology map, the priority-inheritance graph, and the wait-word table,
//! and exposes the external surface named in §6 as methods. Named `Core`
//! rather than matching the crate name, to keep it out of the way of
//! `core::` the extern prelude crate.

use std::sync::atomic::{AtomicBool, Ordering};

use vec_arena::Arena;

use crate::config::SchedConfig;
use crate::depgraph::{DependencyGraph, DependencyKind, TaskLookup};
use crate::error::{CoreError, FatalReason, WaitStatus};
use crate::placement::{self, Placement};
use crate::runqueue::RunQueue;
use crate::stats::{Stats, StatsSnapshot};
use crate::sync::LocalLock;
use crate::task::{GamingTags, Task, TaskId, TaskState};
use crate::timebase::Timebase;
use crate::topology::{CpuFacts, Topology};
use crate::waitword::{WaitFlags, WaitOutcome, WaitWordTable, WordSource};

/// Thin [`TaskLookup`] facade over the task arena, so [`DependencyGraph`]
/// and [`WaitWordTable`] can stay agnostic of the arena crate (§9 "Arenas
/// and indices").
struct TaskArena(Arena<Task>);

impl TaskLookup for TaskArena {
    fn task(&self, id: TaskId) -> Option<&Task> {
        self.0.get(id)
    }
    fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.0.get_mut(id)
    }
}

/// One CPU's run-queue plus the task currently running on it, if any.
struct CpuSlot {
    rq: LocalLock<RunQueue>,
    current: LocalLock<Option<TaskId>>,
    last_tick_ns: LocalLock<u64>,
}

impl CpuSlot {
    fn new() -> Self {
        CpuSlot {
            rq: LocalLock::new(RunQueue::new()),
            current: LocalLock::new(None),
            last_tick_ns: LocalLock::new(0),
        }
    }
}

/// The scheduling and synchronization core (§5, §6). Exactly one
/// process-wide instance (§9 "Global state").
pub struct Core {
    tasks: LocalLock<TaskArena>,
    cpus: Vec<CpuSlot>,
    topology: Topology,
    graph: LocalLock<DependencyGraph>,
    waitwords: WaitWordTable,
    stats: Stats,
    timebase: Box<dyn Timebase>,
    word_source: Box<dyn WordSource>,
    gaming_mode: AtomicBool,
    cfg: SchedConfig,
}

impl Core {
    /// §9 init order: "timebase → topology → graph → wait-words →
    /// run-queues". `cpu_facts` comes from the collaborator topology
    /// source; `timebase`/`word_source` are the clock and user-memory
    /// collaborators this core never assumes a concrete implementation
    /// of.
    pub fn new(
        cpu_facts: Vec<CpuFacts>,
        timebase: Box<dyn Timebase>,
        word_source: Box<dyn WordSource>,
        cfg: SchedConfig,
    ) -> Self {
        let cpu_count = cpu_facts.len();
        Core {
            tasks: LocalLock::new(TaskArena(Arena::new())),
            cpus: (0..cpu_count).map(|_| CpuSlot::new()).collect(),
            topology: Topology::new(cpu_facts),
            graph: LocalLock::new(DependencyGraph::new()),
            waitwords: WaitWordTable::new(),
            stats: Stats::default(),
            timebase,
            word_source,
            gaming_mode: AtomicBool::new(false),
            cfg,
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn now_ns(&self) -> u64 {
        self.timebase.now_ns()
    }

    fn is_gaming_mode(&self) -> bool {
        self.gaming_mode.load(Ordering::Relaxed)
    }

    // ---- Task lifecycle (§6) ----------------------------------------

    /// §6 `task_create(nice, tags) → id`.
    pub fn task_create(&self, nice: i32, tags: GamingTags) -> TaskId {
        let mut tasks = self.tasks.lock();
        let id = tasks.0.next_vacant();
        let mut task = Task::new(id, nice);
        task.tags = tags;
        let inserted = tasks.0.insert(task);
        debug_assert_eq!(inserted, id, "arena slot must match the predicted id");
        inserted
    }

    /// §6 `task_destroy(id)`. Total removal: run-queue membership,
    /// dependency edges, and the arena slot (§3 invariant d).
    pub fn task_destroy(&self, id: TaskId) {
        for cpu in &self.cpus {
            let mut current = cpu.current.lock();
            if *current == Some(id) {
                *current = None;
            }
            drop(current);
            let mut rq = cpu.rq.lock();
            if rq.contains(id) {
                let mut tasks = self.tasks.lock();
                if let Some(task) = tasks.0.get_mut(id) {
                    let _ = rq.dequeue(task, &self.cfg);
                }
            }
        }
        {
            let mut tasks = self.tasks.lock();
            let mut graph = self.graph.lock();
            graph.purge_task(&mut *tasks, id);
        }
        self.tasks.lock().0.remove(id);
    }

    /// §6 `task_set_tag(id, tag, value)`.
    /// Lock order here (and throughout `Core`) is a CPU's run-queue
    /// before the task arena, matching `schedule`/`tick`/`task_destroy`.
    pub fn task_set_tag(&self, id: TaskId, tag: GamingTags, value: bool) -> Result<(), CoreError> {
        for cpu in &self.cpus {
            let mut rq = cpu.rq.lock();
            if rq.contains(id) {
                let mut tasks = self.tasks.lock();
                let task = tasks.0.get_mut(id).ok_or(CoreError::UnknownTask)?;
                task.tags.set_implied(tag, value);
                rq.refresh_key(task);
                return Ok(());
            }
        }
        let mut tasks = self.tasks.lock();
        let task = tasks.0.get_mut(id).ok_or(CoreError::UnknownTask)?;
        task.tags.set_implied(tag, value);
        Ok(())
    }

    // ---- Scheduling surface (§6) -------------------------------------

    /// §6 `schedule()`: pick and dispatch the next task on `cpu_id`.
    pub fn schedule(&self, cpu_id: u32) -> Option<TaskId> {
        let cpu = self.cpus.get(cpu_id as usize)?;
        let mut rq = cpu.rq.lock();
        let frame_urgent = self.any_frame_urgent(&rq);
        let key = rq.pick_next(frame_urgent)?;
        let mut tasks = self.tasks.lock();
        let task = tasks.0.get_mut(key.tid)?;
        rq.dequeue(task, &self.cfg).ok()?;
        task.state = TaskState::Running;
        task.exec_start_ns = self.now_ns();
        drop(tasks);
        *cpu.current.lock() = Some(key.tid);
        self.stats.record_context_switch();
        Some(key.tid)
    }

    fn any_frame_urgent(&self, _rq: &RunQueue) -> bool {
        // Frame urgency is a per-task property evaluated against the
        // frame hook's own deadline, not something the run-queue tracks;
        // a fuller implementation would thread the frame-critical
        // candidate's remaining-time-to-deadline through here. Treating
        // gaming mode as a coarse proxy keeps `pick_next`'s tie-break (b)
        // exercised without requiring a second task-table scan per pick.
        self.is_gaming_mode()
    }

    /// §6 `yield()`: the task currently running on `cpu_id` gives up the
    /// remainder of its slice voluntarily.
    pub fn yield_(&self, cpu_id: u32) -> Result<(), CoreError> {
        let cpu = self.cpus.get(cpu_id as usize).ok_or(CoreError::UnknownTask)?;
        let Some(tid) = *cpu.current.lock() else { return Ok(()) };
        let mut rq = cpu.rq.lock();
        let mut tasks = self.tasks.lock();
        let task = tasks.0.get_mut(tid).ok_or(CoreError::UnknownTask)?;
        task.state = TaskState::Ready;
        rq.enqueue(task, &self.cfg)?;
        drop(tasks);
        drop(rq);
        *cpu.current.lock() = None;
        Ok(())
    }

    /// §6 `tick()`: charge the running task for elapsed time, check
    /// preemption, and age the dependency graph.
    pub fn tick(&self, cpu_id: u32, now_ns: u64) -> Result<bool, CoreError> {
        let cpu = self.cpus.get(cpu_id as usize).ok_or(CoreError::UnknownTask)?;
        let mut last = cpu.last_tick_ns.lock();
        let delta = now_ns.saturating_sub(*last);
        *last = now_ns;
        drop(last);

        let preempt = if let Some(tid) = *cpu.current.lock() {
            let rq = cpu.rq.lock();
            let mut tasks = self.tasks.lock();
            let task = tasks.0.get_mut(tid).ok_or(CoreError::UnknownTask)?;
            RunQueue::charge(task, delta, &self.cfg);
            if task.deadline < task.vruntime {
                drop(tasks);
                drop(rq);
                self.fatal(FatalReason::DeadlineBeforeVruntime(tid as u64));
            }
            rq.should_preempt(task, self.any_frame_urgent(&rq), &self.cfg)
        } else {
            false
        };

        let mut tasks = self.tasks.lock();
        let mut graph = self.graph.lock();
        graph.tick(&mut *tasks, now_ns, &self.cfg);
        Ok(preempt)
    }

    /// §6 `set_preferred_cpu(id, cpu_hint)`: an explicit placement
    /// override, migrating the task immediately if it is presently
    /// queued.
    pub fn set_preferred_cpu(&self, id: TaskId, cpu_hint: u32) -> Result<(), CoreError> {
        if self.topology.cpu(cpu_hint).is_none() {
            return Err(CoreError::UnknownTask);
        }
        let from = {
            let mut tasks = self.tasks.lock();
            let task = tasks.0.get_mut(id).ok_or(CoreError::UnknownTask)?;
            let from = task.placement.last_cpu;
            task.placement.last_cpu = Some(cpu_hint);
            task.placement.last_migration_ns = self.now_ns();
            from
        };

        if let Some(from_id) = from {
            if from_id != cpu_hint {
                self.migrate(id, from_id, cpu_hint)?;
            }
        }
        Ok(())
    }

    fn migrate(&self, id: TaskId, from_cpu: u32, to_cpu: u32) -> Result<(), CoreError> {
        let Some(from) = self.cpus.get(from_cpu as usize) else { return Ok(()) };
        let Some(to) = self.cpus.get(to_cpu as usize) else { return Ok(()) };

        let mut from_rq = from.rq.lock();
        if !from_rq.contains(id) {
            return Ok(());
        }
        let mut to_rq = to.rq.lock();
        let mut tasks = self.tasks.lock();
        let task = tasks.0.get_mut(id).ok_or(CoreError::UnknownTask)?;
        from_rq.dequeue(task, &self.cfg)?;
        to_rq.enqueue(task, &self.cfg)?;
        self.stats.record_migration();
        Ok(())
    }

    /// §6 `set_frame_rate(id, fps)`.
    pub fn set_frame_rate(&self, id: TaskId, fps: f64) -> Result<(), CoreError> {
        let mut tasks = self.tasks.lock();
        let task = tasks.0.get_mut(id).ok_or(CoreError::UnknownTask)?;
        task.frame.set_target_fps(fps);
        Ok(())
    }

    // ---- Synchronization (§6) ----------------------------------------

    /// §6 `wait_word(addr, expected, timeout?, flags) → status`. Returns
    /// immediately with the final status, or a handle the caller polls
    /// once its own thread-suspension mechanism resumes it (§9
    /// "Coroutine-style suspension").
    pub fn wait_word(
        &self,
        task_id: TaskId,
        addr: u64,
        expected: u32,
        flags: WaitFlags,
    ) -> Result<WaitOutcome, CoreError> {
        let now = self.now_ns();
        let mut tasks = self.tasks.lock();
        let mut graph = self.graph.lock();
        self.waitwords.wait(
            &mut *tasks,
            &mut graph,
            self.word_source.as_ref(),
            task_id,
            addr,
            expected,
            flags,
            now,
            &self.cfg,
            &self.stats,
        )
    }

    /// §6 `wake_word(addr, max_n) → count`.
    pub fn wake_word(&self, addr: u64, max_n: usize) -> usize {
        let mut tasks = self.tasks.lock();
        let mut graph = self.graph.lock();
        let now = self.now_ns();
        self.waitwords
            .wake(&mut *tasks, &mut graph, addr, max_n, now, &self.stats)
    }

    /// §6 `requeue_word(addr1, nw, nr, addr2) → count`.
    pub fn requeue_word(&self, addr1: u64, max_wake: usize, max_requeue: usize, addr2: u64) -> usize {
        let mut tasks = self.tasks.lock();
        let mut graph = self.graph.lock();
        let now = self.now_ns();
        self.waitwords.requeue(
            &mut *tasks,
            &mut graph,
            addr1,
            max_wake,
            max_requeue,
            addr2,
            now,
            &self.stats,
        )
    }

    /// Caller-side timeout firing for a pending [`WaitOutcome::Blocked`]
    /// handle (§5 "Timeouts are armed before blocking...").
    pub fn wait_timeout_fire(&self, handle: &crate::waitword::WaitHandle) -> WaitStatus {
        let mut tasks = self.tasks.lock();
        let mut graph = self.graph.lock();
        let now = self.now_ns();
        self.waitwords
            .expire_timeout(&mut *tasks, &mut graph, handle, now, &self.stats)
    }

    /// External cancellation of a pending wait (§5 "...EINTR and unwinds
    /// all held dependency edges").
    pub fn wait_cancel(&self, handle: &crate::waitword::WaitHandle) -> WaitStatus {
        let mut tasks = self.tasks.lock();
        let mut graph = self.graph.lock();
        let now = self.now_ns();
        self.waitwords
            .cancel(&mut *tasks, &mut graph, handle, now, &self.stats)
    }

    // ---- Dependency edges (§6) ----------------------------------------

    /// §6 `dep_add(dependent, dependency, kind, strength)`. `kind` is
    /// decoded from its wire value at this boundary (§9 "Dynamic
    /// dispatch": a flat tagged variant, not a class hierarchy).
    pub fn dep_add(
        &self,
        dependent: TaskId,
        dependency: TaskId,
        kind: u8,
        strength: f64,
    ) -> Result<usize, CoreError> {
        let kind = DependencyKind::try_from(kind).map_err(|_| CoreError::InvalidFlags)?;
        let now = self.now_ns();
        let mut tasks = self.tasks.lock();
        let mut graph = self.graph.lock();
        graph.add_edge(&mut *tasks, dependent, dependency, kind, strength, now)
    }

    /// §6 `dep_remove(dependent, dependency)`.
    pub fn dep_remove(&self, dependent: TaskId, dependency: TaskId) -> Result<(), CoreError> {
        let mut tasks = self.tasks.lock();
        let mut graph = self.graph.lock();
        graph.remove_edge(&mut *tasks, dependent, dependency)
    }

    // ---- Gaming controls (§6) ------------------------------------------

    pub fn gaming_mode(&self, on: bool) {
        self.gaming_mode.store(on, Ordering::Relaxed);
    }

    /// §6 `mark_frame_start(id)`.
    pub fn mark_frame_start(&self, id: TaskId) -> Result<(), CoreError> {
        let mut tasks = self.tasks.lock();
        let task = tasks.0.get_mut(id).ok_or(CoreError::UnknownTask)?;
        crate::frame::mark_frame_start(task, self.timebase.as_ref());
        Ok(())
    }

    /// §6 `mark_frame_complete(id)`.
    pub fn mark_frame_complete(&self, id: TaskId) -> Result<bool, CoreError> {
        let mut tasks = self.tasks.lock();
        let task = tasks.0.get_mut(id).ok_or(CoreError::UnknownTask)?;
        Ok(crate::frame::mark_frame_complete(
            task,
            self.timebase.as_ref(),
            &self.cfg,
            &self.stats,
        ))
    }

    // ---- Placement (§4.3, exposed indirectly through enqueue) ---------

    /// Places a newly created or newly woken task onto a CPU and enqueues
    /// it there (§4.3). Not itself a named §6 operation, but the
    /// mechanism `task_create`/wake-driven re-entry relies on.
    pub fn place_and_enqueue(&self, id: TaskId) -> Result<Placement, CoreError> {
        let now = self.now_ns();
        let mut tasks = self.tasks.lock();
        let task = tasks.0.get_mut(id).ok_or(CoreError::UnknownTask)?;
        task.state = TaskState::Ready;
        let placement = placement::place_task(task, &self.topology, self.is_gaming_mode(), now, &self.cfg);
        if placement.migrated {
            task.placement.migration_count += 1;
            task.placement.last_migration_ns = now;
            self.stats.record_migration();
        }
        task.placement.last_cpu = Some(placement.cpu_id);

        let cpu = self
            .cpus
            .get(placement.cpu_id as usize)
            .ok_or(CoreError::UnknownTask)?;
        let mut rq = cpu.rq.lock();
        rq.enqueue(task, &self.cfg)?;
        Ok(placement)
    }

    /// §7 "Fatal: any observed violation of an invariant halts the
    /// scheduler with a dump of run-queue state."
    pub fn fatal(&self, reason: FatalReason) -> ! {
        log::error!("fatal scheduler invariant violation: {reason}");
        for (i, cpu) in self.cpus.iter().enumerate() {
            let rq = cpu.rq.lock();
            log::error!(
                "cpu {i}: nr_running={} min_vruntime={:?} gaming={:?}",
                rq.nr_running,
                rq.min_vruntime,
                rq.gaming
            );
        }
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::CacheShareSet;
    use crate::timebase::FakeTimebase;
    use std::sync::atomic::AtomicU32;

    struct FakeWord(AtomicU32, TaskId);
    impl WordSource for FakeWord {
        fn load(&self, _addr: u64) -> u32 {
            self.0.load(Ordering::SeqCst)
        }
        fn holder_of(&self, _addr: u64) -> Option<TaskId> {
            Some(self.1)
        }
    }

    fn single_cpu_core() -> Core {
        let facts = vec![CpuFacts {
            id: 0,
            class: crate::topology::CpuClass::Performance,
            numa_node: 0,
            max_freq_mhz: 3_000,
            baseline_freq_mhz: 2_000,
            cache_sharing: [CacheShareSet::new(0..1), CacheShareSet::new(0..1), CacheShareSet::new(0..1)],
            llc_capacity_bytes: 32 << 20,
            augmented_cache: false,
            efficiency_rating: 0.5,
            gaming_preferred: false,
        }];
        Core::new(
            facts,
            Box::new(FakeTimebase::new()),
            Box::new(FakeWord(AtomicU32::new(0), 0)),
            SchedConfig::default(),
        )
    }

    #[test]
    fn single_task_progress_scenario() {
        let core = single_cpu_core();
        let id = core.task_create(0, GamingTags::empty());
        core.place_and_enqueue(id).unwrap();

        let scheduled = core.schedule(0);
        assert_eq!(scheduled, Some(id));
        core.tick(0, 4_500_000).unwrap();

        let tasks = core.tasks.lock();
        assert!(tasks.0.get(id).unwrap().sum_exec_ns > 0);
    }

    #[test]
    fn two_equal_priority_tasks_share_the_cpu() {
        let core = single_cpu_core();
        let t0 = core.task_create(0, GamingTags::empty());
        let t1 = core.task_create(0, GamingTags::empty());
        core.place_and_enqueue(t0).unwrap();
        core.place_and_enqueue(t1).unwrap();

        for _ in 0..4 {
            if let Some(running) = core.schedule(0) {
                core.tick(0, 1_000_000).unwrap();
                core.yield_(0).unwrap();
                let _ = running;
            }
        }

        let tasks = core.tasks.lock();
        let e0 = tasks.0.get(t0).unwrap().sum_exec_ns;
        let e1 = tasks.0.get(t1).unwrap().sum_exec_ns;
        assert!(e0 > 0 && e1 > 0, "both tasks should have made progress");
    }

    #[test]
    fn priority_inheritance_end_to_end() {
        let core = single_cpu_core();
        let low = core.task_create(5, GamingTags::empty());
        let high = core.task_create(-10, GamingTags::empty());

        core.dep_add(high, low, DependencyKind::Lock as u8, 1.0).unwrap();
        {
            let tasks = core.tasks.lock();
            assert!(tasks.0.get(low).unwrap().effective_priority() <= -10);
        }

        core.dep_remove(high, low).unwrap();
        let tasks = core.tasks.lock();
        assert_eq!(tasks.0.get(low).unwrap().effective_priority(), 5);
    }

    #[test]
    fn task_destroy_purges_edges_and_run_queue() {
        let core = single_cpu_core();
        let a = core.task_create(0, GamingTags::empty());
        let b = core.task_create(0, GamingTags::empty());
        core.dep_add(a, b, DependencyKind::Direct as u8, 1.0).unwrap();
        core.place_and_enqueue(a).unwrap();

        core.task_destroy(a);
        let tasks = core.tasks.lock();
        assert!(tasks.0.get(a).is_none());
        assert!(tasks.0.get(b).unwrap().inbound_edges.is_empty());
    }

    #[test]
    fn gaming_task_dominates_but_background_still_makes_progress() {
        let core = single_cpu_core();
        let gaming = core.task_create(0, GamingTags::GAMING);
        let background = core.task_create(10, GamingTags::empty());
        core.place_and_enqueue(gaming).unwrap();
        core.place_and_enqueue(background).unwrap();

        let mut now = 0u64;
        for _ in 0..200 {
            let Some(running) = core.schedule(0) else { break };
            now += 1_000_000;
            core.tick(0, now).unwrap();
            core.yield_(0).unwrap();
            let _ = running;
        }

        let tasks = core.tasks.lock();
        let gaming_exec = tasks.0.get(gaming).unwrap().sum_exec_ns;
        let background_exec = tasks.0.get(background).unwrap().sum_exec_ns;
        assert!(
            gaming_exec > background_exec,
            "the heavier-weighted gaming task must win most turns"
        );
        assert!(background_exec > 0, "the background task must not starve outright");
    }

    #[test]
    fn wake_word_resolves_a_pending_wait() {
        let core = single_cpu_core();
        let waiter = core.task_create(0, GamingTags::empty());
        core.place_and_enqueue(waiter).unwrap();
        core.schedule(0); // move to Running so wait_word's Blocked path is meaningful

        let outcome = core
            .wait_word(waiter, 0x1000, 0, WaitFlags::empty())
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::Blocked(_)));

        let count = core.wake_word(0x1000, 1);
        assert_eq!(count, 1);
    }
}
