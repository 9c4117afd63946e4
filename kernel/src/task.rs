//! The task record (§3) — the unit of scheduling shared by all four
//! subsystems.

use bitflags::bitflags;
use core::cmp::Ordering;
use core::ops::{Add, AddAssign, Sub};
use smallvec::SmallVec;

use crate::topology::CpuClass;

/// Stable integer task id (§3 "Identity").
pub type TaskId = usize;

/// §3 "Scheduling state".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Ready,
    Running,
    Blocked,
    Zombie,
    Dead,
}

bitflags! {
    /// Flat gaming-classification tag set (§3, §9 "Dynamic dispatch":
    /// capability questions are cheap bit tests, not a class hierarchy).
    ///
    /// Setting a stronger tag implies weaker ones: frame-critical implies
    /// gaming; input and audio do not imply gaming on their own (a task can
    /// be audio-critical without being part of the render/input gaming
    /// loop), matching spec.md's explicit list of tags rather than
    /// widening it.
    #[derive(Default)]
    pub struct GamingTags: u8 {
        const GAMING          = 0b0000_0001;
        const FRAME_CRITICAL  = 0b0000_0010;
        const INPUT           = 0b0000_0100;
        const AUDIO           = 0b0000_1000;
        const VRR_SYNC        = 0b0001_0000;
    }
}

impl GamingTags {
    /// Applies the implication rule named in §3: setting a stronger tag
    /// implies the weaker ones it depends on.
    pub fn set_implied(&mut self, tag: GamingTags, value: bool) {
        if value {
            self.insert(tag);
            if tag.contains(GamingTags::FRAME_CRITICAL) {
                self.insert(GamingTags::GAMING);
            }
        } else {
            self.remove(tag);
        }
    }

    pub fn is_gaming(self) -> bool {
        self.contains(GamingTags::GAMING)
    }

    pub fn is_frame_critical(self) -> bool {
        self.contains(GamingTags::FRAME_CRITICAL)
    }

    pub fn is_input(self) -> bool {
        self.contains(GamingTags::INPUT)
    }

    pub fn is_audio(self) -> bool {
        self.contains(GamingTags::AUDIO)
    }
}

/// Per-task burst history (§3, §4.2). Score moves by ±1 per tick, bounded
/// `[0, 39]` (invariant f).
#[derive(Debug, Clone, Copy, Default)]
pub struct BurstWindow {
    pub last_burst_ns: u64,
    pub prev_burst_ns: u64,
    pub score: i32,
}

/// Per-task placement bookkeeping (§3, §4.3).
#[derive(Debug, Clone, Copy)]
pub struct PlacementState {
    pub last_cpu: Option<u32>,
    pub preferred_class: CpuClass,
    pub migration_count: u32,
    pub last_migration_ns: u64,
    /// NUMA node of this task's placement record, if one has been
    /// established (§4.3 scoring table, "NUMA: same node as T's placement
    /// record (if any)").
    pub numa_node: Option<u32>,
    /// Resident working-set estimate in bytes (§6 "Memory accounting").
    pub working_set_bytes: u64,
    /// Fraction of recent wall time spent blocked on I/O, `[0, 1]`, used to
    /// infer the efficiency-class preference (§4.3).
    pub io_wait_fraction: f64,
    /// Whether this task is tagged as a non-interactive background task
    /// for the purposes of the efficiency bonus and periodic rebalance
    /// (§4.3 "efficiency bonus... only for background-tagged T").
    pub background: bool,
}

impl Default for PlacementState {
    fn default() -> Self {
        PlacementState {
            last_cpu: None,
            preferred_class: CpuClass::Performance,
            migration_count: 0,
            last_migration_ns: 0,
            numa_node: None,
            working_set_bytes: 0,
            io_wait_fraction: 0.0,
            background: false,
        }
    }
}

/// Virtual time (vruntime/deadline), scaled nanoseconds-of-progress. Wraps
/// at `u64::MAX` the same way Linux's CFS does: comparisons use a signed
/// delta rather than the raw unsigned value, so ordering stays correct
/// across a wraparound (§8 boundary test: "vruntime wraparound (64-bit)").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct VTime(pub u64);

impl VTime {
    pub fn delta(self, other: Self) -> i64 {
        self.0.wrapping_sub(other.0) as i64
    }
}

impl PartialOrd for VTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.delta(*other).cmp(&0)
    }
}

impl Add<u64> for VTime {
    type Output = VTime;
    fn add(self, rhs: u64) -> VTime {
        VTime(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u64> for VTime {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub for VTime {
    type Output = i64;
    fn sub(self, rhs: VTime) -> i64 {
        self.delta(rhs)
    }
}

/// `weight = table[nice+20]` (invariant a), the same multiplicative ladder
/// Linux's CFS uses: a ~10% CPU-share change per nice level, grounded on
/// the teacher's (and NPUCore's) `nice_to_weight`.
#[rustfmt::skip]
const NICE_TO_WEIGHT: [u32; 40] = [
   /* -20 */ 88761, 71755, 56483, 46273, 36291,
   /* -15 */ 29154, 23254, 18705, 14949, 11916,
   /* -10 */  9548,  7620,  6100,  4904,  3906,
   /*  -5 */  3121,  2501,  1991,  1586,  1277,
   /*   0 */  1024,   820,   655,   526,   423,
   /*   5 */   335,   272,   215,   172,   137,
   /*  10 */   110,    87,    70,    56,    45,
   /*  15 */    36,    29,    23,    18,    15,
];

pub const NICE_0_WEIGHT: u32 = NICE_TO_WEIGHT[20];
pub const MIN_NICE: i32 = -20;
pub const MAX_NICE: i32 = 19;

/// `table[nice+20]` (invariant a). Panics on out-of-range nice, which is a
/// programming error at the call site (task creation validates nice
/// first).
pub fn nice_to_weight(nice: i32) -> u32 {
    debug_assert!((MIN_NICE..=MAX_NICE).contains(&nice), "nice out of range");
    NICE_TO_WEIGHT[(nice.clamp(MIN_NICE, MAX_NICE) + 20) as usize]
}

/// Outbound/inbound dependency-edge ids a task carries (§3 "Dependency
/// edges outbound/inbound"). Stored as small inline vectors of edge-table
/// indices; the edge table itself lives in [`crate::depgraph`].
pub type EdgeIdList = SmallVec<[usize; 4]>;

/// The task record (§3).
pub struct Task {
    pub id: TaskId,
    pub state: TaskState,

    pub nice: i32,
    pub weight: u32,

    pub vruntime: VTime,
    pub deadline: VTime,
    /// Signed lag, negative ⇒ ahead of fair share (§3).
    pub lag: i64,

    pub burst: BurstWindow,
    pub tags: GamingTags,
    pub placement: PlacementState,

    pub outbound_edges: EdgeIdList,
    pub inbound_edges: EdgeIdList,

    /// Priority inherited from inbound dependency edges, clamped into
    /// `[MIN_NICE, MAX_NICE]`. `None` means no inheritance is currently in
    /// effect, i.e. `effective_priority == base_priority` (§3 invariant e,
    /// §4.4).
    pub inherited_priority: Option<i32>,

    pub sum_exec_ns: u64,
    pub exec_start_ns: u64,

    /// Frame-deadline hook state (§4.6), present only for gaming tasks but
    /// kept inline (cheap, fixed-size) rather than behind an `Option` box,
    /// matching §9's "no class hierarchy" design note.
    pub frame: crate::frame::FrameState,
}

impl Task {
    pub fn new(id: TaskId, nice: i32) -> Self {
        Task {
            id,
            state: TaskState::Created,
            nice,
            weight: nice_to_weight(nice),
            vruntime: VTime(0),
            deadline: VTime(0),
            lag: 0,
            burst: BurstWindow::default(),
            tags: GamingTags::empty(),
            placement: PlacementState::default(),
            outbound_edges: EdgeIdList::new(),
            inbound_edges: EdgeIdList::new(),
            inherited_priority: None,
            sum_exec_ns: 0,
            exec_start_ns: 0,
            frame: crate::frame::FrameState::default(),
        }
    }

    /// Base priority is just the nice value; `effective_priority` (§4.4)
    /// additionally folds in inherited priority.
    pub fn base_priority(&self) -> i32 {
        self.nice
    }

    pub fn effective_priority(&self) -> i32 {
        let mut p = self.nice;
        if let Some(inherited) = self.inherited_priority {
            p = p.min(inherited);
        }
        if let Some(boosted) = self.frame.priority_override() {
            p = p.min(boosted);
        }
        p
    }

    /// §4.1 "weight_effective": base weight plus the gaming-class boost.
    /// Frame-critical dominates gaming which dominates audio; input
    /// dominates all (it's checked first in spec.md's weight table, and
    /// input implies a human-facing deadline no other class has).
    pub fn weight_effective(&self, cfg: &crate::config::SchedConfig) -> u32 {
        let boost = if self.tags.is_input() {
            cfg.gaming_boost_input
        } else if self.tags.is_frame_critical() {
            cfg.gaming_boost_frame_critical
        } else if self.tags.is_gaming() {
            cfg.gaming_boost_gaming
        } else if self.tags.is_audio() {
            cfg.gaming_boost_audio
        } else {
            0
        };
        self.weight + boost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_matches_nice_table_invariant_a() {
        assert_eq!(nice_to_weight(0), NICE_0_WEIGHT);
        assert!(nice_to_weight(-20) > nice_to_weight(0));
        assert!(nice_to_weight(0) > nice_to_weight(19));
    }

    #[test]
    fn gaming_tag_implication_frame_critical_implies_gaming() {
        let mut tags = GamingTags::empty();
        tags.set_implied(GamingTags::FRAME_CRITICAL, true);
        assert!(tags.is_frame_critical());
        assert!(tags.is_gaming());
    }

    #[test]
    fn clearing_frame_critical_does_not_clear_gaming() {
        let mut tags = GamingTags::empty();
        tags.set_implied(GamingTags::GAMING, true);
        tags.set_implied(GamingTags::FRAME_CRITICAL, true);
        tags.set_implied(GamingTags::FRAME_CRITICAL, false);
        assert!(tags.is_gaming());
        assert!(!tags.is_frame_critical());
    }

    #[test]
    fn vtime_ordering_survives_wraparound() {
        let near_max = VTime(u64::MAX - 10);
        let wrapped = near_max + 20;
        assert!(wrapped > near_max, "wrapped vtime must order as later");
    }

    #[test]
    fn effective_priority_is_min_of_base_and_inherited() {
        let mut t = Task::new(0, 5);
        assert_eq!(t.effective_priority(), 5);
        t.inherited_priority = Some(-10);
        assert_eq!(t.effective_priority(), -10);
        t.inherited_priority = Some(10);
        assert_eq!(t.effective_priority(), 5);
    }

    #[test]
    fn weight_effective_prefers_input_over_other_tags() {
        let cfg = crate::config::SchedConfig::default();
        let mut t = Task::new(0, 0);
        t.tags.set_implied(GamingTags::FRAME_CRITICAL, true);
        t.tags.set_implied(GamingTags::INPUT, true);
        assert_eq!(t.weight_effective(&cfg), t.weight + cfg.gaming_boost_input);
    }
}
