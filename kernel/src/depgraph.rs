//! Priority-inheritance graph (§4.4).
//!
//! Edges are stored in a single table, referencing endpoints by task id
//! rather than embedding owned back-pointers — §9's "Cyclic graphs" design
//! note explicitly calls for this instead of a pointer-based inheritance
//! chain, since the latter would tempt unsound cyclic ownership. Cycle
//! detection is a bounded BFS at insert time.

use num_enum::TryFromPrimitive;
use std::collections::HashMap;
use vec_arena::Arena;

use crate::config::SchedConfig;
use crate::error::CoreError;
use crate::task::{Task, TaskId};

pub type EdgeId = usize;

/// §3 "Dependency edge" `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum DependencyKind {
    Direct = 0,
    Lock = 1,
    Ipc = 2,
    Gpu = 3,
    Audio = 4,
    Fs = 5,
    Net = 6,
}

impl DependencyKind {
    /// §4.4 `add_edge`'s `kind_bias` table.
    fn bias(self) -> i32 {
        match self {
            DependencyKind::Direct => 0,
            DependencyKind::Lock => 1,
            DependencyKind::Gpu => 0,
            DependencyKind::Audio => 1,
            DependencyKind::Ipc => 2,
            DependencyKind::Fs => 3,
            DependencyKind::Net => 4,
        }
    }
}

/// §3 "Dependency edge".
#[derive(Debug, Clone)]
pub struct Edge {
    pub dependent: TaskId,
    pub dependency: TaskId,
    pub kind: DependencyKind,
    pub strength: f64,
    pub created_at_ns: u64,
    pub last_touched_ns: u64,
    pub active: bool,
}

impl Edge {
    fn inherited_priority(&self, dependent_effective_priority: i32) -> i32 {
        let drop = (self.strength.clamp(0.0, 1.0) * 2.0).floor() as i32;
        (dependent_effective_priority + self.kind.bias() - drop).clamp(
            crate::task::MIN_NICE,
            crate::task::MAX_NICE,
        )
    }
}

/// Anything that can resolve a [`TaskId`] to a live [`Task`], so the graph
/// doesn't need to own the task table itself (§9 "Arenas and indices").
pub trait TaskLookup {
    fn task(&self, id: TaskId) -> Option<&Task>;
    fn task_mut(&mut self, id: TaskId) -> Option<&mut Task>;
}

/// Exactly one process-wide instance (§9 "Global state"). Edges are
/// short-lived and high-turnover, so a free-list-backed arena (matching
/// the teacher's `vec_arena::Arena` usage elsewhere) is the natural fit.
pub struct DependencyGraph {
    edges: Arena<Edge>,
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyGraph {
    pub fn new() -> Self {
        DependencyGraph { edges: Arena::new() }
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(id)
    }

    /// §4.4 `add_edge(dep, holder, kind, strength)`. `dependent` is the
    /// task doing the waiting ("dep"); `dependency` is the task it waits
    /// on ("holder"), whose `inherited_priority` this call may raise.
    pub fn add_edge<T: TaskLookup>(
        &mut self,
        tasks: &mut T,
        dependent: TaskId,
        dependency: TaskId,
        kind: DependencyKind,
        strength: f64,
        now_ns: u64,
    ) -> Result<EdgeId, CoreError> {
        if dependent == dependency {
            return Err(CoreError::WouldCreateCycle);
        }
        if self.reachable(tasks, dependency, dependent) {
            return Err(CoreError::WouldCreateCycle);
        }

        let edge = Edge {
            dependent,
            dependency,
            kind,
            strength: strength.clamp(0.0, 1.0),
            created_at_ns: now_ns,
            last_touched_ns: now_ns,
            active: true,
        };
        let edge_id = self.edges.insert(edge);

        let dependent_effective = tasks
            .task(dependent)
            .map(Task::effective_priority)
            .ok_or(CoreError::UnknownTask)?;

        if let Some(t) = tasks.task_mut(dependent) {
            t.outbound_edges.push(edge_id);
        }
        if let Some(t) = tasks.task_mut(dependency) {
            t.inbound_edges.push(edge_id);
        }

        let inherited = self.edges[edge_id].inherited_priority(dependent_effective);
        if let Some(holder) = tasks.task_mut(dependency) {
            holder.inherited_priority = Some(match holder.inherited_priority {
                Some(cur) => cur.min(inherited),
                None => inherited,
            });
        }

        Ok(edge_id)
    }

    /// §4.4 `remove_edge(dep, holder)`: unlinks the (first-matching) edge
    /// between the pair and recomputes `holder.inherited_priority`
    /// strictly from the edges that remain (§9's resolved Open Question —
    /// no "assume better than original" heuristic).
    pub fn remove_edge<T: TaskLookup>(
        &mut self,
        tasks: &mut T,
        dependent: TaskId,
        dependency: TaskId,
    ) -> Result<(), CoreError> {
        let edge_id = tasks
            .task(dependency)
            .into_iter()
            .flat_map(|t| t.inbound_edges.iter().copied())
            .find(|&id| {
                self.edges
                    .get(id)
                    .map(|e| e.dependent == dependent && e.dependency == dependency)
                    .unwrap_or(false)
            })
            .ok_or(CoreError::UnknownTask)?;

        self.unlink(tasks, edge_id);
        self.recompute_inherited(tasks, dependency);
        Ok(())
    }

    /// Unlinks a specific edge by id and recomputes its holder's inherited
    /// priority. Used by the wait-word primitive, which knows the
    /// `EdgeId` of the priority-inherit edge it added but not necessarily
    /// the endpoint pair (the waiter may have been requeued onto a
    /// different address since).
    pub fn remove_edge_by_id<T: TaskLookup>(&mut self, tasks: &mut T, edge_id: EdgeId) {
        let holder = self.edges.get(edge_id).map(|e| e.dependency);
        self.unlink(tasks, edge_id);
        if let Some(holder) = holder {
            self.recompute_inherited(tasks, holder);
        }
    }

    fn unlink<T: TaskLookup>(&mut self, tasks: &mut T, edge_id: EdgeId) {
        if let Some(edge) = self.edges.remove(edge_id) {
            if let Some(t) = tasks.task_mut(edge.dependent) {
                t.outbound_edges.retain(|&id| id != edge_id);
            }
            if let Some(t) = tasks.task_mut(edge.dependency) {
                t.inbound_edges.retain(|&id| id != edge_id);
            }
        }
    }

    /// §4.4 `tick()`: drops edges stale per §3 ("last_touched older than
    /// 5s and active=false") and recomputes the affected holder's
    /// inherited priority.
    pub fn tick<T: TaskLookup>(&mut self, tasks: &mut T, now_ns: u64, cfg: &SchedConfig) {
        let stale: Vec<EdgeId> = self
            .edges
            .iter()
            .filter(|(_, e)| {
                !e.active && now_ns.saturating_sub(e.last_touched_ns) > cfg.edge_stale_after_ns
            })
            .map(|(id, _)| id)
            .collect();

        let mut holders_to_recompute = Vec::new();
        for id in stale {
            if let Some(edge) = self.edges.get(id) {
                holders_to_recompute.push(edge.dependency);
            }
            self.unlink(tasks, id);
        }
        holders_to_recompute.sort_unstable();
        holders_to_recompute.dedup();
        for holder in holders_to_recompute {
            self.recompute_inherited(tasks, holder);
        }
    }

    /// Marks an edge as touched "by a lock release" (§4.4 `tick`),
    /// refreshing its liveness window without removing it.
    pub fn touch(&mut self, edge_id: EdgeId, now_ns: u64) {
        if let Some(edge) = self.edges.get_mut(edge_id) {
            edge.last_touched_ns = now_ns;
        }
    }

    /// Marks an edge inactive (its owning wait ended) so it becomes
    /// eligible for staleness pruning rather than lingering forever.
    pub fn deactivate(&mut self, edge_id: EdgeId, now_ns: u64) {
        if let Some(edge) = self.edges.get_mut(edge_id) {
            edge.active = false;
            edge.last_touched_ns = now_ns;
        }
    }

    fn recompute_inherited<T: TaskLookup>(&self, tasks: &mut T, holder: TaskId) {
        let inbound: Vec<EdgeId> = tasks
            .task(holder)
            .map(|t| t.inbound_edges.iter().copied().collect())
            .unwrap_or_default();

        let mut best: Option<i32> = None;
        for id in inbound {
            let Some(edge) = self.edges.get(id) else { continue };
            let Some(dependent_effective) = tasks.task(edge.dependent).map(Task::effective_priority)
            else {
                continue;
            };
            let inherited = edge.inherited_priority(dependent_effective);
            best = Some(best.map_or(inherited, |b: i32| b.min(inherited)));
        }

        if let Some(t) = tasks.task_mut(holder) {
            t.inherited_priority = best;
        }
    }

    /// Cycle check (§3 "A cycle in the graph is a fault"): is `target`
    /// reachable from `start` by following outbound edges? Used as
    /// `reachable(dependency, dependent)` in `add_edge` — "the dependency
    /// is not already transitively depending on the dependent".
    fn reachable<T: TaskLookup>(&self, tasks: &T, start: TaskId, target: TaskId) -> bool {
        let mut visited = std::collections::HashSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(task) = tasks.task(node) {
                for &edge_id in &task.outbound_edges {
                    if let Some(edge) = self.edges.get(edge_id) {
                        stack.push(edge.dependency);
                    }
                }
            }
        }
        false
    }

    /// Removes every edge that mentions `id`, in either direction,
    /// recomputing inherited priorities of any holders that lose an edge
    /// (§3 invariant d: "removal on exit is total").
    pub fn purge_task<T: TaskLookup>(&mut self, tasks: &mut T, id: TaskId) {
        let outbound: Vec<EdgeId> = tasks
            .task(id)
            .map(|t| t.outbound_edges.iter().copied().collect())
            .unwrap_or_default();
        let inbound: Vec<EdgeId> = tasks
            .task(id)
            .map(|t| t.inbound_edges.iter().copied().collect())
            .unwrap_or_default();

        let mut holders_to_recompute = Vec::new();
        for edge_id in outbound.into_iter().chain(inbound.into_iter()) {
            if let Some(edge) = self.edges.get(edge_id) {
                holders_to_recompute.push(edge.dependency);
            }
            self.unlink(tasks, edge_id);
        }
        holders_to_recompute.retain(|&h| h != id);
        holders_to_recompute.sort_unstable();
        holders_to_recompute.dedup();
        for holder in holders_to_recompute {
            self.recompute_inherited(tasks, holder);
        }
    }
}

/// A plain in-memory task table used by tests and by small call sites
/// that don't need the full scheduler engine.
#[derive(Default)]
pub struct TaskTable(pub HashMap<TaskId, Task>);

impl TaskLookup for TaskTable {
    fn task(&self, id: TaskId) -> Option<&Task> {
        self.0.get(&id)
    }
    fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.0.get_mut(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(nices: &[(TaskId, i32)]) -> TaskTable {
        let mut table = TaskTable::default();
        for &(id, nice) in nices {
            table.0.insert(id, Task::new(id, nice));
        }
        table
    }

    #[test]
    fn add_edge_raises_holders_inherited_priority() {
        let mut table = table_with(&[(0, 5), (1, -10)]);
        let mut graph = DependencyGraph::new();
        // dependent=0 (nice 5) waits on dependency=1 (nice -10).
        graph
            .add_edge(&mut table, 0, 1, DependencyKind::Lock, 1.0, 0)
            .unwrap();
        // dependent=0 has nice 5, holder=1 should get <= 5 + bias(1) - floor(2) = 4
        assert!(table.0[&1].inherited_priority.unwrap() <= 5);
    }

    #[test]
    fn priority_inheritance_scenario_from_spec() {
        // T_low nice +5 holds L; T_high nice -10 waits on L.
        let mut table = table_with(&[(0, 5), (1, -10)]);
        let mut graph = DependencyGraph::new();
        let edge = graph
            .add_edge(&mut table, 1, 0, DependencyKind::Lock, 1.0, 0)
            .unwrap();
        assert!(table.0[&0].effective_priority() <= -10);

        graph.remove_edge(&mut table, 1, 0).unwrap();
        assert_eq!(table.0[&0].effective_priority(), 5);
        let _ = edge;
    }

    #[test]
    fn cycle_is_rejected() {
        let mut table = table_with(&[(0, 0), (1, 0)]);
        let mut graph = DependencyGraph::new();
        graph
            .add_edge(&mut table, 0, 1, DependencyKind::Direct, 1.0, 0)
            .unwrap();
        let err = graph.add_edge(&mut table, 1, 0, DependencyKind::Direct, 1.0, 0);
        assert_eq!(err, Err(CoreError::WouldCreateCycle));
    }

    #[test]
    fn transitive_chain_propagates_priority() {
        // A waits on B waits on C: C should inherit A's priority.
        let mut table = table_with(&[(0, -15), (1, 0), (2, 10)]);
        let mut graph = DependencyGraph::new();
        graph
            .add_edge(&mut table, 0, 1, DependencyKind::Lock, 1.0, 0)
            .unwrap();
        graph
            .add_edge(&mut table, 1, 2, DependencyKind::Lock, 1.0, 0)
            .unwrap();
        assert!(table.0[&2].effective_priority() <= -15 + 2);
    }

    #[test]
    fn tick_prunes_stale_inactive_edges() {
        let mut table = table_with(&[(0, -10), (1, 5)]);
        let mut graph = DependencyGraph::new();
        let edge_id = graph
            .add_edge(&mut table, 0, 1, DependencyKind::Lock, 1.0, 0)
            .unwrap();
        graph.deactivate(edge_id, 0);
        let cfg = SchedConfig::default();
        graph.tick(&mut table, cfg.edge_stale_after_ns + 1, &cfg);
        assert_eq!(table.0[&1].effective_priority(), 5);
        assert!(table.0[&1].inbound_edges.is_empty());
    }

    #[test]
    fn purge_task_removes_all_mentioning_edges() {
        let mut table = table_with(&[(0, -10), (1, 5), (2, 0)]);
        let mut graph = DependencyGraph::new();
        graph
            .add_edge(&mut table, 0, 1, DependencyKind::Lock, 1.0, 0)
            .unwrap();
        graph
            .add_edge(&mut table, 2, 0, DependencyKind::Direct, 1.0, 0)
            .unwrap();
        graph.purge_task(&mut table, 0);
        assert!(table.0[&1].inbound_edges.is_empty());
        assert!(table.0[&0].inbound_edges.is_empty());
        assert!(table.0[&0].outbound_edges.is_empty());
    }
}
