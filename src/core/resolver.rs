//! Cycle resolution. At quiescence the dependency graph is frozen; a
//! closed strongly connected component (one no edge leaves) can be
//! finished by key policy without consulting anything outside it.

use std::sync::mpsc::Sender;

use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::algebra::Lattice;
use crate::core::cell::Cell;
use crate::core::key::Key;
use crate::core::pool::PoolCore;
use crate::core::stats::PoolStats;

impl<K: Key<V>, V: Lattice> PoolCore<K, V> {
    /// Re-arm at every quiescence until a pass resolves no cycle.
    pub(crate) fn arm_resolve_cycles(&self, done: Sender<()>) {
        let weak = self.weak();
        self.on_quiescent(Box::new(move || {
            let Some(core) = weak.upgrade() else { return };
            if core.resolve_closed_sccs() > 0 {
                core.arm_resolve_cycles(done);
            } else {
                let _ = done.send(());
            }
        }));
    }

    /// Re-arm at every quiescence until a pass applies no fallback.
    pub(crate) fn arm_resolve_defaults(&self, done: Sender<()>) {
        let weak = self.weak();
        self.on_quiescent(Box::new(move || {
            let Some(core) = weak.upgrade() else { return };
            if core.resolve_defaults_pass() > 0 {
                core.arm_resolve_defaults(done);
            } else {
                let _ = done.send(());
            }
        }));
    }

    /// Combined policy: cycles first, then fallbacks, per round.
    pub(crate) fn arm_resolve_cell(&self, done: Sender<()>) {
        let weak = self.weak();
        self.on_quiescent(Box::new(move || {
            let Some(core) = weak.upgrade() else { return };
            let mut fired = core.resolve_closed_sccs();
            if fired == 0 {
                fired = core.resolve_defaults_pass();
            }
            if fired > 0 {
                core.arm_resolve_cell(done);
            } else {
                let _ = done.send(());
            }
        }));
    }

    pub(crate) fn arm_incomplete_cells(&self, done: Sender<Vec<Cell<K, V>>>) {
        let weak = self.weak();
        self.on_quiescent(Box::new(move || {
            let Some(core) = weak.upgrade() else { return };
            let cells: Vec<_> = core
                .registry
                .snapshot()
                .into_iter()
                .filter(|c| !c.is_completed())
                .collect();
            let _ = done.send(cells);
        }));
    }

    /// One detection pass. Builds the dependency digraph over registered
    /// incomplete cells, finds its closed SCCs, and resolves each through
    /// the key of its first member. Returns the number of SCCs resolved.
    pub(crate) fn resolve_closed_sccs(&self) -> usize {
        let cells: Vec<Cell<K, V>> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|c| !c.is_completed())
            .collect();
        if cells.is_empty() {
            return 0;
        }

        let mut graph: DiGraph<Cell<K, V>, ()> = DiGraph::with_capacity(cells.len(), cells.len());
        let mut index = FxHashMap::default();
        for cell in &cells {
            index.insert(cell.id(), graph.add_node(cell.clone()));
        }
        for cell in &cells {
            let from = index[&cell.id()];
            for dep in cell.dependency_ids() {
                // Edges to cells outside the registry point at completed
                // cells and cannot hold a component open.
                if let Some(&to) = index.get(&dep) {
                    graph.update_edge(from, to, ());
                }
            }
        }

        let sccs = tarjan_scc(&graph);
        let mut component = vec![0usize; graph.node_count()];
        for (i, scc) in sccs.iter().enumerate() {
            for &node in scc {
                component[node.index()] = i;
            }
        }

        let mut resolved = 0;
        for (i, scc) in sccs.iter().enumerate() {
            // A one-cell component is a cycle only via a self-loop.
            if scc.len() == 1 && !graph.contains_edge(scc[0], scc[0]) {
                continue;
            }
            let closed = scc.iter().all(|&node| {
                graph
                    .neighbors(node)
                    .all(|next| component[next.index()] == i)
            });
            if !closed {
                continue;
            }

            let members: Vec<Cell<K, V>> = scc.iter().map(|&node| graph[node].clone()).collect();
            debug!(size = members.len(), "resolving closed cycle");
            let assignments = members[0].key().resolve(&members);
            // Sever before completing so no post-resolution callback can
            // be queued against a resolved cell from inside the component.
            for (cell, _) in &assignments {
                for member in &members {
                    cell.sever(member);
                }
            }
            for (cell, value) in assignments {
                cell.put_join(value, true);
            }
            PoolStats::bump(&self.stats.cycles_resolved);
            resolved += 1;
        }
        resolved
    }

    /// One fallback pass over triggered-but-incomplete cells. Returns how
    /// many cells had a fallback applied.
    pub(crate) fn resolve_defaults_pass(&self) -> usize {
        let mut applied = 0;
        for cell in self.registry.snapshot() {
            if cell.is_completed() || !cell.was_triggered() {
                continue;
            }
            let assignments = cell.key().fallback(std::slice::from_ref(&cell));
            if assignments.is_empty() {
                continue;
            }
            debug!(cell = ?cell.id(), "applying fallback");
            for (target, value) in assignments {
                target.put_join(value, true);
            }
            PoolStats::bump(&self.stats.fallbacks_applied);
            applied += 1;
        }
        applied
    }
}
