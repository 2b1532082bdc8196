//! The cell: a monotonically refined lattice value with dependency wiring.
//!
//! A cell's value only moves up its lattice. Non-final refinements flow to
//! dependents registered through [`Cell::when`]; the first final value
//! freezes the cell, notifies dependents one last time, and detaches it
//! from the dependency graph.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::algebra::{Lattice, Outcome};
use crate::core::key::Key;
use crate::core::pool::PoolCore;
use crate::core::sched::SequentialTask;
use crate::core::stats::PoolStats;

/// Pool-unique cell identity. Stable across the cell's lifetime; cells
/// hash and compare by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellId(pub(crate) u64);

/// Where a cell is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created and registered, init not yet scheduled.
    Pending,
    /// Triggered; init has been claimed by a pool task.
    Active,
    /// Terminal value reached. Value and wiring are frozen.
    Completed,
}

pub(crate) type InitFn<K, V> = Box<dyn FnOnce(&Cell<K, V>) -> Outcome<V> + Send + 'static>;
pub(crate) type CombineFn<K, V> =
    Arc<dyn Fn(&[(Cell<K, V>, Outcome<V>)]) -> Outcome<V> + Send + Sync + 'static>;

/// A dependency edge as seen from the dependent: the upstream handle plus
/// the combine callback fired on its updates.
struct DepEntry<K: Key<V>, V: Lattice> {
    cell: Cell<K, V>,
    combine: CombineFn<K, V>,
}

/// Cell-local mutable state. One mutex, never held across user code.
struct Guts<K: Key<V>, V: Lattice> {
    value: V,
    completed: bool,
    init: Option<InitFn<K, V>>,
    /// Upstream edges fired on non-final updates.
    next_deps: FxHashMap<CellId, DepEntry<K, V>>,
    /// Upstream edges fired on final updates.
    complete_deps: FxHashMap<CellId, DepEntry<K, V>>,
    /// Dependents to notify on non-final updates.
    next_outs: FxHashMap<CellId, Cell<K, V>>,
    /// Dependents to notify on the final update.
    complete_outs: FxHashMap<CellId, Cell<K, V>>,
}

struct CellInner<K: Key<V>, V: Lattice> {
    id: CellId,
    key: K,
    pool: Arc<PoolCore<K, V>>,
    /// Trigger latch: set once, by the first trigger.
    tasks_active: AtomicBool,
    guts: Mutex<Guts<K, V>>,
}

/// Cheap-clone handle to a cell. Equality and hashing go by [`CellId`].
pub struct Cell<K: Key<V>, V: Lattice> {
    inner: Arc<CellInner<K, V>>,
}

impl<K: Key<V>, V: Lattice> Clone for Cell<K, V> {
    fn clone(&self) -> Self {
        Cell {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Key<V>, V: Lattice> PartialEq for Cell<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl<K: Key<V>, V: Lattice> Eq for Cell<K, V> {}

impl<K: Key<V>, V: Lattice> std::hash::Hash for Cell<K, V> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl<K: Key<V>, V: Lattice> fmt::Debug for Cell<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.inner.id)
            .field("phase", &self.phase())
            .finish()
    }
}

/// What a put decided while the cell lock was held; acted on after release.
enum PutAction<K: Key<V>, V: Lattice> {
    Absorbed,
    Grew {
        value: V,
        outs: Vec<Cell<K, V>>,
    },
    Completed {
        value: V,
        outs: Vec<Cell<K, V>>,
        upstreams: Vec<Cell<K, V>>,
    },
}

impl<K: Key<V>, V: Lattice> Cell<K, V> {
    /// Build and register a fresh cell at bottom. Pool-internal; users go
    /// through `HandlerPool::new_cell` / `new_completer`.
    pub(crate) fn create(pool: Arc<PoolCore<K, V>>, key: K, init: InitFn<K, V>) -> Self {
        let cell = Cell {
            inner: Arc::new(CellInner {
                id: pool.next_cell_id(),
                key,
                pool,
                tasks_active: AtomicBool::new(false),
                guts: Mutex::new(Guts {
                    value: V::bottom(),
                    completed: false,
                    init: Some(init),
                    next_deps: FxHashMap::default(),
                    complete_deps: FxHashMap::default(),
                    next_outs: FxHashMap::default(),
                    complete_outs: FxHashMap::default(),
                }),
            }),
        };
        cell.inner.pool.register_cell(cell.clone());
        PoolStats::bump(&cell.inner.pool.stats.cells_created);
        cell
    }

    /// Build a cell that is born completed at `value`. Never registered.
    pub(crate) fn create_completed(pool: Arc<PoolCore<K, V>>, key: K, value: V) -> Self {
        let cell = Cell {
            inner: Arc::new(CellInner {
                id: pool.next_cell_id(),
                key,
                pool,
                tasks_active: AtomicBool::new(true),
                guts: Mutex::new(Guts {
                    value,
                    completed: true,
                    init: None,
                    next_deps: FxHashMap::default(),
                    complete_deps: FxHashMap::default(),
                    next_outs: FxHashMap::default(),
                    complete_outs: FxHashMap::default(),
                }),
            }),
        };
        PoolStats::bump(&cell.inner.pool.stats.cells_created);
        PoolStats::bump(&cell.inner.pool.stats.cells_completed);
        cell
    }

    #[inline]
    pub fn id(&self) -> CellId {
        self.inner.id
    }

    #[inline]
    pub fn key(&self) -> &K {
        &self.inner.key
    }

    /// Current lattice value. Non-blocking snapshot; the value may keep
    /// growing after this returns unless the cell is completed.
    pub fn value(&self) -> V {
        self.inner.guts.lock().value.clone()
    }

    pub fn is_completed(&self) -> bool {
        self.inner.guts.lock().completed
    }

    pub fn phase(&self) -> Phase {
        if self.inner.guts.lock().completed {
            Phase::Completed
        } else if self.inner.tasks_active.load(Ordering::Acquire) {
            Phase::Active
        } else {
            Phase::Pending
        }
    }

    pub(crate) fn was_triggered(&self) -> bool {
        self.inner.tasks_active.load(Ordering::Acquire)
    }

    /// Schedule this cell's init on the pool. Idempotent: exactly one
    /// trigger wins the latch, and triggering a completed cell is a no-op.
    pub fn trigger(&self) {
        if self.is_completed() {
            return;
        }
        if self.inner.tasks_active.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(cell = ?self.inner.id, "triggered");
        let cell = self.clone();
        self.inner.pool.submit(move || cell.run_init());
    }

    fn run_init(&self) {
        let init = {
            let mut guts = self.inner.guts.lock();
            if guts.completed {
                return;
            }
            guts.init.take()
        };
        let Some(init) = init else { return };
        match init(self) {
            Outcome::Next(v) => self.put_join(v, false),
            Outcome::Final(v) => self.put_join(v, true),
            Outcome::NoOutcome => {}
        }
    }

    /// Register a dependency of `self` on `other`.
    ///
    /// `other` is triggered so its value is being produced. Each time it
    /// grows, `combine` fires on `self`'s sequential queue with a
    /// one-element slice holding the changed dependency and its outcome
    /// (`Next` for a non-final update, `Final` for the terminal one); the
    /// returned outcome is joined into `self`. Callbacks that need other
    /// dependencies read them directly via [`Cell::value`] /
    /// [`Cell::is_completed`].
    ///
    /// Registering the same edge again replaces the previous combine. If
    /// `other` is already completed, the combine fires once with its final
    /// value and no edge is kept. `when(self)` is legal and forms a
    /// closed one-cell cycle for the resolver.
    pub fn when<F>(&self, other: &Cell<K, V>, combine: F)
    where
        F: Fn(&[(Cell<K, V>, Outcome<V>)]) -> Outcome<V> + Send + Sync + 'static,
    {
        let combine: CombineFn<K, V> = Arc::new(combine);
        {
            let mut guts = self.inner.guts.lock();
            if guts.completed {
                return;
            }
            guts.next_deps.insert(
                other.id(),
                DepEntry {
                    cell: other.clone(),
                    combine: Arc::clone(&combine),
                },
            );
            guts.complete_deps.insert(
                other.id(),
                DepEntry {
                    cell: other.clone(),
                    combine,
                },
            );
        }
        let completed_value = {
            let mut other_guts = other.inner.guts.lock();
            if other_guts.completed {
                Some(other_guts.value.clone())
            } else {
                other_guts.next_outs.insert(self.id(), self.clone());
                other_guts.complete_outs.insert(self.id(), self.clone());
                None
            }
        };
        match completed_value {
            // Late registration: deliver the final value through the
            // normal sequential path.
            Some(v) => self.schedule_combine(other.clone(), Outcome::Final(v)),
            None => other.trigger(),
        }
    }

    /// Enqueue a combine firing on this (dependent) cell's FIFO.
    fn schedule_combine(&self, upstream: Cell<K, V>, outcome: Outcome<V>) {
        let dependent = self.clone();
        let task: SequentialTask = Box::new(move || dependent.run_combine(upstream, outcome));
        self.inner.pool.schedule_sequential(self.id(), task);
    }

    /// Body of a sequential callback: look up the live combine for the
    /// changed upstream, run it, interpret the outcome.
    fn run_combine(&self, upstream: Cell<K, V>, outcome: Outcome<V>) {
        let is_final = outcome.is_final();
        let combine = {
            let guts = self.inner.guts.lock();
            if guts.completed {
                return;
            }
            let deps = if is_final {
                &guts.complete_deps
            } else {
                &guts.next_deps
            };
            match deps.get(&upstream.id()) {
                Some(entry) => Arc::clone(&entry.combine),
                // Edge removed since scheduling (resolver cut or re-wire).
                None => return,
            }
        };
        let result = combine(&[(upstream.clone(), outcome)]);
        if is_final {
            self.detach_upstream(upstream.id());
        }
        match result {
            Outcome::Next(v) => self.put_join(v, false),
            Outcome::Final(v) => self.put_join(v, true),
            Outcome::NoOutcome => {}
        }
    }

    /// Join `value` into the cell. The write path behind `put`/`put_final`,
    /// init outcomes, combine outcomes, and resolver assignments.
    ///
    /// Non-final: notifies dependents exactly once per strict growth;
    /// absorbed updates are silent. Final: first one wins, freezes the
    /// value, fires complete callbacks, detaches the cell everywhere, and
    /// deregisters it. Puts on a completed cell are ignored.
    pub(crate) fn put_join(&self, value: V, is_final: bool) {
        let action = {
            let mut guts = self.inner.guts.lock();
            if guts.completed {
                PutAction::Absorbed
            } else if is_final {
                let joined = guts.value.join(&value);
                guts.value = joined.clone();
                guts.completed = true;
                guts.init = None;
                guts.next_outs.clear();
                let complete_outs = std::mem::take(&mut guts.complete_outs);
                let next_deps = std::mem::take(&mut guts.next_deps);
                let complete_deps = std::mem::take(&mut guts.complete_deps);
                let mut upstreams: FxHashMap<CellId, Cell<K, V>> = FxHashMap::default();
                for (id, entry) in next_deps.into_iter().chain(complete_deps) {
                    upstreams.insert(id, entry.cell);
                }
                PutAction::Completed {
                    value: joined,
                    outs: complete_outs.into_values().collect(),
                    upstreams: upstreams.into_values().collect(),
                }
            } else {
                let joined = guts.value.join(&value);
                if joined == guts.value {
                    PutAction::Absorbed
                } else {
                    guts.value = joined.clone();
                    PutAction::Grew {
                        value: joined,
                        outs: guts.next_outs.values().cloned().collect(),
                    }
                }
            }
        };
        match action {
            PutAction::Absorbed => {}
            PutAction::Grew { value, outs } => {
                for dependent in outs {
                    dependent.schedule_combine(self.clone(), Outcome::Next(value.clone()));
                }
            }
            PutAction::Completed {
                value,
                outs,
                upstreams,
            } => {
                debug!(cell = ?self.inner.id, "completed");
                PoolStats::bump(&self.inner.pool.stats.cells_completed);
                for dependent in outs {
                    dependent.schedule_combine(self.clone(), Outcome::Final(value.clone()));
                }
                // Stop upstreams from scheduling callbacks into a frozen cell.
                for upstream in upstreams {
                    upstream.detach_dependent(self.id());
                }
                self.inner.pool.deregister_cell(self.id());
            }
        }
    }

    /// Drop this cell's dependency edges on `upstream`.
    pub(crate) fn detach_upstream(&self, upstream: CellId) {
        let mut guts = self.inner.guts.lock();
        guts.next_deps.remove(&upstream);
        guts.complete_deps.remove(&upstream);
    }

    /// Drop the outbound callback edges that notify `dependent`.
    pub(crate) fn detach_dependent(&self, dependent: CellId) {
        let mut guts = self.inner.guts.lock();
        guts.next_outs.remove(&dependent);
        guts.complete_outs.remove(&dependent);
    }

    /// Symmetric cut used by the resolver: stop `self` from notifying
    /// `other`, and drop `other`'s dependency on `self`, in one step.
    pub(crate) fn sever(&self, other: &Cell<K, V>) {
        self.detach_dependent(other.id());
        other.detach_upstream(self.id());
    }

    /// Ids of all live upstream dependencies.
    pub(crate) fn dependency_ids(&self) -> Vec<CellId> {
        let guts = self.inner.guts.lock();
        let mut ids: FxHashSet<CellId> = guts.next_deps.keys().copied().collect();
        ids.extend(guts.complete_deps.keys().copied());
        ids.into_iter().collect()
    }
}

/// Write authority over one cell. Handed out at creation and never
/// derivable from a plain [`Cell`] handle.
pub struct CellCompleter<K: Key<V>, V: Lattice> {
    cell: Cell<K, V>,
}

impl<K: Key<V>, V: Lattice> Clone for CellCompleter<K, V> {
    fn clone(&self) -> Self {
        CellCompleter {
            cell: self.cell.clone(),
        }
    }
}

impl<K: Key<V>, V: Lattice> CellCompleter<K, V> {
    pub(crate) fn new(cell: Cell<K, V>) -> Self {
        CellCompleter { cell }
    }

    /// The cell this completer writes to.
    pub fn cell(&self) -> Cell<K, V> {
        self.cell.clone()
    }

    /// Join a non-final refinement into the cell.
    pub fn put(&self, value: V) {
        self.cell.put_join(value, false);
    }

    /// Complete the cell at `join(current, value)`. First final wins;
    /// later puts of any kind are ignored.
    pub fn put_final(&self, value: V) {
        self.cell.put_join(value, true);
    }
}

impl<K: Key<V>, V: Lattice> fmt::Debug for CellCompleter<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellCompleter")
            .field("cell", &self.cell)
            .finish()
    }
}
