//! The handler pool: work-stealing workers plus the two bookkeeping layers
//! that make quiescence observable, a submitted-task counter and the
//! per-cell callback queues.
//!
//! ## Counter discipline
//!
//! Every path that may run user code owns exactly one increment/decrement
//! pair: `execute`/`submit`, sequential-callback enqueue (decremented when
//! the callback leaves the queue), cell triggering, and resolver passes
//! (which ride on quiescence handlers, themselves submitted tasks). The
//! pool is quiescent iff the counter reads zero.
//!
//! ## The drain invariant
//!
//! A handler registered between "the counter would hit zero" and "somebody
//! observed zero" is never lost: both the decrement-to-zero path and
//! `on_quiescent` re-check the counter under the handler-list lock, so the
//! handler is either run directly or picked up by the drain.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::algebra::{Lattice, Outcome};
use crate::core::cell::{Cell, CellCompleter, CellId};
use crate::core::key::Key;
use crate::core::sched::{Enqueue, Registry, SequentialTask};
use crate::core::signal::Signal;
use crate::core::stats::{PoolStats, StatsSnapshot};

/// Routed every payload a pool task panicked with.
pub type PanicHandler = Box<dyn Fn(Box<dyn std::any::Any + Send>) + Send + Sync + 'static>;

type QuiescenceHandler = Box<dyn FnOnce() + Send + 'static>;

/// Pool construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Worker thread count.
    pub parallelism: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// Shared pool state. Cells hold an `Arc` to this; the public
/// [`HandlerPool`] is a cheap-clone wrapper around it.
pub(crate) struct PoolCore<K: Key<V>, V: Lattice> {
    me: Weak<PoolCore<K, V>>,
    threads: rayon::ThreadPool,
    /// In-flight pool tasks. Zero = quiescent.
    submitted: AtomicUsize,
    handlers: Mutex<Vec<QuiescenceHandler>>,
    pub(crate) registry: Registry<K, V>,
    panic_handler: PanicHandler,
    shut_down: AtomicBool,
    cell_ids: AtomicU64,
    pub(crate) stats: PoolStats,
}

impl<K: Key<V>, V: Lattice> PoolCore<K, V> {
    fn new(config: PoolConfig, panic_handler: PanicHandler) -> Arc<Self> {
        let threads = rayon::ThreadPoolBuilder::new()
            .num_threads(config.parallelism.max(1))
            .thread_name(|i| format!("coral-worker-{i}"))
            .build()
            .expect("failed to spawn worker threads");
        Arc::new_cyclic(|me| PoolCore {
            me: me.clone(),
            threads,
            submitted: AtomicUsize::new(0),
            handlers: Mutex::new(Vec::new()),
            registry: Registry::new(),
            panic_handler,
            shut_down: AtomicBool::new(false),
            cell_ids: AtomicU64::new(0),
            stats: PoolStats::new(),
        })
    }

    /// The owning `Arc`, for handing `'static` closures to workers.
    fn arc(&self) -> Arc<Self> {
        self.me.upgrade().expect("pool core outlived its Arc")
    }

    pub(crate) fn weak(&self) -> Weak<Self> {
        self.me.clone()
    }

    pub(crate) fn next_cell_id(&self) -> CellId {
        CellId(self.cell_ids.fetch_add(1, Ordering::Relaxed))
    }

    /// Submit a task with full bracketing: counter increment, panic
    /// isolation, counter decrement on every exit path.
    pub(crate) fn submit(&self, task: impl FnOnce() + Send + 'static) {
        self.submitted.fetch_add(1, Ordering::AcqRel);
        PoolStats::bump(&self.stats.tasks_submitted);
        let core = self.arc();
        self.threads.spawn(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                PoolStats::bump(&core.stats.tasks_panicked);
                (core.panic_handler)(payload);
            }
            core.task_done();
        });
    }

    /// The decrement side. Landing on zero makes this worker the drain:
    /// it takes the registered handlers and resubmits each, which briefly
    /// re-enters non-quiescence so resolver work runs before the next
    /// quiescence is observed.
    pub(crate) fn task_done(&self) {
        let prev = self.submitted.fetch_sub(1, Ordering::AcqRel);
        assert!(prev != 0, "submitted-task counter underflow");
        if prev != 1 {
            return;
        }
        let drained = {
            let mut handlers = self.handlers.lock();
            if self.submitted.load(Ordering::Acquire) != 0 {
                // Somebody submitted since we hit zero; they own the next
                // transition.
                return;
            }
            std::mem::take(&mut *handlers)
        };
        PoolStats::bump(&self.stats.quiescence_transitions);
        if !drained.is_empty() {
            trace!(handlers = drained.len(), "quiescence reached, draining handlers");
        }
        for handler in drained {
            self.submit(handler);
        }
    }

    pub(crate) fn on_quiescent(&self, handler: QuiescenceHandler) {
        let mut handlers = self.handlers.lock();
        if self.submitted.load(Ordering::Acquire) == 0 {
            drop(handlers);
            self.submit(handler);
        } else {
            handlers.push(handler);
        }
    }

    /// Enqueue a callback on `dependent`'s FIFO. Owns one inc/dec pair;
    /// the decrement lands when the callback leaves the queue, whether it
    /// ran or was dropped by deregistration.
    pub(crate) fn schedule_sequential(&self, dependent: CellId, task: SequentialTask) {
        self.submitted.fetch_add(1, Ordering::AcqRel);
        PoolStats::bump(&self.stats.tasks_submitted);
        match self.registry.enqueue(dependent, task) {
            Enqueue::Spawn => self.spawn_drain(dependent),
            Enqueue::Queued => {}
            Enqueue::Dropped => self.task_done(),
        }
    }

    fn spawn_drain(&self, dependent: CellId) {
        let core = self.arc();
        self.threads.spawn(move || core.drain_cell(dependent));
    }

    /// Run one head callback for `dependent`, then hand the queue to a
    /// fresh worker if more arrived. At most one of these is active per
    /// cell at any instant.
    fn drain_cell(&self, dependent: CellId) {
        let Some(task) = self.registry.begin_drain(dependent) else {
            return;
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            PoolStats::bump(&self.stats.tasks_panicked);
            (self.panic_handler)(payload);
        }
        self.task_done();
        if self.registry.finish_drain(dependent) {
            self.spawn_drain(dependent);
        }
    }

    pub(crate) fn register_cell(&self, cell: Cell<K, V>) {
        self.registry.register(cell);
    }

    pub(crate) fn deregister_cell(&self, id: CellId) {
        let dropped = self.registry.deregister(id);
        for _ in 0..dropped {
            self.task_done();
        }
    }

    pub(crate) fn is_quiescent(&self) -> bool {
        self.submitted.load(Ordering::Acquire) == 0
    }
}

/// The public pool handle. Cheap to clone; all clones share one pool.
pub struct HandlerPool<K: Key<V>, V: Lattice> {
    core: Arc<PoolCore<K, V>>,
}

impl<K: Key<V>, V: Lattice> Clone for HandlerPool<K, V> {
    fn clone(&self) -> Self {
        HandlerPool {
            core: Arc::clone(&self.core),
        }
    }
}

impl<K: Key<V>, V: Lattice> Default for HandlerPool<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key<V>, V: Lattice> HandlerPool<K, V> {
    /// Pool with default parallelism and a panic handler that logs.
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(config: PoolConfig) -> Self {
        Self::with_panic_handler(config, |payload| {
            error!(panic = panic_message(&payload), "pool task panicked");
        })
    }

    /// Pool with a custom handler for panics escaping init or combine
    /// callbacks. The offending task is counted complete; the panicking
    /// cell is left at its pre-callback value; everything else proceeds.
    pub fn with_panic_handler(
        config: PoolConfig,
        handler: impl Fn(Box<dyn std::any::Any + Send>) + Send + Sync + 'static,
    ) -> Self {
        HandlerPool {
            core: PoolCore::new(config, Box::new(handler)),
        }
    }

    /// Create a cell parameterised by `key` and `init`. The cell sits at
    /// bottom until triggered (directly, or transitively by a dependent's
    /// `when`); init then runs once on the pool.
    pub fn new_cell(
        &self,
        key: K,
        init: impl FnOnce(&Cell<K, V>) -> Outcome<V> + Send + 'static,
    ) -> Cell<K, V> {
        Cell::create(Arc::clone(&self.core), key, Box::new(init))
    }

    /// Like [`HandlerPool::new_cell`], but also hands back the write
    /// authority for external puts.
    pub fn new_completer(
        &self,
        key: K,
        init: impl FnOnce(&Cell<K, V>) -> Outcome<V> + Send + 'static,
    ) -> CellCompleter<K, V> {
        CellCompleter::new(self.new_cell(key, init))
    }

    /// A cell born completed at `value`.
    pub fn completed_cell(&self, value: V) -> Cell<K, V>
    where
        K: Default,
    {
        Cell::create_completed(Arc::clone(&self.core), K::default(), value)
    }

    /// Run `task` on the pool with quiescence accounting and panic
    /// isolation. Ignored after [`HandlerPool::shutdown`].
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        if self.core.shut_down.load(Ordering::Acquire) {
            debug!("execute after shutdown ignored");
            return;
        }
        self.core.submit(task);
    }

    /// Run `handler` at the next quiescence, or immediately if the pool
    /// is already quiescent.
    pub fn on_quiescent(&self, handler: impl FnOnce() + Send + 'static) {
        self.core.on_quiescent(Box::new(handler));
    }

    pub fn is_quiescent(&self) -> bool {
        self.core.is_quiescent()
    }

    /// Resolve closed dependency cycles, re-checking after each pass,
    /// until a quiescence shows none. See the crate docs for the closed
    /// SCC rule.
    pub fn quiescent_resolve_cycles(&self) -> Signal<()> {
        let (done, signal) = Signal::new();
        self.core.arm_resolve_cycles(done);
        signal
    }

    /// Apply key fallbacks to triggered-but-incomplete cells at each
    /// quiescence until none remain.
    pub fn quiescent_resolve_defaults(&self) -> Signal<()> {
        let (done, signal) = Signal::new();
        self.core.arm_resolve_defaults(done);
        signal
    }

    /// Combined policy: cycles first, then fallbacks, looped until a
    /// quiescence fires neither.
    pub fn quiescent_resolve_cell(&self) -> Signal<()> {
        let (done, signal) = Signal::new();
        self.core.arm_resolve_cell(done);
        signal
    }

    /// Deliver the registered-but-incomplete cells at the next quiescence.
    pub fn quiescent_incomplete_cells(&self) -> Signal<Vec<Cell<K, V>>> {
        let (done, signal) = Signal::new();
        self.core.arm_incomplete_cells(done);
        signal
    }

    /// Stop accepting `execute` tasks. In-flight work, sequential
    /// callbacks, and quiescence handlers for earlier submissions still
    /// run to completion. Does not block.
    pub fn shutdown(&self) {
        self.core.shut_down.store(true, Ordering::Release);
        debug!("pool shut down");
    }

    pub fn parallelism(&self) -> usize {
        self.core.threads.current_num_threads()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
