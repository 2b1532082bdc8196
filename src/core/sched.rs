//! Per-dependent-cell FIFO. Every callback whose dependent is cell `C`
//! runs through `C`'s queue, so joins into `C` never interleave.

use std::collections::VecDeque;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::algebra::Lattice;
use crate::core::cell::{Cell, CellId};
use crate::core::key::Key;

pub(crate) type SequentialTask = Box<dyn FnOnce() + Send + 'static>;

/// What the enqueuer has to do next.
pub(crate) enum Enqueue {
    /// Queue went empty to non-empty with no drain in flight; spawn one.
    Spawn,
    /// A drain worker is active or pending and will pick this up.
    Queued,
    /// Cell already deregistered; the task was dropped and the caller
    /// must rebalance the submitted-task counter.
    Dropped,
}

struct Entry<K: Key<V>, V: Lattice> {
    cell: Cell<K, V>,
    queue: VecDeque<SequentialTask>,
    /// Set while a drain worker has claimed the head. The claim is what
    /// keeps "at most one worker per dependent cell" true across the
    /// window where the head has been popped but is still running.
    draining: bool,
}

/// The not-done cell registry plus each cell's pending callback queue.
pub(crate) struct Registry<K: Key<V>, V: Lattice> {
    entries: Mutex<FxHashMap<CellId, Entry<K, V>>>,
}

impl<K: Key<V>, V: Lattice> Registry<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    pub(crate) fn register(&self, cell: Cell<K, V>) {
        let mut entries = self.entries.lock();
        entries.entry(cell.id()).or_insert_with(|| Entry {
            cell,
            queue: VecDeque::new(),
            draining: false,
        });
    }

    /// Remove a cell. Returns the number of queued callbacks that were
    /// dropped with it; the pool owes one counter decrement per drop.
    pub(crate) fn deregister(&self, id: CellId) -> usize {
        let mut entries = self.entries.lock();
        match entries.remove(&id) {
            Some(entry) => entry.queue.len(),
            None => 0,
        }
    }

    /// Handles of all registered cells.
    pub(crate) fn snapshot(&self) -> Vec<Cell<K, V>> {
        self.entries
            .lock()
            .values()
            .map(|e| e.cell.clone())
            .collect()
    }

    pub(crate) fn enqueue(&self, id: CellId, task: SequentialTask) -> Enqueue {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.queue.push_back(task);
                if !entry.draining && entry.queue.len() == 1 {
                    Enqueue::Spawn
                } else {
                    Enqueue::Queued
                }
            }
            None => Enqueue::Dropped,
        }
    }

    /// Claim and pop the head of `id`'s queue. `None` means the cell is
    /// gone (deregistered) or the queue is empty; either way the drain
    /// worker stops.
    pub(crate) fn begin_drain(&self, id: CellId) -> Option<SequentialTask> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id)?;
        let task = entry.queue.pop_front()?;
        entry.draining = true;
        Some(task)
    }

    /// Release the drain claim. True means more callbacks arrived while
    /// the head ran and a fresh drain worker is needed.
    pub(crate) fn finish_drain(&self, id: CellId) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.draining = false;
                !entry.queue.is_empty()
            }
            None => false,
        }
    }
}
