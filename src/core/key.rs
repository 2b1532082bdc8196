//! The key contract. A key decides what happens to cells the dataflow
//! alone cannot finish: members of closed dependency cycles, and cells
//! still incomplete at final quiescence.

use crate::algebra::Lattice;
use crate::core::cell::Cell;

/// Per-cell policy carrier.
///
/// Both methods return terminal assignments; the resolver applies each
/// entry as a final put. The default bodies freeze every cell at its
/// current value, which is the right call whenever the lattice value
/// reached by pure propagation is already the answer.
pub trait Key<V: Lattice>: Send + Sync + Sized + 'static {
    /// Invoked on the members of a detected closed cycle.
    fn resolve(&self, cells: &[Cell<Self, V>]) -> Vec<(Cell<Self, V>, V)> {
        cells.iter().map(|c| (c.clone(), c.value())).collect()
    }

    /// Invoked at final quiescence for triggered cells that never completed.
    fn fallback(&self, cells: &[Cell<Self, V>]) -> Vec<(Cell<Self, V>, V)> {
        cells.iter().map(|c| (c.clone(), c.value())).collect()
    }
}
