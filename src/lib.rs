//! # Coral
//!
//! A reactive concurrent dataflow engine: values that depend on other
//! concurrently computed values, each drawn from a lattice and refined
//! monotonically until a fixed point.
//!
//! ## Core Philosophy
//!
//! Correctness comes from the algebra, not from scheduling. Every cell
//! value only moves up its lattice, joins commute, and no-op updates are
//! silent, so any interleaving of callbacks converges to the same answer.
//! Cycles in the dependency graph are not errors; they are detected at
//! quiescence and finished by policy.
//!
//! ## Primary API Surface
//!
//! - [`HandlerPool`] - Work-stealing workers, quiescence detection, cell registry
//! - [`Cell`] - A monotonically refined lattice value with dependency wiring
//! - [`CellCompleter`] - Write authority for external puts
//! - [`Outcome`] - What an init or combine contributed: `Next` / `Final` / `NoOutcome`
//! - [`Lattice`] - Join-semilattice contract over cell values
//! - [`Key`] - Cycle-resolution and fallback policy carrier
//!
//! ## Execution Model
//!
//! Cells are lazy: creating one does nothing until it is triggered,
//! directly or because a dependent registered [`Cell::when`]. Init runs
//! once on the pool; combine callbacks for the same dependent run one at
//! a time in FIFO order; callbacks across different dependents run in
//! parallel. When the pool goes quiescent, `quiescent_resolve_cycles`
//! finishes closed dependency cycles via [`Key::resolve`] and
//! `quiescent_resolve_defaults` finishes stragglers via [`Key::fallback`].
//!
//! ## Example
//!
//! ```rust
//! use coral::prelude::*;
//!
//! let pool: HandlerPool<DefaultKey, MaxU64> = HandlerPool::new();
//!
//! let a = pool.new_cell(DefaultKey, |_| Outcome::Final(MaxU64(5)));
//! let b = pool.new_cell(DefaultKey, {
//!     let a = a.clone();
//!     move |cell| {
//!         cell.when(&a, |deps| match &deps[0].1 {
//!             Outcome::Next(v) => Outcome::Next(MaxU64(v.0 + 1)),
//!             Outcome::Final(v) => Outcome::Final(MaxU64(v.0 + 1)),
//!             Outcome::NoOutcome => Outcome::NoOutcome,
//!         });
//!         Outcome::NoOutcome
//!     }
//! });
//!
//! b.trigger();
//! pool.quiescent_resolve_cell().wait();
//!
//! assert_eq!(a.value(), MaxU64(5));
//! assert_eq!(b.value(), MaxU64(6));
//! assert!(b.is_completed());
//! ```

pub mod algebra;
pub mod core;
pub mod keys;

/// Prelude for convenient imports of primary API types.
pub mod prelude {
    pub use crate::algebra::{BitSet64, GSet, Lattice, MaxU64, MinU64, Outcome};
    pub use crate::core::{
        Cell, CellCompleter, CellId, HandlerPool, Key, Phase, PoolConfig, Signal, StatsSnapshot,
    };
    pub use crate::keys::{ConstKey, DefaultKey};
}

// Re-export primary types at crate root for convenience.
pub use algebra::{BitSet64, GSet, Lattice, MaxU64, MinU64, Outcome};
pub use core::{
    Cell, CellCompleter, CellId, HandlerPool, Key, Phase, PoolConfig, Signal, StatsSnapshot,
};
pub use keys::{ConstKey, DefaultKey};
