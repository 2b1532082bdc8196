//! Value algebra. Join = LUB, monotone refinement, tagged outcomes.

pub mod lattice;
pub mod outcome;

pub use lattice::{BitSet64, GSet, Lattice, MaxU64, MinU64};
pub use outcome::Outcome;
