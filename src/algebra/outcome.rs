//! What an init or combine callback contributed this firing.

/// Tagged result of a cell computation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<V> {
    /// A non-final refinement; the value is joined into the cell.
    Next(V),
    /// The cell's terminal answer; no further refinements accepted.
    Final(V),
    /// Nothing to contribute this time.
    NoOutcome,
}

impl<V> Outcome<V> {
    /// Wrap a value with an explicit finality flag.
    #[inline]
    pub fn from_value(value: V, is_final: bool) -> Self {
        if is_final {
            Outcome::Final(value)
        } else {
            Outcome::Next(value)
        }
    }

    #[inline]
    pub const fn is_final(&self) -> bool {
        matches!(self, Outcome::Final(_))
    }

    #[inline]
    pub const fn is_no_outcome(&self) -> bool {
        matches!(self, Outcome::NoOutcome)
    }

    /// The carried value, if any.
    #[inline]
    pub const fn value(&self) -> Option<&V> {
        match self {
            Outcome::Next(v) | Outcome::Final(v) => Some(v),
            Outcome::NoOutcome => None,
        }
    }

    #[inline]
    pub fn into_value(self) -> Option<V> {
        match self {
            Outcome::Next(v) | Outcome::Final(v) => Some(v),
            Outcome::NoOutcome => None,
        }
    }

    /// Map the carried value, preserving the tag.
    pub fn map<U, F: FnOnce(V) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Outcome::Next(v) => Outcome::Next(f(v)),
            Outcome::Final(v) => Outcome::Final(f(v)),
            Outcome::NoOutcome => Outcome::NoOutcome,
        }
    }
}
