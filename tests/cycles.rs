//! Cycle Resolution Tests: Closed SCCs, Fallbacks, and the Combined Policy
//!
//! A dependency graph with cycles quiesces without completing; these tests
//! drive the resolver over self-loops, two-cell cycles, rings, and open
//! components, with both the default and custom key policies.

use std::time::Duration;

use coral::prelude::*;

const SETTLE: Duration = Duration::from_secs(10);

fn bitset_pool() -> HandlerPool<DefaultKey, BitSet64> {
    HandlerPool::with_config(PoolConfig { parallelism: 4 })
}

fn nat_pool() -> HandlerPool<DefaultKey, MaxU64> {
    HandlerPool::with_config(PoolConfig { parallelism: 4 })
}

/// Forward the upstream value as a non-final refinement.
fn forward(deps: &[(Cell<DefaultKey, BitSet64>, Outcome<BitSet64>)]) -> Outcome<BitSet64> {
    match &deps[0].1 {
        Outcome::Next(v) | Outcome::Final(v) => Outcome::Next(*v),
        Outcome::NoOutcome => Outcome::NoOutcome,
    }
}

fn inc(deps: &[(Cell<DefaultKey, MaxU64>, Outcome<MaxU64>)]) -> Outcome<MaxU64> {
    match &deps[0].1 {
        Outcome::Next(v) => Outcome::Next(MaxU64(v.0 + 1)),
        Outcome::Final(v) => Outcome::Final(MaxU64(v.0 + 1)),
        Outcome::NoOutcome => Outcome::NoOutcome,
    }
}

// ============================================================================
// Two-Cell Cycles
// ============================================================================

#[test]
fn test_two_cell_cycle_resolves_at_current_value() {
    let p = bitset_pool();
    let a = p.new_cell(DefaultKey, |_| Outcome::NoOutcome);
    let b = p.new_cell(DefaultKey, |_| Outcome::NoOutcome);
    a.when(&b, forward);
    b.when(&a, forward);

    p.quiescent_resolve_cycles()
        .wait_timeout(SETTLE)
        .expect("cycle resolution should settle");

    assert!(a.is_completed() && b.is_completed());
    assert_eq!(a.value(), BitSet64::empty(), "default key freezes at current value");
    assert_eq!(b.value(), BitSet64::empty());
}

/// Key whose cycle policy assigns `{x}` to every member.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct MarkKey;

impl Key<BitSet64> for MarkKey {
    fn resolve(&self, cells: &[Cell<Self, BitSet64>]) -> Vec<(Cell<Self, BitSet64>, BitSet64)> {
        cells
            .iter()
            .map(|c| (c.clone(), BitSet64::singleton(0)))
            .collect()
    }
}

#[test]
fn test_cycle_with_custom_resolve_policy() {
    let p: HandlerPool<MarkKey, BitSet64> =
        HandlerPool::with_config(PoolConfig { parallelism: 4 });
    let a = p.new_cell(MarkKey, |_| Outcome::NoOutcome);
    let b = p.new_cell(MarkKey, |_| Outcome::NoOutcome);
    a.when(&b, |deps| match &deps[0].1 {
        Outcome::Next(v) | Outcome::Final(v) => Outcome::Next(*v),
        Outcome::NoOutcome => Outcome::NoOutcome,
    });
    b.when(&a, |deps| match &deps[0].1 {
        Outcome::Next(v) | Outcome::Final(v) => Outcome::Next(*v),
        Outcome::NoOutcome => Outcome::NoOutcome,
    });

    p.quiescent_resolve_cycles()
        .wait_timeout(SETTLE)
        .expect("cycle resolution should settle");

    assert_eq!(a.value(), BitSet64::singleton(0));
    assert_eq!(b.value(), BitSet64::singleton(0));
    assert!(a.is_completed() && b.is_completed());
}

// ============================================================================
// Self-Loops and Rings
// ============================================================================

#[test]
fn test_self_loop_is_a_trivial_closed_cycle() {
    let p = bitset_pool();
    let a = p.new_cell(DefaultKey, |_| Outcome::NoOutcome);
    a.when(&a, forward);

    p.quiescent_resolve_cycles()
        .wait_timeout(SETTLE)
        .expect("self-loop should resolve");

    assert!(a.is_completed());
    assert_eq!(a.value(), BitSet64::empty());
}

#[test]
fn test_ring_resolves_as_one_component() {
    let p = nat_pool();
    let cells: Vec<_> = (0..5)
        .map(|_| p.new_cell(DefaultKey, |_| Outcome::NoOutcome))
        .collect();
    for i in 0..cells.len() {
        let next = &cells[(i + 1) % cells.len()];
        cells[i].when(next, |deps| match &deps[0].1 {
            Outcome::Next(v) | Outcome::Final(v) => Outcome::Next(*v),
            Outcome::NoOutcome => Outcome::NoOutcome,
        });
    }

    p.quiescent_resolve_cycles()
        .wait_timeout(SETTLE)
        .expect("ring should resolve");

    for cell in &cells {
        assert!(cell.is_completed());
    }
    assert_eq!(p.stats().cycles_resolved, 1, "a ring is a single SCC");
}

// ============================================================================
// Open Components and Downstream Dependents
// ============================================================================

#[test]
fn test_open_scc_is_not_resolved_by_cycles_alone() {
    let p = nat_pool();
    let x = p.new_cell(DefaultKey, |_| Outcome::NoOutcome);
    let a = p.new_cell(DefaultKey, |_| Outcome::NoOutcome);
    let b = p.new_cell(DefaultKey, |_| Outcome::NoOutcome);
    a.when(&b, inc);
    b.when(&a, inc);
    // The cycle leans on x, which is incomplete and acyclic: not closed.
    a.when(&x, inc);

    p.quiescent_resolve_cycles()
        .wait_timeout(SETTLE)
        .expect("resolution should settle without touching the open SCC");

    assert!(!a.is_completed(), "open SCC must survive a cycles-only pass");
    assert!(!b.is_completed());
    assert!(!x.is_completed());
    assert_eq!(p.stats().cycles_resolved, 0);
}

#[test]
fn test_downstream_dependent_sees_resolved_cycle() {
    let p = nat_pool();
    let a = p.new_cell(DefaultKey, |_| Outcome::NoOutcome);
    let b = p.new_cell(DefaultKey, |_| Outcome::NoOutcome);
    a.when(&b, inc);
    b.when(&a, inc);
    let d = p.new_cell(DefaultKey, {
        let a = a.clone();
        move |cell| {
            cell.when(&a, inc);
            Outcome::NoOutcome
        }
    });
    d.trigger();

    p.quiescent_resolve_cycles()
        .wait_timeout(SETTLE)
        .expect("cycle resolution should settle");

    assert!(a.is_completed() && b.is_completed());
    assert!(
        d.is_completed(),
        "resolving the cycle must still notify dependents outside it"
    );
    assert_eq!(d.value(), MaxU64(a.value().0 + 1));
}

// ============================================================================
// Fallbacks and the Combined Policy
// ============================================================================

#[test]
fn test_fallback_completes_triggered_stragglers() {
    let p = nat_pool();
    let a = p.new_cell(DefaultKey, |_| Outcome::NoOutcome);
    a.trigger();

    p.quiescent_resolve_defaults()
        .wait_timeout(SETTLE)
        .expect("defaults should settle");

    assert!(a.is_completed(), "triggered no-dep cell falls back at bottom");
    assert_eq!(a.value(), MaxU64(0));
}

#[test]
fn test_fallback_skips_untriggered_cells() {
    let p = nat_pool();
    let a = p.new_cell(DefaultKey, |_| Outcome::NoOutcome);

    p.quiescent_resolve_defaults()
        .wait_timeout(SETTLE)
        .expect("defaults should settle");

    assert_eq!(
        a.phase(),
        Phase::Pending,
        "a never-triggered cell is not the fallback's business"
    );
}

#[test]
fn test_combined_policy_cycles_then_defaults() {
    let p = nat_pool();
    let a = p.new_cell(DefaultKey, |_| Outcome::NoOutcome);
    let b = p.new_cell(DefaultKey, |_| Outcome::NoOutcome);
    a.when(&b, inc);
    b.when(&a, inc);
    let c = p.new_cell(DefaultKey, |_| Outcome::NoOutcome);
    c.trigger();

    p.quiescent_resolve_cell()
        .wait_timeout(SETTLE)
        .expect("combined policy should settle");

    assert!(a.is_completed() && b.is_completed() && c.is_completed());
    let stats = p.stats();
    assert_eq!(stats.cycles_resolved, 1);
    assert!(stats.fallbacks_applied >= 1);
}

#[test]
fn test_combined_policy_finishes_open_sccs_via_fallback() {
    let p = nat_pool();
    let x = p.new_cell(DefaultKey, |_| Outcome::NoOutcome);
    let a = p.new_cell(DefaultKey, |_| Outcome::NoOutcome);
    let b = p.new_cell(DefaultKey, |_| Outcome::NoOutcome);
    a.when(&b, inc);
    b.when(&a, inc);
    a.when(&x, inc);

    p.quiescent_resolve_cell()
        .wait_timeout(SETTLE)
        .expect("combined policy should settle");

    assert!(a.is_completed() && b.is_completed() && x.is_completed());
}

#[test]
fn test_resolution_is_idempotent() {
    let p = nat_pool();
    let a = p.new_cell(DefaultKey, |_| Outcome::NoOutcome);
    let b = p.new_cell(DefaultKey, |_| Outcome::NoOutcome);
    a.when(&b, inc);
    b.when(&a, inc);

    p.quiescent_resolve_cycles()
        .wait_timeout(SETTLE)
        .expect("first resolution should settle");
    let resolved_once = p.stats().cycles_resolved;
    let value_once = a.value();

    p.quiescent_resolve_cycles()
        .wait_timeout(SETTLE)
        .expect("second resolution should settle immediately");

    assert_eq!(p.stats().cycles_resolved, resolved_once);
    assert_eq!(a.value(), value_once);
}
