//! A fine-grained reactive dependency graph: state cells, derived (memoized) cells, effects and
//! scopes, propagated with a two-phase mark/check protocol so that a diamond-shaped dependency
//! graph recomputes each node at most once per update and a derived cell that lands back on its
//! previous value does not notify anything downstream.
//!
//! ```
//! # use reactive_core::*;
//! let count = state(1);
//! let doubled = derived(move |_| count.read() * 2);
//! assert_eq!(doubled.read(), 2);
//! count.write(21);
//! assert_eq!(doubled.read(), 42);
//! ```

#![warn(missing_docs)]

mod derived;
mod effect;
mod error;
mod node;
mod runtime;
mod scope;
mod state;

pub use derived::{derived, derived_by, try_derived, DerivedCell, TryDerivedCell};
pub use effect::{effect, try_effect, EffectHandle};
pub use error::{ComputeError, RuntimeError};
pub use scope::{effect_scope, on_cleanup, ScopeHandle};
pub use state::{state, StateCell};

use node::{NodeFlags, NodeId};
use runtime::with_runtime;

/// An opaque, type-erased reference to a node in the graph, obtained from any handle's
/// `as_node_ref` method. Used by the low-level tracking API and by debug introspection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeRef(NodeId);

impl NodeRef {
    pub(crate) fn from_id(id: NodeId) -> Self {
        NodeRef(id)
    }
}

/// Runs `f` with all signal/cell reads and writes batched: derived cells still recompute
/// immediately when read inside the batch (so reads observe up-to-date, consistent values), but
/// effects are deferred until every nested `batch` call has returned, so each effect runs at most
/// once for the whole batch rather than once per write.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    with_runtime(|rt| rt.batch(f))
}

/// Increments the batch depth. Paired with [`end_batch`]; prefer [`batch`] unless you need to
/// straddle batch boundaries across non-lexical control flow.
pub fn start_batch() {
    with_runtime(|rt| rt.start_batch())
}

/// Decrements the batch depth, flushing pending effects if it reaches zero.
///
/// # Errors
/// Returns [`RuntimeError::BatchMismatch`] if called while the batch depth is already zero.
pub fn end_batch() -> Result<(), RuntimeError> {
    with_runtime(|rt| rt.end_batch())
}

/// Runs `f` with no active subscriber, so that any cell reads inside it do not create dependency
/// edges even if `f` is itself called from within a tracked run.
pub fn untrack<R>(f: impl FnOnce() -> R) -> R {
    with_runtime(|rt| rt.untrack(f))
}

/// Low-level: replaces the current active subscriber, returning the previous one. Reads that
/// happen while a given subscriber is active link to that subscriber rather than to whatever
/// tracked run is lexically in progress. Intended for collaborator layers implementing their own
/// tracking contexts (e.g. a component-render scope); most code should prefer [`untrack`] or
/// simply reading inside a [`derived`] or [`effect`] closure.
pub fn set_active_sub(sub: Option<NodeRef>) -> Option<NodeRef> {
    with_runtime(|rt| rt.set_active_sub(sub.map(|r| r.0)).map(NodeRef::from_id))
}

/// True if `h` refers to a state cell.
pub fn is_state(h: NodeRef) -> bool {
    with_runtime(|rt| rt.flags_of(h.0).contains(NodeFlags::MUTABLE))
}

/// True if `h` refers to a derived cell.
pub fn is_derived(h: NodeRef) -> bool {
    with_runtime(|rt| rt.flags_of(h.0).contains(NodeFlags::RECOMPUTED))
}

/// True if `h` refers to an effect.
pub fn is_effect(h: NodeRef) -> bool {
    with_runtime(|rt| rt.flags_of(h.0).contains(NodeFlags::SIDE_EFFECT))
}

/// True if `h` refers to a scope.
pub fn is_scope(h: NodeRef) -> bool {
    with_runtime(|rt| rt.flags_of(h.0).contains(NodeFlags::SCOPE))
}

/// Raw flag bits for `h`. Debug-only: intended for collaborator tooling (e.g. a DevTools panel),
/// not for making runtime decisions in release builds.
#[cfg(debug_assertions)]
pub fn node_flags(h: NodeRef) -> u32 {
    with_runtime(|rt| rt.flags_of(h.0).bits())
}

/// The nodes `h` currently depends on. Debug-only; see [`node_flags`].
#[cfg(debug_assertions)]
pub fn node_deps(h: NodeRef) -> Vec<NodeRef> {
    with_runtime(|rt| rt.deps_of(h.0).into_iter().map(NodeRef::from_id).collect())
}

/// The nodes currently subscribed to `h`. Debug-only; see [`node_flags`].
#[cfg(debug_assertions)]
pub fn node_subs(h: NodeRef) -> Vec<NodeRef> {
    with_runtime(|rt| rt.subs_of(h.0).into_iter().map(NodeRef::from_id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// §8 basic scenario: a derived cell tracks a single state cell and stays in sync.
    #[test]
    fn basic_read_write_propagation() {
        let count = state(0);
        let doubled = derived(move |_| count.read() * 2);
        assert_eq!(doubled.read(), 0);
        count.write(5);
        assert_eq!(doubled.read(), 10);
    }

    /// §8 diamond scenario: a node depended on by two derived cells which both feed a third must
    /// recompute the shared bottom node exactly once per update, not twice.
    #[test]
    fn diamond_recomputes_once() {
        let root = state(1);
        let left = derived(move |_| root.read() + 1);
        let right = derived(move |_| root.read() + 2);
        let runs = Rc::new(Cell::new(0));
        let runs_inner = runs.clone();
        let bottom = derived(move |_| {
            runs_inner.set(runs_inner.get() + 1);
            left.read() + right.read()
        });
        assert_eq!(bottom.read(), 5);
        root.write(10);
        assert_eq!(bottom.read(), 23);
        assert_eq!(runs.get(), 2);
    }

    /// §8 conditional-dependency scenario: a branch not taken this run must not keep its stale
    /// edge, so writing to the untaken branch's cell does not cause a recompute.
    #[test]
    fn conditional_dependency_drops_stale_edge() {
        let cond = state(true);
        let a = state(1);
        let b = state(2);
        let runs = Rc::new(Cell::new(0));
        let runs_inner = runs.clone();
        let d = derived(move |_| {
            runs_inner.set(runs_inner.get() + 1);
            if cond.read() {
                a.read()
            } else {
                b.read()
            }
        });
        d.read();
        cond.write(false);
        d.read();
        assert_eq!(runs.get(), 2);
        a.write(100); // no longer a dependency
        d.read();
        assert_eq!(runs.get(), 2);
        b.write(200); // now the live dependency
        d.read();
        assert_eq!(runs.get(), 3);
    }

    /// §8 batch scenario: writes inside a batch run dependent effects at most once, after the
    /// batch completes, rather than once per write.
    #[test]
    fn batch_runs_effect_once() {
        let a = state(1);
        let b = state(2);
        let runs = Rc::new(Cell::new(0));
        let runs_inner = runs.clone();
        effect(move || {
            let _ = a.read() + b.read();
            runs_inner.set(runs_inner.get() + 1);
        });
        assert_eq!(runs.get(), 1);
        batch(|| {
            a.write(10);
            b.write(20);
        });
        assert_eq!(runs.get(), 2);
    }

    /// §8 nested-effects scenario: an effect that creates a nested effect runs the outer action
    /// (and thus creates the inner effect) before the inner effect's own first run completes, and
    /// re-running the outer on a later update tears down and recreates the inner effect.
    #[test]
    fn nested_effects_outer_first() {
        let trigger = state(());
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        let order_outer = order.clone();
        let order_inner = order.clone();
        effect(move || {
            trigger.read();
            order_outer.borrow_mut().push("outer");
            let order_inner = order_inner.clone();
            effect(move || {
                order_inner.borrow_mut().push("inner");
            });
        });
        assert_eq!(*order.borrow(), vec!["outer", "inner"]);
        order.borrow_mut().clear();
        trigger.trigger(());
        assert_eq!(*order.borrow(), vec!["outer", "inner"]);
    }

    /// §8 glitch-free scenario: a derived cell whose recompute lands on an equal value must not
    /// notify its own subscribers, even though one of its dependencies did genuinely change.
    #[test]
    fn glitch_free_no_op_recompute_does_not_propagate() {
        let count = state(0);
        let parity = derived(move |_| count.read() % 2);
        let runs = Rc::new(Cell::new(0));
        let runs_inner = runs.clone();
        let downstream = derived(move |_| {
            runs_inner.set(runs_inner.get() + 1);
            parity.read()
        });
        downstream.read();
        assert_eq!(runs.get(), 1);
        count.write(2); // parity unchanged (0 -> 0)
        downstream.read();
        assert_eq!(runs.get(), 1);
        count.write(3); // parity changes (0 -> 1)
        downstream.read();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn edge_symmetry_after_dependency_switch() {
        let cond = state(true);
        let a = state(1);
        let b = state(2);
        let d = derived(move |_| if cond.read() { a.read() } else { b.read() });
        d.read();
        let d_ref = d.as_node_ref();
        assert_eq!(node_deps(d_ref).len(), 2); // cond + a
        cond.write(false);
        d.read();
        assert_eq!(node_deps(d_ref).len(), 2); // cond + b
    }

    #[test]
    fn no_change_write_is_idempotent() {
        let s = state(7);
        let runs = Rc::new(Cell::new(0));
        let runs_inner = runs.clone();
        effect(move || {
            s.read();
            runs_inner.set(runs_inner.get() + 1);
        });
        assert_eq!(runs.get(), 1);
        s.write(7);
        s.write(7);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn disposed_scope_cleans_up_everything_it_owns() {
        let alive = state(true);
        let scope = effect_scope(move || {
            let alive = alive;
            on_cleanup(move || alive.write(false));
        });
        assert!(alive.read());
        scope.stop();
        assert!(!alive.read());
    }

    #[test]
    fn peek_is_pure_and_does_not_create_caller_dependency() {
        let s = state(3);
        let d = derived(move |_| s.read() * 2);
        assert_eq!(d.peek(), 6);
        assert_eq!(d.peek(), 6); // repeat peeks are stable and do not panic or double count

        let runs = Rc::new(Cell::new(0));
        let runs_inner = runs.clone();
        effect(move || {
            d.peek(); // must not subscribe this effect to d
            runs_inner.set(runs_inner.get() + 1);
        });
        assert_eq!(runs.get(), 1);
        s.write(4);
        assert_eq!(runs.get(), 1); // unchanged: the effect never tracked d
    }

    /// A write must not flush effects until the mark phase has visited every subscriber of the
    /// write, not just the first one reached. Otherwise an effect at the bottom of a diamond can
    /// observe one branch refreshed and the other still stale.
    #[test]
    fn diamond_into_effect_sees_both_branches_updated() {
        let s = state(1);
        let l = derived(move |_| s.read() * 2);
        let r = derived(move |_| s.read() * 3);
        let d = derived(move |_| l.read() + r.read());
        let seen = Rc::new(Cell::new(0));
        let seen_inner = seen.clone();
        effect(move || seen_inner.set(d.read()));
        assert_eq!(seen.get(), 5);
        s.write(2);
        assert_eq!(seen.get(), 10);
    }

    #[test]
    fn type_test_predicates() {
        let s = state(1);
        let d = derived(move |_| s.read());
        let e = effect(move || {
            d.read();
        });
        let sc = effect_scope(|| {});
        assert!(is_state(s.as_node_ref()));
        assert!(is_derived(d.as_node_ref()));
        assert!(is_effect(e.as_node_ref()));
        assert!(is_scope(sc.as_node_ref()));
        assert!(!is_state(d.as_node_ref()));
    }
}
