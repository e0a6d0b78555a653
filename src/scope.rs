//! Scopes: own the effects and nested scopes created while they're active, and tear them all
//! down together.

use crate::node::{NodeFlags, NodeId};
use crate::runtime::with_runtime;

/// A handle to a scope created by [`effect_scope`]. Dropping the handle does not dispose the
/// scope; call [`ScopeHandle::stop`] explicitly, the same way effects are stopped.
#[derive(Clone, Copy)]
pub struct ScopeHandle {
    id: NodeId,
}

impl ScopeHandle {
    /// Disposes everything created inside this scope: its effects, derived cells, state cells and
    /// any nested scopes, running their cleanups in the process. Idempotent.
    pub fn stop(&self) {
        with_runtime(|rt| rt.dispose(self.id));
    }

    pub fn is_alive(&self) -> bool {
        with_runtime(|rt| rt.is_alive(self.id))
    }

    /// Erases to an opaque [`crate::NodeRef`] for introspection.
    pub fn as_node_ref(&self) -> crate::NodeRef {
        crate::NodeRef::from_id(self.id)
    }
}

/// Runs `setup` with a fresh child scope active, so that every cell, effect and nested scope it
/// creates is owned by (and disposed together with) the returned handle.
#[cfg_attr(debug_assertions, track_caller)]
pub fn effect_scope(setup: impl FnOnce() + 'static) -> ScopeHandle {
    with_runtime(|rt| {
        let parent = rt.active_scope();
        let id = rt.create_node(NodeFlags::SCOPE, Some(parent));
        rt.run_in_scope(id, setup);
        ScopeHandle { id }
    })
}

/// Registers `cleanup` to run when the currently active scope (or the owning effect/derived cell,
/// if one is recomputing) is disposed or re-run. Cleanups run untracked and in reverse
/// registration order is not guaranteed; they are independent by construction.
pub fn on_cleanup(cleanup: impl FnOnce() + 'static) {
    with_runtime(|rt| {
        let owner = rt.current_tracker().unwrap_or_else(|| rt.active_scope());
        rt.with_node_mut(owner, |n| n.cleanups.push(Box::new(cleanup)));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derived::derived;
    use crate::effect::effect;
    use crate::state::state;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn cleanup_runs_on_dispose() {
        let called = Rc::new(Cell::new(false));
        let called_inner = called.clone();
        let scope = effect_scope(move || {
            on_cleanup(move || called_inner.set(true));
        });
        assert!(!called.get());
        scope.stop();
        assert!(called.get());
    }

    #[test]
    fn disposing_scope_stops_nested_derived() {
        let counter = state(0);
        let trigger = state(());
        let scope = effect_scope(move || {
            let d = derived(move |_| {
                trigger.read();
                counter.peek() + 1
            });
            effect(move || {
                let n = d.read();
                counter.write(n);
            });
        });
        assert_eq!(counter.read(), 1);
        trigger.trigger(());
        assert_eq!(counter.read(), 2);
        scope.stop();
        trigger.trigger(());
        assert_eq!(counter.read(), 2);
    }

    #[test]
    fn effect_cleanup_runs_before_each_rerun() {
        let trigger = state(0);
        let cleanups = Rc::new(Cell::new(0));
        let cleanups_inner = cleanups.clone();
        effect(move || {
            trigger.read();
            let c = cleanups_inner.clone();
            on_cleanup(move || c.set(c.get() + 1));
        });
        assert_eq!(cleanups.get(), 0);
        trigger.write(1);
        assert_eq!(cleanups.get(), 1);
        trigger.write(2);
        assert_eq!(cleanups.get(), 2);
    }
}
