//! Effects: side-effecting actions that re-run when a cell they read changes.

use std::any::Any;

use crate::error::ComputeError;
use crate::node::{NodeFlags, NodeId};
use crate::runtime::with_runtime;

/// A handle to a running effect. Dropping this handle does *not* stop the effect — effects are
/// owned by the scope they were created in, just like derived cells and nested scopes, and are
/// torn down when that scope is disposed. Use [`EffectHandle::stop`] to stop one early.
#[derive(Clone, Copy)]
pub struct EffectHandle {
    id: NodeId,
}

impl EffectHandle {
    /// Stops this effect immediately: runs its cleanups, disposes anything it created, and
    /// unlinks it from the graph. Idempotent.
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

/// Creates an effect: runs `action` once immediately, then again every time a cell it read during
/// its last run has genuinely changed. Dependencies are recomputed fresh on every run, so an
/// effect that conditionally reads different cells tracks only the ones from its most recent run.
///
/// Runs at most once per batch, after every state write inside the batch has been applied.
#[cfg_attr(debug_assertions, track_caller)]
pub fn effect(mut action: impl FnMut() + 'static) -> EffectHandle {
    new_effect(move |_: &mut Option<Box<dyn Any>>| {
        action();
        Ok(true)
    })
}

/// Like [`effect`], but `action` can fail. A failed run is surfaced through
/// [`crate::runtime::with_runtime`]'s flush diagnostics (via the `trace` feature) rather than
/// panicking, and the effect retries on the next flush.
#[cfg_attr(debug_assertions, track_caller)]
pub fn try_effect<E: 'static>(mut action: impl FnMut() -> Result<(), E> + 'static) -> EffectHandle {
    new_effect(move |_: &mut Option<Box<dyn Any>>| match action() {
        Ok(()) => Ok(true),
        Err(err) => Err(Box::new(ComputeError::new(err)) as Box<dyn Any>),
    })
}

#[allow(clippy::type_complexity)]
fn new_effect(
    action: impl FnMut(&mut Option<Box<dyn Any>>) -> Result<bool, Box<dyn Any>> + 'static,
) -> EffectHandle {
    with_runtime(|rt| {
        let owner = rt.active_scope();
        let id = rt.create_node(NodeFlags::SIDE_EFFECT, Some(owner));
        rt.with_node_mut(id, |n| n.compute = Some(Box::new(action)));
        // First run happens immediately and eagerly, outside the propagation queue, mirroring
        // the teacher's eager first evaluation of a memo/effect at creation time.
        let _ = rt.recompute(id);
        EffectHandle { id }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::effect_scope;
    use crate::state::state;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn runs_once_immediately() {
        let s = state(0);
        let seen = Rc::new(Cell::new(-1));
        let seen_inner = seen.clone();
        effect(move || seen_inner.set(s.read()));
        assert_eq!(seen.get(), 0);
    }

    #[test]
    fn reruns_on_change() {
        let s = state(0);
        let double = state(-1);
        effect(move || double.write(s.read() * 2));
        assert_eq!(double.read(), 0);
        s.write(1);
        assert_eq!(double.read(), 2);
        s.write(2);
        assert_eq!(double.read(), 4);
    }

    #[test]
    fn nested_effects_outer_runs_first() {
        let trigger = state(());
        let outer = Rc::new(Cell::new(0));
        let inner = Rc::new(Cell::new(0));
        let outer_inner_handle = inner.clone();
        let outer_outer_handle = outer.clone();
        effect(move || {
            trigger.read();
            outer_outer_handle.set(outer_outer_handle.get() + 1);
            let inner_handle = outer_inner_handle.clone();
            effect(move || {
                inner_handle.set(inner_handle.get() + 1);
            });
        });
        assert_eq!(outer.get(), 1);
        assert_eq!(inner.get(), 1);
        trigger.trigger(());
        assert_eq!(outer.get(), 2);
        assert_eq!(inner.get(), 2);
    }

    #[test]
    fn stopped_effect_does_not_rerun() {
        let s = state(0);
        let runs = Rc::new(Cell::new(0));
        let runs_inner = runs.clone();
        let handle = effect(move || {
            s.read();
            runs_inner.set(runs_inner.get() + 1);
        });
        assert_eq!(runs.get(), 1);
        handle.stop();
        s.write(1);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn disposing_scope_stops_its_effects() {
        let counter = state(0);
        let trigger = state(());
        let scope = effect_scope(move || {
            effect(move || {
                trigger.read();
                counter.write(counter.peek() + 1);
            });
        });
        assert_eq!(counter.read(), 1);
        trigger.trigger(());
        assert_eq!(counter.read(), 2);
        scope.stop();
        trigger.trigger(());
        assert_eq!(counter.read(), 2);
    }
}
