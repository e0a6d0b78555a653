//! Derived cells: memoized values recomputed from other cells they read.

use std::any::Any;
use std::marker::PhantomData;

use crate::error::{downcast_compute_error, ComputeError};
use crate::node::{NodeFlags, NodeId};
use crate::runtime::with_runtime;

/// A memoized reactive computation. Like [`crate::state::StateCell`], this is just a handle: the
/// cached value and the compute closure both live in the runtime's arena.
pub struct DerivedCell<T> {
    id: NodeId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for DerivedCell<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DerivedCell<T> {}

impl<T> DerivedCell<T> {
    /// Erases the value type, yielding an opaque [`crate::NodeRef`] for introspection and the
    /// low-level tracking API.
    pub fn as_node_ref(&self) -> crate::NodeRef {
        crate::NodeRef::from_id(self.id)
    }
}

/// Creates a derived cell whose value is recomputed by `compute` whenever a dependency it read
/// last time changes. The closure receives the previously cached value (`None` on the very first
/// run) and returns the new one. The new value is compared against the cached one with
/// [`PartialEq`]: if they're equal, the cell is left CLEAN and nothing downstream is notified
/// (glitch-free memoization); only a genuinely different result propagates.
///
/// For a variant with a caller-supplied equality instead of `PartialEq`, see [`derived_by`]. For a
/// variant whose compute can fail, see [`try_derived`].
#[cfg_attr(debug_assertions, track_caller)]
pub fn derived<T: PartialEq + 'static>(
    compute: impl FnMut(Option<&T>) -> T + 'static,
) -> DerivedCell<T> {
    derived_by(compute, T::eq)
}

/// Like [`derived`], but only marks dependents as changed when `compute`'s result differs from
/// the previously cached value under `eq`.
#[cfg_attr(debug_assertions, track_caller)]
pub fn derived_by<T: 'static>(
    mut compute: impl FnMut(Option<&T>) -> T + 'static,
    mut eq: impl FnMut(&T, &T) -> bool + 'static,
) -> DerivedCell<T> {
    new_derived(move |slot: &mut Option<Box<dyn Any>>| {
        let prev = slot.as_ref().and_then(|v| v.downcast_ref::<T>());
        let next = compute(prev);
        match slot.as_mut().and_then(|v| v.downcast_mut::<T>()) {
            Some(existing) if eq(&next, existing) => Ok(false),
            _ => {
                *slot = Some(Box::new(next));
                Ok(true)
            }
        }
    })
}

#[allow(clippy::type_complexity)]
fn new_derived<T: 'static>(
    compute: impl FnMut(&mut Option<Box<dyn Any>>) -> Result<bool, Box<dyn Any>> + 'static,
) -> DerivedCell<T> {
    with_runtime(|rt| {
        let owner = rt.active_scope();
        let id = rt.create_node(NodeFlags::RECOMPUTED | NodeFlags::DIRTY, Some(owner));
        rt.with_node_mut(id, |n| n.compute = Some(Box::new(compute)));
        DerivedCell {
            id,
            _marker: PhantomData,
        }
    })
}

impl<T: Clone + 'static> DerivedCell<T> {
    /// Reads the cached value, recomputing first if it is out of date. Records a dependency edge
    /// if called from within a tracked run.
    ///
    /// # Panics
    /// Panics if this cell has been disposed.
    pub fn read(&self) -> T {
        with_runtime(|rt| {
            rt.track_read(self.id);
            rt.validate(self.id)
                .unwrap_or_else(|_| unreachable!("infallible derived compute cannot error"));
            self.value(rt)
        })
    }

    /// Brings this cell up to date and returns its value without creating a dependency edge, even
    /// inside a tracked run.
    pub fn peek(&self) -> T {
        with_runtime(|rt| {
            rt.untrack(|| {
                rt.validate(self.id)
                    .unwrap_or_else(|_| unreachable!("infallible derived compute cannot error"));
                self.value(rt)
            })
        })
    }

    fn value(&self, rt: &crate::runtime::Runtime) -> T {
        rt.with_node(self.id, |n| {
            n.value.as_ref().and_then(|v| v.downcast_ref::<T>()).cloned()
        })
        .flatten()
        .expect("derived cell accessed after disposal")
    }

    pub fn has_subscribers(&self) -> bool {
        with_runtime(|rt| rt.with_node(self.id, |n| n.has_subscribers()).unwrap_or(false))
    }
}

/// A memoized computation whose `compute` can fail. A failed recompute leaves the cell DIRTY (so
/// the next read retries it) and is surfaced through [`TryDerivedCell::try_read`] instead of
/// panicking.
pub struct TryDerivedCell<T, E> {
    id: NodeId,
    _marker: PhantomData<fn() -> (T, E)>,
}

impl<T, E> Clone for TryDerivedCell<T, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, E> Copy for TryDerivedCell<T, E> {}

impl<T, E> TryDerivedCell<T, E> {
    /// Erases the value/error types, yielding an opaque [`crate::NodeRef`].
    pub fn as_node_ref(&self) -> crate::NodeRef {
        crate::NodeRef::from_id(self.id)
    }
}

/// Creates a [`TryDerivedCell`]. See [`derived`] for the infallible counterpart.
#[cfg_attr(debug_assertions, track_caller)]
pub fn try_derived<T: 'static, E: 'static>(
    mut compute: impl FnMut(Option<&T>) -> Result<T, E> + 'static,
) -> TryDerivedCell<T, E> {
    with_runtime(|rt| {
        let owner = rt.active_scope();
        let id = rt.create_node(NodeFlags::RECOMPUTED | NodeFlags::DIRTY, Some(owner));
        rt.with_node_mut(id, |n| {
            n.compute = Some(Box::new(move |slot: &mut Option<Box<dyn Any>>| {
                let prev = slot.as_ref().and_then(|v| v.downcast_ref::<T>());
                match compute(prev) {
                    Ok(next) => {
                        *slot = Some(Box::new(next));
                        Ok(true)
                    }
                    Err(err) => Err(Box::new(err) as Box<dyn Any>),
                }
            }))
        });
        TryDerivedCell {
            id,
            _marker: PhantomData,
        }
    })
}

impl<T: Clone + 'static, E: 'static> TryDerivedCell<T, E> {
    pub fn try_read(&self) -> Result<T, ComputeError<E>> {
        with_runtime(|rt| {
            rt.track_read(self.id);
            rt.validate(self.id).map_err(downcast_compute_error)?;
            Ok(self.value(rt))
        })
    }

    pub fn try_peek(&self) -> Result<T, ComputeError<E>> {
        with_runtime(|rt| {
            rt.untrack(|| {
                rt.validate(self.id).map_err(downcast_compute_error)?;
                Ok(self.value(rt))
            })
        })
    }

    fn value(&self, rt: &crate::runtime::Runtime) -> T {
        rt.with_node(self.id, |n| {
            n.value.as_ref().and_then(|v| v.downcast_ref::<T>()).cloned()
        })
        .flatten()
        .expect("derived cell accessed after disposal")
    }

    pub fn has_subscribers(&self) -> bool {
        with_runtime(|rt| rt.with_node(self.id, |n| n.has_subscribers()).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::state;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn recomputes_from_dependency() {
        let s = state(1);
        let d = derived(move |_| s.read() * 2);
        assert_eq!(d.read(), 2);
        s.write(3);
        assert_eq!(d.read(), 6);
    }

    #[test]
    fn memoized_until_dependency_changes() {
        let s = state(0);
        let runs = Rc::new(Cell::new(0));
        let runs_inner = runs.clone();
        let d = derived(move |_| {
            runs_inner.set(runs_inner.get() + 1);
            s.read()
        });
        d.read();
        d.read();
        d.read();
        assert_eq!(runs.get(), 1);
        s.write(1);
        d.read();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn diamond_dependency_runs_once() {
        let s = state(1);
        let left = derived(move |_| s.read() * 2);
        let right = derived(move |_| s.read() * 3);
        let runs = Rc::new(Cell::new(0));
        let runs_inner = runs.clone();
        let bottom = derived(move |_| {
            runs_inner.set(runs_inner.get() + 1);
            left.read() + right.read()
        });
        assert_eq!(bottom.read(), 5);
        s.write(2);
        assert_eq!(bottom.read(), 10);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn selector_suppresses_unrelated_propagation() {
        let s = state(1);
        let parity = derived(move |_| s.read() % 2 == 0);
        let runs = Rc::new(Cell::new(0));
        let runs_inner = runs.clone();
        let derived_runs = derived(move |_| {
            runs_inner.set(runs_inner.get() + 1);
            parity.read()
        });
        derived_runs.read();
        assert_eq!(runs.get(), 1);
        s.write(3); // still odd: selector value unchanged
        derived_runs.read();
        assert_eq!(runs.get(), 1);
        s.write(4); // now even: selector value changes
        derived_runs.read();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn conditional_dependency_switches() {
        let cond = state(true);
        let a = state(1);
        let b = state(10);
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
        assert_eq!(runs.get(), 1);
        b.write(20); // not tracked yet
        d.read();
        assert_eq!(runs.get(), 1);
        cond.write(false);
        d.read();
        assert_eq!(runs.get(), 2);
        a.write(2); // no longer tracked
        d.read();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn try_derived_surfaces_error_without_panicking() {
        let ok = state(true);
        let d = try_derived::<i32, String>(move |_| {
            if ok.read() {
                Ok(1)
            } else {
                Err("compute failed".to_string())
            }
        });
        assert_eq!(d.try_read().unwrap(), 1);
        ok.write(false);
        assert!(d.try_read().is_err());
    }
}
