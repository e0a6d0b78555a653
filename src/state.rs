//! State cells: the leaves of the graph, written to directly rather than recomputed.

use std::any::Any;
use std::marker::PhantomData;

use crate::error::RuntimeError;
use crate::node::{NodeFlags, NodeId};
use crate::runtime::with_runtime;

/// A mutable reactive cell. Cloning a `StateCell` is cheap: it is just a handle (a [`NodeId`])
/// into the current thread's runtime, not the value itself.
pub struct StateCell<T> {
    id: NodeId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for StateCell<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StateCell<T> {}

impl<T> StateCell<T> {
    /// Erases the value type, yielding an opaque [`crate::NodeRef`] for introspection and the
    /// low-level tracking API.
    pub fn as_node_ref(&self) -> crate::NodeRef {
        crate::NodeRef::from_id(self.id)
    }
}

/// Creates a new state cell seeded with `initial`, owned by the currently active scope.
pub fn state<T: 'static>(initial: T) -> StateCell<T> {
    with_runtime(|rt| {
        let owner = rt.active_scope();
        let id = rt.create_node(NodeFlags::MUTABLE, Some(owner));
        rt.with_node_mut(id, |n| n.value = Some(Box::new(initial)));
        StateCell {
            id,
            _marker: PhantomData,
        }
    })
}

impl<T: Clone + 'static> StateCell<T> {
    /// Reads the current value, recording a dependency edge if called from within a tracked run
    /// (a derived cell's compute or an effect's action).
    ///
    /// # Panics
    /// Panics if this cell has been disposed. Use [`StateCell::try_read`] to handle that case.
    pub fn read(&self) -> T {
        self.try_read().expect("state cell accessed after disposal")
    }

    pub fn try_read(&self) -> Result<T, RuntimeError> {
        with_runtime(|rt| {
            if !rt.is_alive(self.id) {
                return Err(RuntimeError::Disposed);
            }
            rt.track_read(self.id);
            let value = rt
                .with_node(self.id, |n| {
                    n.value.as_ref().and_then(|v| v.downcast_ref::<T>()).cloned()
                })
                .flatten()
                .expect("state cell value missing or of the wrong type");
            Ok(value)
        })
    }

    /// Reads the current value without creating a dependency edge, even inside a tracked run.
    pub fn peek(&self) -> T {
        with_runtime(|rt| {
            rt.untrack(|| {
                rt.with_node(self.id, |n| {
                    n.value.as_ref().and_then(|v| v.downcast_ref::<T>()).cloned()
                })
                .flatten()
                .expect("state cell accessed after disposal")
            })
        })
    }

    pub fn has_subscribers(&self) -> bool {
        with_runtime(|rt| rt.with_node(self.id, |n| n.has_subscribers()).unwrap_or(false))
    }
}

impl<T: PartialEq + 'static> StateCell<T> {
    /// Stores `new_value`. A no-op (propagation-wise) if it equals the previously stored value;
    /// see [`StateCell::trigger`] to force propagation regardless.
    pub fn write(&self, new_value: T) {
        with_runtime(|rt| {
            if !rt.is_alive(self.id) {
                return;
            }
            let changed = rt
                .with_node_mut(self.id, |n| {
                    let unchanged = n
                        .value
                        .as_ref()
                        .and_then(|v| v.downcast_ref::<T>())
                        .is_some_and(|old| *old == new_value);
                    if !unchanged {
                        n.value = Some(Box::new(new_value) as Box<dyn Any>);
                    }
                    !unchanged
                })
                .unwrap_or(false);
            if changed {
                rt.bump_version(self.id);
                rt.propagate_write(self.id);
            }
        })
    }
}

impl<T: 'static> StateCell<T> {
    /// Stores `new_value` and propagates unconditionally, even if it compares equal to the
    /// previous value. Useful for types with expensive or meaningless equality.
    pub fn trigger(&self, new_value: T) {
        with_runtime(|rt| {
            if !rt.is_alive(self.id) {
                return;
            }
            rt.with_node_mut(self.id, |n| {
                n.value = Some(Box::new(new_value) as Box<dyn Any>);
            });
            rt.bump_version(self.id);
            rt.propagate_write(self.id);
        })
    }
}

#[cfg(feature = "serde")]
impl<T: serde::Serialize + Clone + 'static> serde::Serialize for StateCell<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.peek().serialize(serializer)
    }
}

#[cfg(feature = "serde")]
impl<'de, T: serde::Deserialize<'de> + 'static> serde::Deserialize<'de> for StateCell<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(state(T::deserialize(deserializer)?))
    }
}
