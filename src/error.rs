//! Error taxonomy for the reactive runtime.
//!
//! Mirrors the teacher crate's hand-rolled `ScopeDestroyedError`: manual `Display` and
//! `std::error::Error` implementations rather than pulling in an error-derive crate, since the
//! taxonomy here is small and fixed.

use std::any::Any;
use std::error::Error;
use std::fmt;

/// Failure modes that originate in the engine itself, as opposed to in user-supplied compute
/// closures (see [`ComputeError`]).
#[derive(Debug)]
pub enum RuntimeError {
    /// A handle referred to a node that has already been disposed. Detected via the slot map's
    /// generation counter rather than left as undefined behavior.
    Disposed,
    /// `end_batch` was called while the batch depth was already zero.
    BatchMismatch,
    /// A node was re-entered while already computing itself (a direct cycle through its own
    /// `compute`/action). The engine terminates the re-entrant call rather than recursing forever
    /// or panicking; this variant exists for collaborator layers that want to surface the
    /// occurrence explicitly rather than relying on the `trace` feature's diagnostics alone. The
    /// runtime itself never returns this from `read`/`write`/`batch` — see `Runtime::recompute`
    /// and `Runtime::refresh`, which absorb the cycle and report `Ok(false)` so a self-referential
    /// effect or derived cell simply stops recursing instead of aborting the whole graph.
    CycleDetected,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Disposed => write!(f, "reactive node has already been disposed"),
            RuntimeError::BatchMismatch => {
                write!(f, "end_batch called with no matching start_batch")
            }
            RuntimeError::CycleDetected => {
                write!(f, "cyclic reactive read: a node was re-entered while already computing")
            }
        }
    }
}

impl Error for RuntimeError {}

/// An error raised by a user-supplied `compute` or `action` closure, surfaced at the caller that
/// triggered the run (the invoker of `read`, `write`, `batch` or an effect flush), after the
/// engine has restored its own invariants (tracking cursor closed, stale edges unlinked, flags
/// cleared).
pub struct ComputeError<E> {
    inner: E,
}

impl<E> ComputeError<E> {
    pub(crate) fn new(inner: E) -> Self {
        ComputeError { inner }
    }

    /// Unwrap the underlying user error.
    pub fn into_inner(self) -> E {
        self.inner
    }
}

impl<E: fmt::Debug> fmt::Debug for ComputeError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ComputeError").field(&self.inner).finish()
    }
}

impl<E: fmt::Display> fmt::Display for ComputeError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reactive compute failed: {}", self.inner)
    }
}

impl<E: fmt::Debug + fmt::Display> Error for ComputeError<E> {}

/// Downcasts a type-erased compute failure (as stored on [`crate::node::Node::compute`]) back to
/// the caller's concrete error type.
pub(crate) fn downcast_compute_error<E: 'static>(err: Box<dyn Any>) -> ComputeError<E> {
    match err.downcast::<E>() {
        Ok(err) => ComputeError::new(*err),
        Err(_) => panic!("reactive compute error type mismatch"),
    }
}
