#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

//! Memograph is a crate for incremental recomputation. It turns a dynamic
//! graph of named, keyed computations into a persistent, self-maintaining
//! cache: as you re-run after changing inputs, it re-executes only the calls
//! whose transitive dependencies actually changed, and an output-equality
//! *cutoff* stops change propagation early.
//!
//! The moving parts:
//!
//! - [`Engine`] owns the cell stores, the monotonic run counter, the
//!   cycle-detection DAG, and the perf counters.
//! - [`Function`] describes one memoized function: a name, an input type
//!   with equality and hashing, a body producing a [`Task`], and an optional
//!   cutoff predicate.
//! - [`Context::exec`] demands a call. The engine locates the unique cell
//!   for `(function, input)`, proves the cached result current if it can
//!   (phase 1, *restore*), and runs the body otherwise (phase 2, *compute*),
//!   recording every dependency the body demands.
//! - [`Invalidation`] values mark cells, whole functions, or everything for
//!   recomputation; they are applied by [`Engine::reset`], which advances
//!   the run counter.
//!
//! Bodies run as cooperative single-threaded tasks: fork with [`join`],
//! yield with [`yield_now`], and lift external cooperative work with
//! [`from_fiber`]. Errors are first-class: reproducible failures are cached
//! across runs exactly like values, while failures wrapped in
//! [`NonReproducible`] expire at every run boundary.

mod cell;
mod dag;
mod engine;
mod function;
mod invalidation;
mod perf;
mod poly;
mod runs;
mod slot;
mod stack;
mod store;
mod task;

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;
use thiserror::Error;

pub use crate::cell::CellId;
pub use crate::engine::{Context, Engine};
pub use crate::function::{Cell, Function, FunctionBuilder};
pub use crate::invalidation::Invalidation;
pub use crate::perf::{PerfCounters, PerfReport};
pub use crate::poly::Poly;
pub use crate::runs::Run;
pub use crate::stack::Frame;
pub use crate::task::{collect_errors, from_fiber, join, join_unit, yield_now, Task};

/// The boxed error type bodies raise.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Wrapper for failures that must not be cached across runs.
///
/// A body that fails with `NonReproducible(inner)` surfaces `inner` to its
/// dependents like any other failure, but the cached result expires at the
/// next run boundary and the body re-runs when demanded again.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct NonReproducible(
    /// The wrapped failure.
    pub BoxedError,
);

/// The error returned when a demand closes a dependency cycle.
#[derive(Clone, Debug)]
pub struct CycleError {
    path: Vec<Frame>,
}

impl CycleError {
    pub(crate) fn new(path: Vec<Frame>) -> Self {
        CycleError { path }
    }

    /// The frames on the cycle, caller-first (matching the call stack).
    pub fn path(&self) -> &[Frame] {
        &self.path
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dependency cycle detected")?;
        for frame in &self.path {
            write!(f, "\n  {:?}", frame)?;
        }
        Ok(())
    }
}

impl std::error::Error for CycleError {}

/// One cached failure: what was raised, where, and whether it reproduces.
#[derive(Clone, Debug)]
pub struct MemoError {
    inner: Arc<ErrorRepr>,
}

#[derive(Clone, Debug)]
struct ErrorRepr {
    origin: Option<CellId>,
    stack: Vec<Frame>,
    kind: ErrorKind,
}

#[derive(Clone)]
enum ErrorKind {
    Cycle(CycleError),
    Failed {
        error: Arc<dyn std::error::Error + Send + Sync>,
        reproducible: bool,
    },
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Cycle(cycle) => f.debug_tuple("Cycle").field(cycle).finish(),
            ErrorKind::Failed {
                error,
                reproducible,
            } => f
                .debug_struct("Failed")
                .field("error", error)
                .field("reproducible", reproducible)
                .finish(),
        }
    }
}

impl MemoError {
    pub(crate) fn raised(err: BoxedError) -> MemoError {
        let (error, reproducible): (Arc<dyn std::error::Error + Send + Sync>, bool) =
            match err.downcast::<NonReproducible>() {
                Ok(wrapped) => (Arc::from(wrapped.0), false),
                Err(err) => (Arc::from(err), true),
            };
        MemoError {
            inner: Arc::new(ErrorRepr {
                origin: None,
                stack: Vec::new(),
                kind: ErrorKind::Failed {
                    error,
                    reproducible,
                },
            }),
        }
    }

    pub(crate) fn from_cycle(cycle: CycleError, origin: Option<CellId>) -> MemoError {
        let stack = cycle.path().to_vec();
        MemoError {
            inner: Arc::new(ErrorRepr {
                origin,
                stack,
                kind: ErrorKind::Cycle(cycle),
            }),
        }
    }

    pub(crate) fn stamped(&self, origin: CellId, stack: &[Frame]) -> MemoError {
        if self.inner.origin.is_some() {
            return self.clone();
        }
        MemoError {
            inner: Arc::new(ErrorRepr {
                origin: Some(origin),
                stack: stack.to_vec(),
                kind: self.inner.kind.clone(),
            }),
        }
    }

    pub(crate) fn identity(&self, other: &MemoError) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The cycle payload, if this error is a cycle.
    pub fn cycle(&self) -> Option<&CycleError> {
        match &self.inner.kind {
            ErrorKind::Cycle(cycle) => Some(cycle),
            ErrorKind::Failed { .. } => None,
        }
    }

    /// The raised error, if this is a body failure.
    pub fn failure(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match &self.inner.kind {
            ErrorKind::Failed { error, .. } => Some(error.as_ref()),
            ErrorKind::Cycle(_) => None,
        }
    }

    /// False only for failures raised through [`NonReproducible`].
    pub fn is_reproducible(&self) -> bool {
        match &self.inner.kind {
            ErrorKind::Cycle(_) => true,
            ErrorKind::Failed { reproducible, .. } => *reproducible,
        }
    }

    /// The call stack active when the failure was cached, innermost first.
    pub fn stack(&self) -> &[Frame] {
        &self.inner.stack
    }

    /// The cell whose computation produced this error.
    pub fn origin_cell(&self) -> Option<CellId> {
        self.inner.origin
    }
}

impl fmt::Display for MemoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.kind {
            ErrorKind::Cycle(cycle) => write!(f, "{}", cycle),
            ErrorKind::Failed { error, .. } => write!(f, "{}", error),
        }
    }
}

impl std::error::Error for MemoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.inner.kind {
            ErrorKind::Cycle(cycle) => Some(cycle),
            ErrorKind::Failed { error, .. } => Some(&**error),
        }
    }
}

/// An ordered set of [`MemoError`]s, deduplicated by identity.
///
/// This is the error side of every [`Task`]: a fork-and-join whose children
/// both fail resolves to the union of their errors, and the *same* failure
/// observed through several dependents of one failed cell is kept once.
#[derive(Clone, Debug)]
pub struct Errors {
    set: SmallVec<[MemoError; 1]>,
}

impl Errors {
    /// Raises a fresh failure from a body.
    ///
    /// Wrap the payload in [`NonReproducible`] to keep it from being cached
    /// across runs.
    pub fn raise(err: impl Into<BoxedError>) -> Errors {
        Errors::of(MemoError::raised(err.into()))
    }

    pub(crate) fn of(err: MemoError) -> Errors {
        let mut set = SmallVec::new();
        set.push(err);
        Errors { set }
    }

    /// Merges `other` into `self`, keeping each distinct error once.
    pub fn union(&mut self, other: Errors) {
        for err in other.set {
            if !self.set.iter().any(|e| e.identity(&err)) {
                self.set.push(err);
            }
        }
    }

    /// The errors, in the order they were first observed.
    pub fn iter(&self) -> impl Iterator<Item = &MemoError> {
        self.set.iter()
    }

    /// Number of distinct errors.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// True if the set holds no errors.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Consumes the set.
    pub fn into_vec(self) -> Vec<MemoError> {
        self.set.into_vec()
    }

    pub(crate) fn stamped(self, origin: CellId, stack: Vec<Frame>) -> Errors {
        Errors {
            set: self
                .set
                .iter()
                .map(|err| err.stamped(origin, &stack))
                .collect(),
        }
    }
}

impl From<MemoError> for Errors {
    fn from(err: MemoError) -> Errors {
        Errors::of(err)
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.set.len() {
            1 => write!(f, "{}", self.set[0]),
            n => {
                write!(f, "{} errors:", n)?;
                for err in &self.set {
                    write!(f, "\n  {}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for Errors {}
