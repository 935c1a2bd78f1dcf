use std::any::Any;
use std::fmt;

use crate::engine::Engine;
use crate::runs::Run;

/// An integer that uniquely identifies one cell within an [`Engine`].
///
/// Dependency edges are expressed in terms of these ids and live in maps on
/// the engine side, never as owning references between cells.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellId(pub(crate) u64);

impl fmt::Debug for CellId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "c{}", self.0)
    }
}

/// Identifies a registered function within an [`Engine`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) struct FunctionId(pub(crate) u32);

/// Outcome of asking a cell to prove its cached result current (phase 1).
pub(crate) enum Restore {
    /// The cached result (value or reproducible error) is valid for the
    /// current run; `changed_at` is the run in which it last changed.
    Valid { changed_at: Run },
    /// The cached result could not be proven current. The cell remembers the
    /// failed attempt and will recompute when demanded.
    Invalid,
}

/// Object-safe view of a cell, independent of its input/output types.
///
/// The typed state machine lives in [`crate::slot::Slot`]; this trait is what
/// recorded dependency lists, stack frames, and the introspection API see.
pub(crate) trait AnyCell: Any {
    fn id(&self) -> CellId;

    fn function_id(&self) -> FunctionId;

    /// Name of the function this cell belongs to.
    fn name(&self) -> &str;

    /// Debug rendering of the input, for diagnostics and cycle reports.
    fn input_debug(&self) -> String;

    fn as_any(&self) -> &dyn Any;

    /// Phase 1 of the per-run protocol. Never executes a body, never blocks.
    fn restore(&self, engine: &Engine, run: Run) -> Restore;

    /// Marks the cached result as out of date. Applied at run boundaries.
    fn mark_invalidated(&self);

    /// Drops the cached result entirely (`clear_caches`).
    fn clear_memo(&self);

    /// True if the cell has ever completed (successfully or not).
    fn has_completed(&self) -> bool;

    /// The dependencies recorded by the last compute, if any.
    fn recorded_deps(&self) -> Option<Vec<(CellId, Run)>>;
}
