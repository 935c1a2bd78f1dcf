use std::fmt;
use std::sync::Arc;

use crate::cell::{AnyCell, CellId};
use crate::function::Function;

/// One link of the persistent call stack threaded through [`crate::Context`].
///
/// Each `exec` that reaches phase 2 pushes a node; sibling tasks forked from
/// the same parent share the parent chain without seeing each other's frames.
pub(crate) struct FrameNode {
    pub(crate) cell: Arc<dyn AnyCell>,
    pub(crate) parent: Option<Arc<FrameNode>>,
}

impl FrameNode {
    /// Collects the stack innermost-first, starting from `top`.
    pub(crate) fn unwind(top: &Option<Arc<FrameNode>>) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut cursor = top.as_ref();
        while let Some(node) = cursor {
            frames.push(Frame {
                cell: node.cell.clone(),
            });
            cursor = node.parent.as_ref();
        }
        frames
    }
}

/// A single frame of the active call stack: one memoized call in flight.
#[derive(Clone)]
pub struct Frame {
    pub(crate) cell: Arc<dyn AnyCell>,
}

impl Frame {
    /// Name of the function this frame belongs to.
    pub fn name(&self) -> &str {
        self.cell.name()
    }

    /// Debug rendering of the call's input.
    pub fn input_debug(&self) -> String {
        self.cell.input_debug()
    }

    /// The id of the underlying cell.
    pub fn cell_id(&self) -> CellId {
        self.cell.id()
    }

    /// If this frame is a call of `f`, returns a clone of its input.
    pub fn as_instance_of<I, O>(&self, f: &Function<I, O>) -> Option<I>
    where
        I: Clone + fmt::Debug + Eq + std::hash::Hash + 'static,
        O: Clone + fmt::Debug + 'static,
    {
        if self.cell.function_id() != f.id() {
            return None;
        }
        self.cell
            .as_any()
            .downcast_ref::<crate::slot::Slot<I, O>>()
            .map(|slot| slot.input().clone())
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.cell.id() == other.cell.id()
    }
}

impl Eq for Frame {}

impl fmt::Debug for Frame {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}({})", self.cell.name(), self.cell.input_debug())
    }
}
