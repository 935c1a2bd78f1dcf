use std::fmt;
use std::sync::Arc;

use crate::cell::{CellId, FunctionId};

/// A composable description of what to drop from the caches at the next run
/// boundary.
///
/// Invalidations are inert values; nothing happens until one is handed to
/// [`crate::Engine::reset`]. `combine` is associative and commutative, and
/// [`Invalidation::empty`] is its identity.
#[derive(Clone)]
pub struct Invalidation {
    kind: Kind,
    reason: Option<Arc<str>>,
}

#[derive(Clone)]
pub(crate) enum Kind {
    Empty,
    Cell(CellId),
    Function(FunctionId),
    ClearCaches,
    Many(Vec<Invalidation>),
}

impl Invalidation {
    /// The no-op invalidation.
    pub fn empty() -> Self {
        Invalidation {
            kind: Kind::Empty,
            reason: None,
        }
    }

    /// Drops every cell's cached result and resets the cycle detector.
    pub fn clear_caches() -> Self {
        Invalidation {
            kind: Kind::ClearCaches,
            reason: None,
        }
    }

    pub(crate) fn cell(id: CellId) -> Self {
        Invalidation {
            kind: Kind::Cell(id),
            reason: None,
        }
    }

    pub(crate) fn function(id: FunctionId) -> Self {
        Invalidation {
            kind: Kind::Function(id),
            reason: None,
        }
    }

    /// Attaches a human-readable reason, shown by the `Debug` rendering.
    /// Reasons are purely diagnostic.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(Arc::from(reason.into()));
        self
    }

    /// The union of two invalidations.
    pub fn combine(self, other: Invalidation) -> Invalidation {
        match (&self.kind, &other.kind) {
            (Kind::Empty, _) => other,
            (_, Kind::Empty) => self,
            _ => Invalidation {
                kind: Kind::Many(vec![self, other]),
                reason: None,
            },
        }
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.kind
    }
}

impl fmt::Debug for Invalidation {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Empty => write!(fmt, "empty")?,
            Kind::Cell(id) => write!(fmt, "cell({:?})", id)?,
            Kind::Function(id) => write!(fmt, "function(f{})", id.0)?,
            Kind::ClearCaches => write!(fmt, "clear_caches")?,
            Kind::Many(parts) => {
                let mut list = fmt.debug_list();
                for part in parts {
                    list.entry(part);
                }
                list.finish()?;
            }
        }
        if let Some(reason) = &self.reason {
            write!(fmt, " ({})", reason)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_the_combine_identity() {
        let inv = Invalidation::empty().combine(Invalidation::clear_caches());
        assert!(matches!(inv.kind(), Kind::ClearCaches));
        let inv = Invalidation::clear_caches().combine(Invalidation::empty());
        assert!(matches!(inv.kind(), Kind::ClearCaches));
    }

    #[test]
    fn reasons_render_in_debug() {
        let inv = Invalidation::clear_caches().with_reason("config changed");
        assert_eq!(format!("{:?}", inv), "clear_caches (config changed)");
    }
}
