use std::fmt;
use std::num::NonZeroU32;

/// Identifies one top-level evaluation of the engine.
///
/// The run counter only advances through [`crate::Engine::reset`]; any number
/// of [`crate::Engine::run`] invocations between two resets share the same
/// `Run` and therefore the same caches.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Run {
    counter: NonZeroU32,
}

impl Run {
    pub(crate) fn start() -> Self {
        Run {
            counter: NonZeroU32::new(1).expect("1 is not zero"),
        }
    }

    pub(crate) fn next(self) -> Self {
        Run {
            counter: NonZeroU32::new(self.counter.get() + 1).expect("run counter overflowed"),
        }
    }

    /// The numeric value of the counter, mostly useful for diagnostics.
    pub fn number(self) -> u32 {
        self.counter.get()
    }
}

impl fmt::Debug for Run {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "R{}", self.counter)
    }
}
