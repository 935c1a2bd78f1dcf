use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A dynamically typed input for functions that accept several underlying
/// input types.
///
/// Each payload carries its `TypeId` as a witness into `Eq` and `Hash`, so
/// values of distinct types never collide in a single cell store even when
/// their hashes agree: the store effectively keys on `(type-id, payload)`.
#[derive(Clone)]
pub struct Poly {
    payload: Arc<dyn PolyPayload>,
}

impl Poly {
    /// Wraps `value` with its type witness.
    pub fn new<T>(value: T) -> Poly
    where
        T: Any + fmt::Debug + Eq + Hash,
    {
        Poly {
            payload: Arc::new(value),
        }
    }

    /// Returns the payload if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.as_any().downcast_ref::<T>()
    }

    /// The type witness of the payload.
    pub fn type_id(&self) -> TypeId {
        self.payload.as_any().type_id()
    }
}

trait PolyPayload: Any {
    fn as_any(&self) -> &dyn Any;
    fn eq_dyn(&self, other: &dyn PolyPayload) -> bool;
    fn hash_dyn(&self, state: &mut dyn Hasher);
    fn debug_dyn(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl<T> PolyPayload for T
where
    T: Any + fmt::Debug + Eq + Hash,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_dyn(&self, other: &dyn PolyPayload) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .map_or(false, |other| self == other)
    }

    fn hash_dyn(&self, mut state: &mut dyn Hasher) {
        TypeId::of::<T>().hash(&mut state);
        self.hash(&mut state);
    }

    fn debug_dyn(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{:?}", self)
    }
}

impl PartialEq for Poly {
    fn eq(&self, other: &Self) -> bool {
        self.payload.eq_dyn(other.payload.as_ref())
    }
}

impl Eq for Poly {}

impl Hash for Poly {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.payload.hash_dyn(state);
    }
}

impl fmt::Debug for Poly {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.payload.debug_dyn(fmt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(p: &Poly) -> u64 {
        let mut hasher = DefaultHasher::new();
        p.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn same_payload_same_type_is_equal() {
        assert_eq!(Poly::new(42u32), Poly::new(42u32));
        assert_eq!(hash_of(&Poly::new(42u32)), hash_of(&Poly::new(42u32)));
    }

    #[test]
    fn distinct_types_never_collide() {
        assert_ne!(Poly::new(1u32), Poly::new(1u64));
        assert_ne!(Poly::new(String::from("1")), Poly::new(1u32));
        assert_ne!(hash_of(&Poly::new(1u32)), hash_of(&Poly::new(1u64)));
    }

    #[test]
    fn downcast_recovers_the_payload() {
        let p = Poly::new(String::from("abc"));
        assert_eq!(p.downcast_ref::<String>().map(String::as_str), Some("abc"));
        assert!(p.downcast_ref::<u32>().is_none());
    }
}
