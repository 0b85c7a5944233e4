//! Erased values flowing through the engine.
//!
//! The engine is untyped internally: every value crossing a reagent
//! boundary is an [`Atom`], a shared erased word compared by identity.
//! The typed [`Reagent`](crate::reagent::Reagent) surface restores static
//! types at the public boundary, so a failed downcast here is a broken
//! engine invariant, not a user error.

use std::any::Any;
use std::sync::Arc;

/// An erased, shared, identity-compared value.
pub type Atom = Arc<dyn Any + Send + Sync>;

/// Box a value into an [`Atom`].
pub fn atom<T: Send + Sync + 'static>(value: T) -> Atom {
    Arc::new(value)
}

/// The unit atom, used as the input of dissolved and computed reagents.
#[must_use]
pub fn unit_atom() -> Atom {
    atom(())
}

/// Identity comparison: two atoms are the same only if they are the same
/// allocation. Structurally equal values in distinct allocations differ.
#[must_use]
pub fn same_atom(a: &Atom, b: &Atom) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Downcast an atom to its concrete type.
///
/// Panics on mismatch: the phantom-typed public API makes a mismatch
/// impossible unless an engine invariant was violated, which is fatal.
pub fn cast<T: Send + Sync + 'static>(a: Atom) -> Arc<T> {
    match a.downcast::<T>() {
        Ok(v) => v,
        Err(_) => panic!(
            "value of unexpected type reached a reagent continuation (expected {})",
            std::any::type_name::<T>()
        ),
    }
}

/// Downcast an atom and clone the value out.
pub fn cast_value<T: Clone + Send + Sync + 'static>(a: Atom) -> T {
    cast::<T>(a).as_ref().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_not_equality() {
        let a = atom(7_u32);
        let b = atom(7_u32);
        assert!(same_atom(&a, &a.clone()));
        assert!(!same_atom(&a, &b));
    }

    #[test]
    fn unit_atoms_are_distinct_allocations() {
        let a = unit_atom();
        let b = unit_atom();
        assert!(!same_atom(&a, &b));
    }

    #[test]
    fn cast_round_trip() {
        let a = atom(String::from("hi"));
        assert_eq!(cast_value::<String>(a), "hi");
    }

    #[test]
    #[should_panic(expected = "unexpected type")]
    fn cast_mismatch_is_fatal() {
        let a = atom(1_u8);
        let _ = cast::<String>(a);
    }
}
