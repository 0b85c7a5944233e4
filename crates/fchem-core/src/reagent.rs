//! The reagent contract and the invocation driver.
//!
//! [`Reactant`] is the erased dispatch trait the closed combinator family
//! implements; [`Reagent`] is the phantom-typed public handle. The driver
//! (`react`) wraps the lock-free attempt in the outer protocol: back-off,
//! waiter allocation, parking, and abort-or-answer.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::atom::{atom, cast_value, unit_atom, Atom};
use crate::backoff::Backoff;
use crate::combinators;
use crate::error::ChemError;
use crate::metrics;
use crate::offer::{AbortResult, Offer};
use crate::reaction::Reaction;

/// Result of one reaction attempt: an answer, or a backtrack command.
///
/// `Retry` means a transient conflict: re-attempt after back-off. `Block`
/// means no partner is available: the attempt published its offer and the
/// caller should park.
pub enum Outcome {
    Completed(Atom),
    Retry,
    Block,
}

impl Outcome {
    #[must_use]
    pub fn is_backtrack(&self) -> bool {
        matches!(self, Self::Retry | Self::Block)
    }
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed(_) => write!(f, "Completed(..)"),
            Self::Retry => write!(f, "Retry"),
            Self::Block => write!(f, "Block"),
        }
    }
}

/// The erased reagent contract.
///
/// Implementations must not mutate shared state except through the reaction
/// log (tentative) or a leaf CAS short-circuit sanctioned by
/// [`Reaction::can_cas_immediate`]. An attempt that publishes `offer` into a
/// pool must leave it discoverable and cooperatively removable via
/// [`Offer::is_deleted`] polling. Success means the continuation chain
/// reached the terminal commit; commitment never happens earlier.
pub trait Reactant: Send + Sync {
    fn try_react(&self, a: Atom, rx: Reaction, offer: Option<&Arc<Offer>>) -> Outcome;

    /// Rebuild this reagent with `next` sequenced after it. Implementations
    /// return `self` unchanged when `next` is the terminal commit.
    fn compose(self: Arc<Self>, next: Arc<dyn Reactant>) -> Arc<dyn Reactant>;

    /// True if this reagent cannot fail for protocol reasons.
    fn always_commits(&self) -> bool {
        false
    }

    /// True if this reagent may rendezvous and therefore needs a waiter
    /// registered even on the first contested attempt.
    fn may_sync(&self) -> bool {
        false
    }

    /// Cheap advisory probe: does a partner appear ready for input `a`?
    /// False positives waste a spin; false negatives are allowed.
    fn snoop(&self, _a: &Atom) -> bool {
        false
    }

    /// True only for the terminal commit node.
    fn is_commit(&self) -> bool {
        false
    }

    /// Structural view used by choice-over-choice composition.
    fn as_choice(&self) -> Option<(&Arc<dyn Reactant>, &Arc<dyn Reactant>)> {
        None
    }
}

/// A composable concurrent action from `A` to `B`.
pub struct Reagent<A, B> {
    core: Arc<dyn Reactant>,
    _types: PhantomData<fn(A) -> B>,
}

impl<A, B> Clone for Reagent<A, B> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _types: PhantomData,
        }
    }
}

impl<A, B> std::fmt::Debug for Reagent<A, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reagent")
            .field("always_commits", &self.core.always_commits())
            .field("may_sync", &self.core.may_sync())
            .finish_non_exhaustive()
    }
}

impl<A, B> Reagent<A, B> {
    /// Wrap an erased node. This is the extension point for new primitive
    /// reagents (shared cells, channels); the caller vouches that the node
    /// consumes `A` atoms and answers `B` atoms.
    #[must_use]
    pub fn from_core(core: Arc<dyn Reactant>) -> Self {
        Self {
            core,
            _types: PhantomData,
        }
    }

    /// The erased node.
    #[must_use]
    pub fn core(&self) -> &Arc<dyn Reactant> {
        &self.core
    }

    /// Consume the handle, keeping the erased node.
    #[must_use]
    pub fn into_core(self) -> Arc<dyn Reactant> {
        self.core
    }

    #[must_use]
    pub fn always_commits(&self) -> bool {
        self.core.always_commits()
    }

    #[must_use]
    pub fn may_sync(&self) -> bool {
        self.core.may_sync()
    }

    /// Sequential composition (`>=>`).
    #[must_use]
    pub fn then<C>(self, next: Reagent<B, C>) -> Reagent<A, C> {
        Reagent::from_core(self.core.compose(next.core))
    }

    /// Named form of [`Reagent::then`].
    #[must_use]
    pub fn compose<C>(self, next: Reagent<B, C>) -> Reagent<A, C> {
        self.then(next)
    }

    /// Left-biased choice (`<+>`).
    #[must_use]
    pub fn or(self, other: Reagent<A, B>) -> Reagent<A, B> {
        combinators::choice(self, other)
    }
}

impl<A, B> Reagent<A, B>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    /// Advisory readiness probe for input `a`.
    #[must_use]
    pub fn snoop(&self, a: A) -> bool {
        self.core.snoop(&atom(a))
    }

    /// Map the answer through a total function.
    #[must_use]
    pub fn map<C>(self, f: impl Fn(B) -> C + Send + Sync + 'static) -> Reagent<A, C>
    where
        B: Clone,
        C: Send + Sync + 'static,
    {
        self.then(combinators::lift_total(move |b| Some(f(b))))
    }

    /// Keep only answers satisfying `p`; otherwise the attempt blocks.
    #[must_use]
    pub fn with_filter(self, p: impl Fn(&B) -> bool + Send + Sync + 'static) -> Reagent<A, B>
    where
        B: Clone,
    {
        self.then(combinators::lift(move |b| if p(&b) { Some(b) } else { None }))
    }

    /// Partial map: `None` blocks the attempt.
    #[must_use]
    pub fn map_filter<C>(
        self,
        f: impl Fn(B) -> Option<C> + Send + Sync + 'static,
    ) -> Reagent<A, C>
    where
        B: Clone,
        C: Send + Sync + 'static,
    {
        self.then(combinators::lift(f))
    }

    /// Monadic composition through a dynamically computed continuation.
    #[must_use]
    pub fn flat_map<C>(
        self,
        f: impl Fn(B) -> Reagent<(), C> + Send + Sync + 'static,
    ) -> Reagent<A, C>
    where
        B: Clone,
        C: Send + Sync + 'static,
    {
        self.then(combinators::computed(f))
    }

    /// Sequence, discarding this reagent's answer (`>>`).
    #[must_use]
    pub fn seq<C>(self, next: Reagent<(), C>) -> Reagent<A, C>
    where
        B: Clone,
        C: Send + Sync + 'static,
    {
        self.map(|_| ()).then(next)
    }

    /// Invoke the reagent, blocking until it produces an answer (`!`).
    pub fn react(&self, a: A) -> B
    where
        B: Clone,
    {
        let input: Atom = atom(a);

        // Uncontended fast path.
        match self.core.try_react(input.clone(), Reaction::inert(), None) {
            Outcome::Completed(v) => return cast_value::<B>(v),
            Outcome::Retry | Outcome::Block => {}
        }

        let mut backoff = Backoff::new();
        backoff.once(); // priming tick
        let mut should_block = false;

        loop {
            let wait = self.core.may_sync() || should_block;
            let offer = if wait {
                Some(Offer::waiter(should_block))
            } else {
                None
            };

            let outcome = self
                .core
                .try_react(input.clone(), Reaction::inert(), offer.as_ref());
            if let Outcome::Completed(v) = outcome {
                return cast_value::<B>(v);
            }
            let blocked = matches!(outcome, Outcome::Block);

            match &offer {
                Some(o) => {
                    if blocked && o.blocking() {
                        // Only a blocking waiter may park: its partner is the
                        // one obligated to register the unpark.
                        metrics::record_park();
                        tracing::trace!(target: "fchem.driver", "parking on waiter");
                        o.park_while_active();
                    } else if !blocked {
                        backoff.once_if(|| o.is_active() && !self.core.snoop(&input));
                    }
                    if let AbortResult::Answered(ans) = o.try_abort() {
                        return cast_value::<B>(ans);
                    }
                    should_block = blocked;
                }
                None => {
                    if blocked {
                        should_block = true;
                    } else {
                        backoff.once();
                        should_block = false;
                    }
                }
            }
        }
    }

    /// One non-blocking attempt (`!?`): any backtrack is "no answer".
    pub fn attempt(&self, a: A) -> Option<B>
    where
        B: Clone,
    {
        match self.core.try_react(atom(a), Reaction::inert(), None) {
            Outcome::Completed(v) => Some(cast_value::<B>(v)),
            Outcome::Retry | Outcome::Block => None,
        }
    }
}

impl<B> Reagent<(), B> {
    /// Install this reagent as a background catalyst.
    pub fn dissolve(&self) -> Result<(), ChemError> {
        dissolve_core(self.core.clone())
    }
}

/// Install a reagent as a background catalyst: it reacts whenever partners
/// become available and is reinstated after every firing.
pub fn dissolve<B>(reagent: &Reagent<(), B>) -> Result<(), ChemError> {
    reagent.dissolve()
}

/// Erased dissolve, shared with catalyst reinstatement. A well-formed
/// catalyst publishes its offer into pools and parks, so anything but
/// `Block` is a broken reagent.
pub(crate) fn dissolve_core(core: Arc<dyn Reactant>) -> Result<(), ChemError> {
    let offer = Offer::catalyst(core.clone());
    match core.try_react(unit_atom(), Reaction::inert(), Some(&offer)) {
        Outcome::Block => {
            tracing::debug!(target: "fchem.driver", "catalyst dissolved");
            Ok(())
        }
        other => {
            tracing::warn!(target: "fchem.driver", outcome = ?other, "malformed catalyst");
            Err(ChemError::MalformedCatalyst)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinators::{lift, never, ret};

    #[test]
    fn react_on_pure_reagents() {
        assert_eq!(ret::<(), _>(42_u32).react(()), 42);
        assert_eq!(
            lift(|x: i32| (x > 0).then_some(x * 2)).react(3),
            6
        );
    }

    #[test]
    fn attempt_returns_none_on_block() {
        let doubler = lift(|x: i32| (x > 0).then_some(x * 2));
        assert_eq!(doubler.attempt(-1), None);
        assert_eq!(doubler.attempt(3), Some(6));
    }

    #[test]
    fn attempt_returns_none_on_retry() {
        struct AlwaysRetry;
        impl Reactant for AlwaysRetry {
            fn try_react(&self, _a: Atom, _rx: Reaction, _o: Option<&Arc<Offer>>) -> Outcome {
                Outcome::Retry
            }
            fn compose(self: Arc<Self>, _next: Arc<dyn Reactant>) -> Arc<dyn Reactant> {
                self
            }
        }
        let r: Reagent<(), ()> = Reagent::from_core(Arc::new(AlwaysRetry));
        assert_eq!(r.attempt(()), None);
    }

    #[test]
    fn never_attempt_is_no_answer() {
        assert_eq!(never::<(), u8>().attempt(()), None);
    }

    #[test]
    fn dissolve_rejects_a_reagent_that_completes() {
        struct Rogue;
        impl Reactant for Rogue {
            fn try_react(&self, a: Atom, _rx: Reaction, _o: Option<&Arc<Offer>>) -> Outcome {
                Outcome::Completed(a)
            }
            fn compose(self: Arc<Self>, _next: Arc<dyn Reactant>) -> Arc<dyn Reactant> {
                self
            }
        }
        let r: Reagent<(), ()> = Reagent::from_core(Arc::new(Rogue));
        assert_eq!(r.dissolve(), Err(ChemError::MalformedCatalyst));
    }

    #[test]
    fn flag_surface() {
        let r = ret::<(), _>(1_u8);
        assert!(r.always_commits());
        assert!(!r.may_sync());
        assert!(r.snoop(()));

        let l = lift(|x: u8| Some(x));
        assert!(!l.always_commits()); // partial lifts make no commit promise
    }
}
