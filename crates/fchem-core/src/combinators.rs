//! The closed combinator family.
//!
//! Every chain ends in the terminal `Commit` node; sequential composition
//! threads a new continuation through each node, and composing with the
//! terminal commit is the identity. Leaves outside this crate (shared
//! cells, channel endpoints) plug in through [`Reactant`] and reuse
//! [`Consume`] to fold a discovered offer into their reaction.

use std::sync::Arc;

use crate::atom::{atom, cast_value, unit_atom, Atom};
use crate::offer::{AbortResult, Offer};
use crate::reaction::Reaction;
use crate::reagent::{Outcome, Reactant, Reagent};

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

struct Commit;

impl Reactant for Commit {
    fn try_react(&self, a: Atom, rx: Reaction, offer: Option<&Arc<Offer>>) -> Outcome {
        match offer {
            None => {
                if rx.try_commit() {
                    Outcome::Completed(a)
                } else {
                    Outcome::Retry
                }
            }
            Some(o) if o.is_waiter() => match o.try_abort() {
                // A partner satisfied us while we were attempting: their
                // answer wins and our reaction is abandoned uncommitted.
                AbortResult::Answered(ans) => Outcome::Completed(ans),
                AbortResult::Aborted | AbortResult::AlreadyAborted => {
                    if rx.try_commit() {
                        Outcome::Completed(a)
                    } else {
                        Outcome::Retry
                    }
                }
            },
            Some(_) => {
                // Catalytic firing: the commit's effect is the effect, and
                // there is no caller to yield a value to.
                let _ = rx.try_commit();
                Outcome::Block
            }
        }
    }

    fn compose(self: Arc<Self>, next: Arc<dyn Reactant>) -> Arc<dyn Reactant> {
        if next.is_commit() {
            self
        } else {
            next
        }
    }

    fn always_commits(&self) -> bool {
        true
    }

    fn snoop(&self, _a: &Atom) -> bool {
        true
    }

    fn is_commit(&self) -> bool {
        true
    }
}

pub(crate) fn commit_core() -> Arc<dyn Reactant> {
    Arc::new(Commit)
}

// ---------------------------------------------------------------------------
// Ret
// ---------------------------------------------------------------------------

struct Ret {
    value: Atom,
    k: Arc<dyn Reactant>,
}

impl Reactant for Ret {
    fn try_react(&self, _a: Atom, rx: Reaction, offer: Option<&Arc<Offer>>) -> Outcome {
        self.k.try_react(self.value.clone(), rx, offer)
    }

    fn compose(self: Arc<Self>, next: Arc<dyn Reactant>) -> Arc<dyn Reactant> {
        if next.is_commit() {
            return self;
        }
        Arc::new(Ret {
            value: self.value.clone(),
            k: self.k.clone().compose(next),
        })
    }

    fn always_commits(&self) -> bool {
        self.k.always_commits()
    }

    fn may_sync(&self) -> bool {
        self.k.may_sync()
    }

    fn snoop(&self, _a: &Atom) -> bool {
        self.k.snoop(&self.value)
    }
}

// ---------------------------------------------------------------------------
// Lift
// ---------------------------------------------------------------------------

struct Lift {
    f: Arc<dyn Fn(Atom) -> Option<Atom> + Send + Sync>,
    /// Set only by constructors that can prove the function total; partial
    /// lifts make no commit promise.
    total: bool,
    k: Arc<dyn Reactant>,
}

impl Reactant for Lift {
    fn try_react(&self, a: Atom, rx: Reaction, offer: Option<&Arc<Offer>>) -> Outcome {
        match (self.f)(a) {
            Some(b) => self.k.try_react(b, rx, offer),
            None => Outcome::Block,
        }
    }

    fn compose(self: Arc<Self>, next: Arc<dyn Reactant>) -> Arc<dyn Reactant> {
        if next.is_commit() {
            return self;
        }
        Arc::new(Lift {
            f: Arc::clone(&self.f),
            total: self.total,
            k: self.k.clone().compose(next),
        })
    }

    fn always_commits(&self) -> bool {
        self.total && self.k.always_commits()
    }

    fn may_sync(&self) -> bool {
        self.k.may_sync()
    }

    fn snoop(&self, a: &Atom) -> bool {
        (self.f)(a.clone()).is_some_and(|b| self.k.snoop(&b))
    }
}

// ---------------------------------------------------------------------------
// Computed
// ---------------------------------------------------------------------------

struct Computed {
    f: Arc<dyn Fn(Atom) -> Arc<dyn Reactant> + Send + Sync>,
    k: Arc<dyn Reactant>,
}

impl Reactant for Computed {
    fn try_react(&self, a: Atom, rx: Reaction, offer: Option<&Arc<Offer>>) -> Outcome {
        // The continuation is injected into the freshly computed reagent so
        // its own terminal commit is replaced, not run early.
        (self.f)(a)
            .compose(self.k.clone())
            .try_react(unit_atom(), rx, offer)
    }

    fn compose(self: Arc<Self>, next: Arc<dyn Reactant>) -> Arc<dyn Reactant> {
        if next.is_commit() {
            return self;
        }
        Arc::new(Computed {
            f: Arc::clone(&self.f),
            k: self.k.clone().compose(next),
        })
    }

    fn may_sync(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Choice
// ---------------------------------------------------------------------------

struct Choice {
    left: Arc<dyn Reactant>,
    right: Arc<dyn Reactant>,
}

impl Reactant for Choice {
    fn try_react(&self, a: Atom, rx: Reaction, offer: Option<&Arc<Offer>>) -> Outcome {
        match self.left.try_react(a.clone(), rx.clone(), offer) {
            Outcome::Completed(v) => Outcome::Completed(v),
            Outcome::Retry => match self.right.try_react(a, rx, offer) {
                Outcome::Completed(v) => Outcome::Completed(v),
                // The left failure was transient, so the right branch's
                // block gives no license to park.
                Outcome::Retry | Outcome::Block => Outcome::Retry,
            },
            Outcome::Block => self.right.try_react(a, rx, offer),
        }
    }

    fn compose(self: Arc<Self>, next: Arc<dyn Reactant>) -> Arc<dyn Reactant> {
        if next.is_commit() {
            return self;
        }
        if let Some((n1, n2)) = next.as_choice() {
            // Distribute into four flattened branches so every disjunct
            // sees the same continuation offers.
            let ln1 = self.left.clone().compose(n1.clone());
            let ln2 = self.left.clone().compose(n2.clone());
            let rn1 = self.right.clone().compose(n1.clone());
            let rn2 = self.right.clone().compose(n2.clone());
            return Arc::new(Choice {
                left: Arc::new(Choice {
                    left: ln1,
                    right: ln2,
                }),
                right: Arc::new(Choice {
                    left: rn1,
                    right: rn2,
                }),
            });
        }
        Arc::new(Choice {
            left: self.left.clone().compose(next.clone()),
            right: self.right.clone().compose(next),
        })
    }

    fn always_commits(&self) -> bool {
        self.left.always_commits() && self.right.always_commits()
    }

    fn may_sync(&self) -> bool {
        self.left.may_sync() || self.right.may_sync()
    }

    fn snoop(&self, a: &Atom) -> bool {
        self.right.snoop(a) || self.left.snoop(a)
    }

    fn as_choice(&self) -> Option<(&Arc<dyn Reactant>, &Arc<dyn Reactant>)> {
        Some((&self.left, &self.right))
    }
}

// ---------------------------------------------------------------------------
// PostCommit
// ---------------------------------------------------------------------------

struct PostCommit {
    f: Arc<dyn Fn(Atom) + Send + Sync>,
    k: Arc<dyn Reactant>,
}

impl Reactant for PostCommit {
    fn try_react(&self, a: Atom, rx: Reaction, offer: Option<&Arc<Offer>>) -> Outcome {
        let f = Arc::clone(&self.f);
        let captured = a.clone();
        let rx = rx.with_post_commit(move || f(captured.clone()));
        self.k.try_react(a, rx, offer)
    }

    fn compose(self: Arc<Self>, next: Arc<dyn Reactant>) -> Arc<dyn Reactant> {
        if next.is_commit() {
            return self;
        }
        Arc::new(PostCommit {
            f: Arc::clone(&self.f),
            k: self.k.clone().compose(next),
        })
    }

    fn always_commits(&self) -> bool {
        self.k.always_commits()
    }

    fn may_sync(&self) -> bool {
        self.k.may_sync()
    }

    fn snoop(&self, a: &Atom) -> bool {
        self.k.snoop(a)
    }
}

// ---------------------------------------------------------------------------
// Never
// ---------------------------------------------------------------------------

struct Never;

impl Reactant for Never {
    fn try_react(&self, _a: Atom, _rx: Reaction, _offer: Option<&Arc<Offer>>) -> Outcome {
        Outcome::Block
    }

    fn compose(self: Arc<Self>, _next: Arc<dyn Reactant>) -> Arc<dyn Reactant> {
        self
    }
}

// ---------------------------------------------------------------------------
// Consume
// ---------------------------------------------------------------------------

/// Reification of [`Offer::consume_and_continue`] as a continuation node.
///
/// A leaf that discovers a partner's offer composes the partner's published
/// continuation with `Consume`: the partner's answer flows in as this node's
/// input and becomes the offer's completion value, after which the leaf's
/// own continuation `k` runs on `continue_with`. One terminal commit then
/// covers both parties.
pub struct Consume {
    offer: Arc<Offer>,
    continue_with: Atom,
    k: Arc<dyn Reactant>,
}

impl Consume {
    #[must_use]
    pub fn new(offer: Arc<Offer>, continue_with: Atom, k: Arc<dyn Reactant>) -> Arc<dyn Reactant> {
        Arc::new(Self {
            offer,
            continue_with,
            k,
        })
    }
}

impl Reactant for Consume {
    fn try_react(&self, complete_with: Atom, rx: Reaction, offer: Option<&Arc<Offer>>) -> Outcome {
        self.offer
            .consume_and_continue(complete_with, self.continue_with.clone(), &self.k, rx, offer)
    }

    fn compose(self: Arc<Self>, next: Arc<dyn Reactant>) -> Arc<dyn Reactant> {
        if next.is_commit() {
            return self;
        }
        Arc::new(Consume {
            offer: Arc::clone(&self.offer),
            continue_with: self.continue_with.clone(),
            k: self.k.clone().compose(next),
        })
    }

    fn may_sync(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// The constant reagent: ignores its input and answers `value`.
pub fn ret<A, T>(value: T) -> Reagent<A, T>
where
    T: Send + Sync + 'static,
{
    Reagent::from_core(Arc::new(Ret {
        value: atom(value),
        k: commit_core(),
    }))
}

/// Lift a partial function; an undefined input blocks the attempt.
pub fn lift<A, B>(f: impl Fn(A) -> Option<B> + Send + Sync + 'static) -> Reagent<A, B>
where
    A: Clone + Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    lift_node(f, false)
}

/// Total-function lift, allowed to report `always_commits`.
pub(crate) fn lift_total<A, B>(f: impl Fn(A) -> Option<B> + Send + Sync + 'static) -> Reagent<A, B>
where
    A: Clone + Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    lift_node(f, true)
}

fn lift_node<A, B>(
    f: impl Fn(A) -> Option<B> + Send + Sync + 'static,
    total: bool,
) -> Reagent<A, B>
where
    A: Clone + Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    let f: Arc<dyn Fn(Atom) -> Option<Atom> + Send + Sync> =
        Arc::new(move |a| f(cast_value::<A>(a)).map(|b| atom(b)));
    Reagent::from_core(Arc::new(Lift {
        f,
        total,
        k: commit_core(),
    }))
}

/// Dynamic continuation: compute the reagent to run from the input.
pub fn computed<A, B>(c: impl Fn(A) -> Reagent<(), B> + Send + Sync + 'static) -> Reagent<A, B>
where
    A: Clone + Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    let f: Arc<dyn Fn(Atom) -> Arc<dyn Reactant> + Send + Sync> =
        Arc::new(move |a| c(cast_value::<A>(a)).into_core());
    Reagent::from_core(Arc::new(Computed {
        f,
        k: commit_core(),
    }))
}

/// Left-biased non-deterministic disjunction.
pub fn choice<A, B>(r1: Reagent<A, B>, r2: Reagent<A, B>) -> Reagent<A, B> {
    Reagent::from_core(Arc::new(Choice {
        left: r1.into_core(),
        right: r2.into_core(),
    }))
}

/// Identity for the value; runs `f` on it after the reaction commits.
pub fn post_commit<A>(f: impl Fn(A) + Send + Sync + 'static) -> Reagent<A, A>
where
    A: Clone + Send + Sync + 'static,
{
    let f: Arc<dyn Fn(Atom) + Send + Sync> = Arc::new(move |a| f(cast_value::<A>(a)));
    Reagent::from_core(Arc::new(PostCommit {
        f,
        k: commit_core(),
    }))
}

/// The reagent that never reacts; identity of [`choice`].
pub fn never<A, B>() -> Reagent<A, B> {
    Reagent::from_core(Arc::new(Never))
}

/// The terminal commit as a standalone reagent.
pub fn commit<A>() -> Reagent<A, A> {
    Reagent::from_core(Arc::new(Commit))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    /// A leaf that always reports the given backtrack.
    struct Fixed {
        retry: bool,
    }

    impl Reactant for Fixed {
        fn try_react(&self, _a: Atom, _rx: Reaction, _o: Option<&Arc<Offer>>) -> Outcome {
            if self.retry {
                Outcome::Retry
            } else {
                Outcome::Block
            }
        }
        fn compose(self: Arc<Self>, _next: Arc<dyn Reactant>) -> Arc<dyn Reactant> {
            self
        }
    }

    fn retrying<B>() -> Reagent<(), B> {
        Reagent::from_core(Arc::new(Fixed { retry: true }))
    }

    fn blocking<B>() -> Reagent<(), B> {
        Reagent::from_core(Arc::new(Fixed { retry: false }))
    }

    #[test]
    fn ret_answers_its_constant() {
        assert_eq!(ret::<(), _>(42_i32).react(()), 42);
    }

    #[test]
    fn lift_partial_blocks_on_undefined_input() {
        let doubler = lift(|x: i32| (x > 0).then_some(x * 2));
        assert_eq!(doubler.attempt(-1), None);
        assert_eq!(doubler.attempt(3), Some(6));
    }

    #[test]
    fn choice_of_never_answers_the_live_branch() {
        assert_eq!(never::<(), &str>().or(ret("b")).react(()), "b");
        assert_eq!(ret::<(), &str>("a").or(never()).react(()), "a");
    }

    #[test]
    fn choice_is_left_biased() {
        assert_eq!(ret::<(), _>(1_u8).or(ret(2_u8)).react(()), 1);
    }

    #[test]
    fn composing_with_commit_is_identity() {
        let r = ret::<(), _>(5_u8);
        let core_before = Arc::as_ptr(r.core()) as *const ();
        let composed = r.then(commit());
        assert_eq!(Arc::as_ptr(composed.core()) as *const (), core_before);
        assert_eq!(composed.react(()), 5);
    }

    #[test]
    fn retry_in_either_branch_forces_retry() {
        // right blocks, left retried: the disjunction must retry, not park
        assert_eq!(retrying::<u8>().or(blocking()).attempt(()), None);
        assert_eq!(blocking::<u8>().or(retrying()).attempt(()), None);
        // an answer still wins over a left retry
        assert_eq!(retrying::<u8>().or(ret(9)).attempt(()), Some(9));
    }

    #[test]
    fn map_and_filters() {
        let r = ret::<(), _>(10_i32).map(|x| x + 1);
        assert_eq!(r.react(()), 11);
        assert!(r.always_commits());

        let odd = ret::<(), _>(10_i32).with_filter(|x| x % 2 == 1);
        assert_eq!(odd.attempt(()), None);

        let half = ret::<(), _>(10_i32).map_filter(|x| (x % 2 == 0).then_some(x / 2));
        assert_eq!(half.react(()), 5);
    }

    #[test]
    fn flat_map_routes_through_computed() {
        let r = ret::<(), _>(3_u32).flat_map(|n| ret(n * n));
        assert_eq!(r.react(()), 9);
        assert!(r.may_sync()); // computed continuations are opaque
    }

    #[test]
    fn seq_discards_the_left_answer() {
        let r = ret::<(), _>("ignored").seq(ret(7_u8));
        assert_eq!(r.react(()), 7);
    }

    #[test]
    fn post_commit_runs_in_order_with_the_value() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let l1 = Arc::clone(&log);
        let l2 = Arc::clone(&log);
        let r = ret::<(), _>(4_u32)
            .then(post_commit(move |v: u32| l1.lock().push(v)))
            .then(post_commit(move |v: u32| l2.lock().push(v + 1)));
        assert_eq!(r.react(()), 4);
        assert_eq!(*log.lock(), vec![4, 5]);
    }

    #[test]
    fn post_commit_does_not_run_on_failed_attempts() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let r = post_commit(move |_: u32| {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .with_filter(|_| false);
        assert_eq!(r.attempt(1), None);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn choice_distributes_over_a_choice_continuation() {
        // (block <+> ret(1)) >=> (filter-odd <+> map(+10)): the only
        // committable branch is ret(1) into map(+10).
        let left: Reagent<(), u32> = blocking::<u32>().or(ret(1));
        let next = lift(|x: u32| (x % 2 == 0).then_some(x)).or(lift(|x: u32| Some(x + 10)));
        let r = left.then(next);
        assert_eq!(r.react(()), 11);
    }

    #[test]
    fn computed_sees_the_input_value() {
        let r = computed(|x: u32| if x > 5 { ret("big") } else { ret("small") });
        assert_eq!(r.react(9), "big");
        assert_eq!(r.react(1), "small");
    }

    #[test]
    fn flag_composition() {
        let c = ret::<(), _>(1_u8).or(ret(2_u8));
        assert!(c.always_commits());

        let c2 = never::<(), u8>().or(ret(2_u8));
        assert!(!c2.always_commits());
        assert!(c2.snoop(())); // right branch reports readiness first

        let n = never::<(), u8>();
        assert!(!n.snoop(()));
    }

    /// Snoop soundness: when snoop says false, an immediate attempt must
    /// itself backtrack.
    #[test]
    fn snoop_false_implies_backtrack() {
        let blocked = lift(|x: i32| (x > 0).then_some(x));
        if !blocked.snoop(-5) {
            assert_eq!(blocked.attempt(-5), None);
        }
        let n = never::<(), u8>();
        assert!(!n.snoop(()));
        assert_eq!(n.attempt(()), None);
    }
}
