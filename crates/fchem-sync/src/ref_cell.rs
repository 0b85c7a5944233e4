//! Shared cells.
//!
//! A [`Ref`] stores an identity-compared value word plus a pool of offers
//! left behind by attempts that found the cell in an unusable state. Every
//! committed mutation drains the pool with `abort_and_wake`, so parked
//! waiters retry and torn-down catalysts reinstall.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use fchem_core::atom::{atom, cast, same_atom, unit_atom, Atom};
use fchem_core::combinators::commit;
use fchem_core::offer::Offer;
use fchem_core::reaction::{CasSlot, Reaction};
use fchem_core::reagent::{Outcome, Reactant, Reagent};

// ---------------------------------------------------------------------------
// Offer pool
// ---------------------------------------------------------------------------

/// Offers parked on a cell. Lock-based and simple: cardinality is bounded
/// by concurrently stalled invocations, and stale entries are pruned on
/// every touch via `is_deleted` polling.
#[derive(Default)]
pub(crate) struct OfferPool {
    entries: Mutex<Vec<Arc<Offer>>>,
}

impl OfferPool {
    fn put(&self, offer: Arc<Offer>) {
        let mut entries = self.entries.lock();
        entries.retain(|o| !o.is_deleted());
        entries.push(offer);
    }

    fn wake_all(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.entries.lock());
        for offer in drained {
            if !offer.is_deleted() {
                offer.abort_and_wake();
            }
        }
    }

    #[cfg(test)]
    fn live_len(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|o| !o.is_deleted())
            .count()
    }
}

// ---------------------------------------------------------------------------
// Ref
// ---------------------------------------------------------------------------

/// A shared mutable cell with CAS semantics over identity-compared values.
pub struct Ref<T> {
    slot: Arc<CasSlot>,
    pool: Arc<OfferPool>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            pool: Arc::clone(&self.pool),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ref").finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> Ref<T> {
    pub fn new(initial: T) -> Self {
        Self {
            slot: Arc::new(CasSlot::new(atom(initial))),
            pool: Arc::new(OfferPool::default()),
            _marker: PhantomData,
        }
    }

    /// Direct snapshot of the current value, outside any reaction.
    #[must_use]
    pub fn get(&self) -> Arc<T> {
        cast::<T>(self.slot.load())
    }

    /// Reagent answering the cell's value at reaction time.
    #[must_use]
    pub fn read(&self) -> Reagent<(), T>
    where
        T: Clone,
    {
        Reagent::from_core(Arc::new(ReadRef {
            slot: Arc::clone(&self.slot),
            k: commit::<T>().into_core(),
        }))
    }

    /// Partial update: `f` maps the current value and the input to a new
    /// value plus an answer, or `None` to block until the cell changes.
    #[must_use]
    pub fn upd<A, B, F>(&self, f: F) -> Reagent<A, B>
    where
        F: Fn(&T, &A) -> Option<(T, B)> + Send + Sync + 'static,
        A: Send + Sync + 'static,
        B: Send + Sync + 'static,
    {
        Reagent::from_core(Arc::new(Upd {
            slot: Arc::clone(&self.slot),
            pool: Arc::clone(&self.pool),
            f: Arc::new(f),
            k: commit::<B>().into_core(),
            _marker: PhantomData,
        }))
    }

    /// Total update answering the previous value.
    #[must_use]
    pub fn modify(&self, f: impl Fn(&T) -> T + Send + Sync + 'static) -> Reagent<(), T>
    where
        T: Clone,
    {
        self.upd(move |t, _: &()| Some((f(t), t.clone())))
    }

    /// Explicit identity CAS; a mismatch backtracks with `Retry`.
    #[must_use]
    pub fn cas(&self, expected: Arc<T>, new: T) -> Reagent<(), ()> {
        let expected: Atom = expected;
        Reagent::from_core(Arc::new(CasRef {
            slot: Arc::clone(&self.slot),
            pool: Arc::clone(&self.pool),
            expected,
            new: atom(new),
            k: commit::<()>().into_core(),
        }))
    }

    #[cfg(test)]
    pub(crate) fn parked_offers(&self) -> usize {
        self.pool.live_len()
    }
}

// ---------------------------------------------------------------------------
// Leaf nodes
// ---------------------------------------------------------------------------

struct ReadRef {
    slot: Arc<CasSlot>,
    k: Arc<dyn Reactant>,
}

impl Reactant for ReadRef {
    fn try_react(&self, _a: Atom, rx: Reaction, offer: Option<&Arc<Offer>>) -> Outcome {
        self.k.try_react(self.slot.load(), rx, offer)
    }

    fn compose(self: Arc<Self>, next: Arc<dyn Reactant>) -> Arc<dyn Reactant> {
        if next.is_commit() {
            return self;
        }
        Arc::new(ReadRef {
            slot: Arc::clone(&self.slot),
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
        self.k.snoop(&self.slot.load())
    }
}

struct Upd<T, A, B, F> {
    slot: Arc<CasSlot>,
    pool: Arc<OfferPool>,
    f: Arc<F>,
    k: Arc<dyn Reactant>,
    _marker: PhantomData<fn(T, A) -> B>,
}

impl<T, A, B, F> Reactant for Upd<T, A, B, F>
where
    T: Send + Sync + 'static,
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
    F: Fn(&T, &A) -> Option<(T, B)> + Send + Sync + 'static,
{
    fn try_react(&self, a: Atom, rx: Reaction, offer: Option<&Arc<Offer>>) -> Outcome {
        let input = cast::<A>(a);
        let cur_word = self.slot.load();
        let cur = cast::<T>(cur_word.clone());
        match (self.f)(&cur, &input) {
            Some((new_value, answer)) => {
                if let Some(o) = offer {
                    if o.is_catalyst() {
                        // A catalytic commit that loses the race is retried
                        // by the winning writer's pool wake, so the catalyst
                        // must already be registered here.
                        self.pool.put(Arc::clone(o));
                    }
                }
                let new_word = atom(new_value);
                let answer_word = atom(answer);
                let pool = Arc::clone(&self.pool);
                let wake = move || pool.wake_all();
                if rx.can_cas_immediate(self.k.as_ref(), offer) {
                    if self.slot.compare_and_set(&cur_word, new_word) {
                        tracing::trace!(target: "fchem.ref", "immediate cell update");
                        self.k.try_react(answer_word, rx.with_post_commit(wake), offer)
                    } else {
                        Outcome::Retry
                    }
                } else {
                    self.k.try_react(
                        answer_word,
                        rx.with_cas(Arc::clone(&self.slot), cur_word, new_word)
                            .with_post_commit(wake),
                        offer,
                    )
                }
            }
            None => {
                if let Some(o) = offer {
                    self.pool.put(Arc::clone(o));
                    tracing::trace!(target: "fchem.ref", "parked offer on cell");
                    // Re-check after publishing: a writer that drained the
                    // pool between our read and our registration has already
                    // left its new value behind.
                    let recheck = cast::<T>(self.slot.load());
                    if (self.f)(&recheck, &input).is_some() {
                        if o.is_catalyst() {
                            // reinstall so the fresh catalyst sees the
                            // now-enabled cell
                            o.abort_and_wake();
                        } else {
                            return Outcome::Retry;
                        }
                    }
                }
                Outcome::Block
            }
        }
    }

    fn compose(self: Arc<Self>, next: Arc<dyn Reactant>) -> Arc<dyn Reactant> {
        if next.is_commit() {
            return self;
        }
        Arc::new(Upd {
            slot: Arc::clone(&self.slot),
            pool: Arc::clone(&self.pool),
            f: Arc::clone(&self.f),
            k: self.k.clone().compose(next),
            _marker: PhantomData,
        })
    }

    fn may_sync(&self) -> bool {
        true
    }

    fn snoop(&self, a: &Atom) -> bool {
        let input = cast::<A>(a.clone());
        let cur = cast::<T>(self.slot.load());
        (self.f)(&cur, &input).is_some()
    }
}

struct CasRef {
    slot: Arc<CasSlot>,
    pool: Arc<OfferPool>,
    expected: Atom,
    new: Atom,
    k: Arc<dyn Reactant>,
}

impl Reactant for CasRef {
    fn try_react(&self, _a: Atom, rx: Reaction, offer: Option<&Arc<Offer>>) -> Outcome {
        let pool = Arc::clone(&self.pool);
        let wake = move || pool.wake_all();
        if rx.can_cas_immediate(self.k.as_ref(), offer) {
            if self.slot.compare_and_set(&self.expected, self.new.clone()) {
                return self.k.try_react(unit_atom(), rx.with_post_commit(wake), offer);
            }
            match offer {
                Some(o) if o.is_catalyst() => {
                    // A catalyst never retries on its own; park it on the
                    // cell and let the next writer's wake re-dissolve it
                    // (mirrors Upd's blocked branch).
                    self.pool.put(Arc::clone(o));
                    Outcome::Block
                }
                _ => Outcome::Retry,
            }
        } else {
            if let Some(o) = offer {
                if o.is_catalyst() {
                    // The terminal commit under a catalyst offer always
                    // yields Block; register first so a commit that loses
                    // its race is retried by the winning writer's wake.
                    self.pool.put(Arc::clone(o));
                }
            }
            self.k.try_react(
                unit_atom(),
                rx.with_cas(
                    Arc::clone(&self.slot),
                    self.expected.clone(),
                    self.new.clone(),
                )
                .with_post_commit(wake),
                offer,
            )
        }
    }

    fn compose(self: Arc<Self>, next: Arc<dyn Reactant>) -> Arc<dyn Reactant> {
        if next.is_commit() {
            return self;
        }
        Arc::new(CasRef {
            slot: Arc::clone(&self.slot),
            pool: Arc::clone(&self.pool),
            expected: self.expected.clone(),
            new: self.new.clone(),
            k: self.k.clone().compose(next),
        })
    }

    fn snoop(&self, _a: &Atom) -> bool {
        same_atom(&self.slot.load(), &self.expected)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use fchem_core::combinators::post_commit;
    use fchem_core::engine_metrics;
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn read_and_get_agree() {
        let cell = Ref::new(41_u64);
        assert_eq!(*cell.get(), 41);
        assert_eq!(cell.read().react(()), 41);
    }

    #[test]
    fn modify_answers_the_previous_value() {
        let cell = Ref::new(3_u64);
        assert_eq!(cell.modify(|v| v + 1).react(()), 3);
        assert_eq!(*cell.get(), 4);
    }

    #[test]
    fn upd_threads_the_input_through() {
        let cell = Ref::new(10_i64);
        let add = cell.upd(|v, delta: &i64| Some((v + delta, *v)));
        assert_eq!(add.react(5), 10);
        assert_eq!(add.react(-2), 15);
        assert_eq!(*cell.get(), 13);
    }

    #[test]
    fn cas_mismatch_is_no_answer() {
        let cell = Ref::new(1_u8);
        let current = cell.get();
        let stale = Arc::new(1_u8);
        assert_eq!(cell.cas(stale, 9).attempt(()), None);
        assert_eq!(cell.cas(current, 9).attempt(()), Some(()));
        assert_eq!(*cell.get(), 9);
    }

    #[test]
    fn sequenced_updates_commit_atomically() {
        let a = Ref::new(0_u32);
        let b = Ref::new(0_u32);
        let both = a
            .modify(|v| v + 1)
            .seq(b.modify(|v| v + 1));
        assert_eq!(both.react(()), 0);
        assert_eq!(*a.get(), 1);
        assert_eq!(*b.get(), 1);
    }

    #[test]
    fn blocked_upd_wakes_when_the_cell_changes() {
        let cell = Ref::new(0_u64);
        let gate = cell.upd(|v, _: &()| (*v > 0).then(|| (*v, *v)));

        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.react(()))
        };
        thread::sleep(Duration::from_millis(30));

        cell.modify(|_| 7).react(());
        assert_eq!(waiter.join().unwrap(), 7);
    }

    #[test]
    fn stale_offers_are_pruned_from_the_pool() {
        let cell = Ref::new(0_u64);
        let gate: Reagent<(), u64> = cell.upd(|v, _: &()| (*v > 0).then(|| (*v, *v)));

        // a one-shot attempt leaves nothing behind (no offer was passed)
        assert_eq!(gate.attempt(()), None);
        assert_eq!(cell.parked_offers(), 0);
    }

    /// Two racing modifiers never tear: the cell ends at one of the two
    /// serialization orders and each caller sees the value it displaced.
    #[test]
    fn racing_modifies_serialize() {
        for _ in 0..100 {
            let cell = Ref::new(3_u64);
            let barrier = Arc::new(Barrier::new(2));

            let inc = cell.modify(|v| v + 1);
            let dbl = cell.modify(|v| v * 2);

            let b1 = Arc::clone(&barrier);
            let t1 = thread::spawn(move || {
                b1.wait();
                inc.react(())
            });
            let b2 = Arc::clone(&barrier);
            let t2 = thread::spawn(move || {
                b2.wait();
                dbl.react(())
            });

            let prev_inc = t1.join().unwrap();
            let prev_dbl = t2.join().unwrap();
            let final_value = *cell.get();

            assert!(
                final_value == 7 || final_value == 8,
                "unexpected final value {final_value}"
            );
            if final_value == 8 {
                // inc then dbl
                assert_eq!((prev_inc, prev_dbl), (3, 4));
            } else {
                // dbl then inc
                assert_eq!((prev_inc, prev_dbl), (6, 3));
            }
        }
    }

    #[test]
    fn contended_counter_loses_no_updates() {
        let cell = Ref::new(0_u64);
        let barrier = Arc::new(Barrier::new(4));
        let committed = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let inc = cell.modify(|v| v + 1);
            let b = Arc::clone(&barrier);
            let committed = Arc::clone(&committed);
            handles.push(thread::spawn(move || {
                b.wait();
                for _ in 0..500 {
                    inc.react(());
                    committed.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(committed.load(Ordering::SeqCst), 2_000);
        assert_eq!(*cell.get(), 2_000);
    }

    /// A catalyst dissolved directly on a cell parks in the cell's pool,
    /// fires on every wake, and is reinstated after each firing.
    #[test]
    fn dissolved_cell_catalyst_reinstates_after_wake() {
        let before = engine_metrics();
        let cell = Ref::new(0_u64);
        let drained = Arc::new(AtomicU64::new(0));

        let d = Arc::clone(&drained);
        cell.upd(|v, _: &()| (*v > 0).then(|| (0_u64, *v)))
            .then(post_commit(move |taken: u64| {
                d.fetch_add(taken, Ordering::SeqCst);
            }))
            .dissolve()
            .unwrap();
        assert_eq!(cell.parked_offers(), 1);
        assert_eq!(drained.load(Ordering::SeqCst), 0);

        cell.modify(|_| 5).react(());
        assert_eq!(*cell.get(), 0, "the woken catalyst must drain the cell");
        assert_eq!(drained.load(Ordering::SeqCst), 5);
        assert_eq!(cell.parked_offers(), 1, "catalyst must be reinstated");

        cell.modify(|_| 7).react(());
        assert_eq!(*cell.get(), 0);
        assert_eq!(drained.load(Ordering::SeqCst), 12);

        let after = engine_metrics();
        assert!(
            after.fchem_catalyst_reinstalls_total >= before.fchem_catalyst_reinstalls_total + 2,
            "each wake must re-dissolve the catalyst"
        );
    }

    /// A catalytic cas whose expectation cannot match never fires and never
    /// errors: it parks, and every wake reinstalls it.
    #[test]
    fn dissolved_cas_catalyst_parks_until_wake() {
        let before = engine_metrics();
        let cell = Ref::new(1_u8);
        let stale = Arc::new(9_u8);
        cell.cas(stale, 3).dissolve().unwrap();
        assert_eq!(*cell.get(), 1, "a disabled catalytic cas must not fire");
        assert_eq!(cell.parked_offers(), 1);

        cell.modify(|_| 5).react(());
        assert_eq!(*cell.get(), 5);
        assert_eq!(cell.parked_offers(), 1, "catalyst must be reinstated");

        let after = engine_metrics();
        assert!(
            after.fchem_catalyst_reinstalls_total > before.fchem_catalyst_reinstalls_total
        );
    }

    /// A catalytic cas that is enabled at dissolve time fires immediately
    /// and its replacement parks on the now-mismatched cell.
    #[test]
    fn dissolved_cas_catalyst_fires_and_reinstates() {
        let before = engine_metrics();
        let cell = Ref::new(1_u8);
        let current = cell.get();
        cell.cas(current, 3).dissolve().unwrap();

        assert_eq!(*cell.get(), 3, "an enabled catalytic cas fires at dissolve");
        assert_eq!(cell.parked_offers(), 1, "the replacement stays parked");

        let after = engine_metrics();
        assert!(
            after.fchem_catalyst_reinstalls_total > before.fchem_catalyst_reinstalls_total
        );
    }

    /// Under concurrent writers every deposited unit is drained by the
    /// catalyst exactly once; the last wake leaves the cell empty.
    #[test]
    fn cell_catalyst_drains_under_concurrent_writers() {
        let cell = Ref::new(0_u64);
        let drained = Arc::new(AtomicU64::new(0));

        let d = Arc::clone(&drained);
        cell.upd(|v, _: &()| (*v > 0).then(|| (0_u64, *v)))
            .then(post_commit(move |taken: u64| {
                d.fetch_add(taken, Ordering::SeqCst);
            }))
            .dissolve()
            .unwrap();

        let barrier = Arc::new(Barrier::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let add = cell.modify(|v| v + 1);
            let b = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                b.wait();
                for _ in 0..100 {
                    add.react(());
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*cell.get(), 0, "the last wake must drain the cell");
        assert_eq!(drained.load(Ordering::SeqCst), 400);
    }

    proptest! {
        /// Any sequence of reagent updates matches the sequential model.
        #[test]
        fn prop_updates_match_sequential_model(
            deltas in proptest::collection::vec(-50_i64..50, 1..32),
        ) {
            let cell = Ref::new(0_i64);
            let add = cell.upd(|v, d: &i64| Some((v + d, ())));
            let mut model = 0_i64;
            for d in &deltas {
                add.react(*d);
                model += d;
            }
            prop_assert_eq!(*cell.get(), model);
        }
    }
}
