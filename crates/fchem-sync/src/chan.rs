//! Two-party swap channels.
//!
//! A channel is a pair of dual endpoints, each backed by a message pool.
//! A stalled party leaves behind a message carrying its payload, its
//! partial reaction, its continuation, and its offer. An active party
//! scanning the dual pool fuses with a message: the partner's continuation
//! runs on the active payload, the partner's offer is satisfied through the
//! engine's `Consume` node, and the active continuation runs on the
//! partner's payload, all under one terminal commit.
//!
//! Catalyst messages are never consumed away: they stay in the pool while
//! alive, which is what lets a dissolved reagent react with any number of
//! partners.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use fchem_core::atom::Atom;
use fchem_core::combinators::{commit, Consume};
use fchem_core::offer::Offer;
use fchem_core::reaction::Reaction;
use fchem_core::reagent::{Outcome, Reactant, Reagent};

// ---------------------------------------------------------------------------
// Message pool
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Message {
    payload: Atom,
    sender_rx: Reaction,
    kont: Arc<dyn Reactant>,
    offer: Arc<Offer>,
}

#[derive(Default)]
struct MsgPool {
    msgs: Mutex<Vec<Message>>,
}

impl MsgPool {
    fn publish(&self, m: Message) {
        let mut q = self.msgs.lock();
        q.retain(|m| !m.offer.is_deleted());
        q.push(m);
    }

    fn snapshot(&self) -> Vec<Message> {
        let mut q = self.msgs.lock();
        q.retain(|m| !m.offer.is_deleted());
        q.clone()
    }

    fn has_live(&self) -> bool {
        self.msgs.lock().iter().any(|m| !m.offer.is_deleted())
    }

    fn live_len(&self) -> usize {
        self.msgs
            .lock()
            .iter()
            .filter(|m| !m.offer.is_deleted())
            .count()
    }
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// One side of a swap channel: sends `A`, receives `B`.
pub struct Endpoint<A, B> {
    mine: Arc<MsgPool>,
    dual: Arc<MsgPool>,
    _marker: PhantomData<fn(A) -> B>,
}

impl<A, B> Clone for Endpoint<A, B> {
    fn clone(&self) -> Self {
        Self {
            mine: Arc::clone(&self.mine),
            dual: Arc::clone(&self.dual),
            _marker: PhantomData,
        }
    }
}

impl<A, B> std::fmt::Debug for Endpoint<A, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("pending", &self.mine.live_len())
            .finish_non_exhaustive()
    }
}

/// Create a swap channel, returning its two dual endpoints.
#[must_use]
pub fn swap_chan<A, B>() -> (Endpoint<A, B>, Endpoint<B, A>) {
    let here = Arc::new(MsgPool::default());
    let there = Arc::new(MsgPool::default());
    (
        Endpoint {
            mine: Arc::clone(&here),
            dual: Arc::clone(&there),
            _marker: PhantomData,
        },
        Endpoint {
            mine: there,
            dual: here,
            _marker: PhantomData,
        },
    )
}

impl<A, B> Endpoint<A, B>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    /// The swap reagent: offer `A`, rendezvous with a dual party, answer
    /// its `B`.
    #[must_use]
    pub fn swap(&self) -> Reagent<A, B> {
        Reagent::from_core(Arc::new(Swap {
            mine: Arc::clone(&self.mine),
            dual: Arc::clone(&self.dual),
            k: commit::<B>().into_core(),
        }))
    }

    /// Messages currently parked on this side (stale entries excluded).
    #[must_use]
    pub fn pending_messages(&self) -> usize {
        self.mine.live_len()
    }
}

// ---------------------------------------------------------------------------
// Swap leaf
// ---------------------------------------------------------------------------

struct Swap {
    mine: Arc<MsgPool>,
    dual: Arc<MsgPool>,
    k: Arc<dyn Reactant>,
}

impl Reactant for Swap {
    fn try_react(&self, a: Atom, rx: Reaction, offer: Option<&Arc<Offer>>) -> Outcome {
        // Publish before scanning: of two parties arriving together, at
        // least one scan then sees the other's message, so both cannot
        // park. A message made stale by a successful scan below is aborted
        // through the offer and pruned by later is_deleted polls.
        if let Some(o) = offer {
            self.mine.publish(Message {
                payload: a.clone(),
                sender_rx: rx.clone(),
                kont: self.k.clone(),
                offer: Arc::clone(o),
            });
            tracing::trace!(target: "fchem.chan", "message published");
        }

        let mut saw_retry = false;
        for m in self.dual.snapshot() {
            if let Some(mine) = offer {
                if Arc::ptr_eq(mine, &m.offer) {
                    // never rendezvous with our own offer
                    continue;
                }
            }
            let fused = m.kont.clone().compose(Consume::new(
                Arc::clone(&m.offer),
                m.payload.clone(),
                self.k.clone(),
            ));
            let merged = rx.clone().merge(m.sender_rx.clone());
            match fused.try_react(a.clone(), merged, offer) {
                Outcome::Completed(v) => return Outcome::Completed(v),
                Outcome::Retry => saw_retry = true,
                Outcome::Block => {}
            }
        }

        // A catalyst's verdict is only inspected by dissolve, which requires
        // Block; a stale-partner retry is retried by the partner's own
        // driver instead.
        let catalytic = offer.is_some_and(|o| o.is_catalyst());
        if saw_retry && !catalytic {
            Outcome::Retry
        } else {
            Outcome::Block
        }
    }

    fn compose(self: Arc<Self>, next: Arc<dyn Reactant>) -> Arc<dyn Reactant> {
        if next.is_commit() {
            return self;
        }
        Arc::new(Swap {
            mine: Arc::clone(&self.mine),
            dual: Arc::clone(&self.dual),
            k: self.k.clone().compose(next),
        })
    }

    fn may_sync(&self) -> bool {
        true
    }

    fn snoop(&self, _a: &Atom) -> bool {
        self.dual.has_live()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
