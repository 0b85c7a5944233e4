//! Offers: published rendezvous handles.
//!
//! A stalled reagent publishes an offer into the pools where partners may
//! find it. A `Waiter` belongs to one parked (or spinning) invocation and
//! holds a status word that moves `Waiting -> Aborted` or
//! `Waiting -> answer` exactly once, by CAS only. A `Catalyst` belongs to a
//! dissolved background reagent; it has no answer, only an alive flag whose
//! `true -> false` edge triggers exactly one re-dissolve.
//!
//! Pools holding offers must poll [`Offer::is_deleted`] while iterating and
//! drop stale entries opportunistically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

use crate::atom::Atom;
use crate::metrics;
use crate::reaction::{CasSlot, Reaction};
use crate::reagent::{dissolve_core, Outcome, Reactant};

/// Status sentinel: the waiter has not yet been completed or aborted.
struct WaitingTag;

/// Status sentinel: the waiter was rescinded without an answer.
struct AbortedTag;

/// Result of [`Offer::try_abort`].
pub enum AbortResult {
    /// This call performed the abort; there is no answer.
    Aborted,
    /// A previous abort already won; there is no answer.
    AlreadyAborted,
    /// A partner completed the offer first; here is the answer.
    Answered(Atom),
}

impl AbortResult {
    #[must_use]
    pub fn answer(self) -> Option<Atom> {
        match self {
            Self::Answered(a) => Some(a),
            Self::Aborted | Self::AlreadyAborted => None,
        }
    }
}

impl std::fmt::Debug for AbortResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aborted => write!(f, "Aborted"),
            Self::AlreadyAborted => write!(f, "AlreadyAborted"),
            Self::Answered(_) => write!(f, "Answered(..)"),
        }
    }
}

enum Body {
    Waiter {
        status: Arc<CasSlot>,
        waiting: Atom,
        aborted: Atom,
        owner: Thread,
        blocking: bool,
    },
    Catalyst {
        alive: AtomicBool,
        dissolvent: Arc<dyn Reactant>,
    },
}

/// A published rendezvous handle: `Waiter` or `Catalyst`.
pub struct Offer {
    body: Body,
}

impl Offer {
    /// Fresh waiter owned by the calling thread.
    #[must_use]
    pub fn waiter(blocking: bool) -> Arc<Self> {
        let waiting: Atom = Arc::new(WaitingTag);
        let aborted: Atom = Arc::new(AbortedTag);
        Arc::new(Self {
            body: Body::Waiter {
                status: Arc::new(CasSlot::new(waiting.clone())),
                waiting,
                aborted,
                owner: thread::current(),
                blocking,
            },
        })
    }

    /// Fresh catalyst carrying the reagent to reinstate on wake.
    #[must_use]
    pub fn catalyst(dissolvent: Arc<dyn Reactant>) -> Arc<Self> {
        Arc::new(Self {
            body: Body::Catalyst {
                alive: AtomicBool::new(true),
                dissolvent,
            },
        })
    }

    #[must_use]
    pub fn is_waiter(&self) -> bool {
        matches!(self.body, Body::Waiter { .. })
    }

    #[must_use]
    pub fn is_catalyst(&self) -> bool {
        matches!(self.body, Body::Catalyst { .. })
    }

    /// Whether a completing partner must unpark the owner.
    #[must_use]
    pub fn blocking(&self) -> bool {
        match &self.body {
            Body::Waiter { blocking, .. } => *blocking,
            Body::Catalyst { .. } => false,
        }
    }

    /// A waiter is active while still `Waiting`; a catalyst while alive.
    #[must_use]
    pub fn is_active(&self) -> bool {
        match &self.body {
            Body::Waiter { status, .. } => status.load().is::<WaitingTag>(),
            Body::Catalyst { alive, .. } => alive.load(Ordering::SeqCst),
        }
    }

    /// Pools drop entries for which this returns true.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        !self.is_active()
    }

    /// Complete a waiting offer with an answer. True iff this call won the
    /// status CAS; at most one completion ever succeeds.
    pub fn try_complete(&self, answer: Atom) -> bool {
        match &self.body {
            Body::Waiter {
                status, waiting, ..
            } => status.compare_and_set(waiting, answer),
            Body::Catalyst { .. } => false,
        }
    }

    /// Rescind the offer. Idempotent: at most one call observes `Aborted`,
    /// and once a partner has answered, every call returns that answer.
    pub fn try_abort(&self) -> AbortResult {
        match &self.body {
            Body::Waiter {
                status, aborted, ..
            } => loop {
                let cur = status.load();
                if cur.is::<WaitingTag>() {
                    if status.compare_and_set(&cur, aborted.clone()) {
                        metrics::record_offer_abort();
                        return AbortResult::Aborted;
                    }
                    // lost a race against a completion or another abort
                } else if cur.is::<AbortedTag>() {
                    return AbortResult::AlreadyAborted;
                } else {
                    return AbortResult::Answered(cur);
                }
            },
            Body::Catalyst { alive, .. } => {
                if alive
                    .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    metrics::record_offer_abort();
                    AbortResult::Aborted
                } else {
                    AbortResult::AlreadyAborted
                }
            }
        }
    }

    /// Pool-side wake on a stale registration. A waiter that was still
    /// waiting is aborted and its owner unparked so it can retry. A live
    /// catalyst is torn down and re-dissolved exactly once.
    pub fn abort_and_wake(&self) {
        match &self.body {
            Body::Waiter { owner, .. } => {
                if matches!(self.try_abort(), AbortResult::Aborted) {
                    metrics::record_unpark();
                    owner.unpark();
                }
            }
            Body::Catalyst { alive, dissolvent } => {
                if alive
                    .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    metrics::record_catalyst_reinstall();
                    tracing::debug!(target: "fchem.offer", "re-dissolving woken catalyst");
                    if dissolve_core(dissolvent.clone()).is_err() {
                        tracing::warn!(
                            target: "fchem.offer",
                            "woken catalyst failed to reinstall"
                        );
                    }
                }
            }
        }
    }

    /// Fold this offer's satisfaction into an in-flight reaction and carry
    /// on with the consumer's continuation.
    ///
    /// For a waiter: complete with `complete_with` (immediately via a
    /// single direct CAS when the reaction permits, otherwise as a tentative
    /// CAS on the status word), then run `k` on `continue_with`. A blocking
    /// waiter also gets an unpark post-commit. For a catalyst there is no
    /// offerer to satisfy: `complete_with` is ignored and `k` runs directly.
    pub fn consume_and_continue(
        &self,
        complete_with: Atom,
        continue_with: Atom,
        k: &Arc<dyn Reactant>,
        rx: Reaction,
        enclosing: Option<&Arc<Offer>>,
    ) -> Outcome {
        match &self.body {
            Body::Catalyst { .. } => k.try_react(continue_with, rx, enclosing),
            Body::Waiter {
                status,
                waiting,
                owner,
                blocking,
                ..
            } => {
                let rx = if *blocking {
                    let owner = owner.clone();
                    rx.with_post_commit(move || {
                        metrics::record_unpark();
                        owner.unpark();
                    })
                } else {
                    rx
                };
                if rx.can_cas_immediate(k.as_ref(), enclosing) {
                    if !self.try_complete(complete_with) {
                        return Outcome::Retry;
                    }
                    k.try_react(continue_with, rx, enclosing)
                } else {
                    let rx = rx.with_cas(status.clone(), waiting.clone(), complete_with);
                    k.try_react(continue_with, rx, enclosing)
                }
            }
        }
    }

    /// Park the owner thread until the offer leaves the waiting state.
    /// Only the owning thread may call this; partners and pools wake it via
    /// the unpark post-commit or [`Offer::abort_and_wake`].
    pub fn park_while_active(&self) {
        while self.is_active() {
            thread::park();
        }
    }
}

impl std::fmt::Debug for Offer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_waiter() { "Waiter" } else { "Catalyst" };
        f.debug_struct("Offer")
            .field("kind", &kind)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
