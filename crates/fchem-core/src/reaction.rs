//! Reactions: the tentative-CAS log and its atomic commit.
//!
//! A reaction accumulates compare-and-set operations against [`CasSlot`]s
//! plus post-commit callbacks. `try_commit` applies the whole log
//! atomically: slot locks are taken in a global address order, every
//! expected value is validated by identity, and only then is anything
//! published. Readers go through the same slot locks, so no thread can
//! observe a partially applied reaction.
//!
//! ## Protocol
//!
//! 1. Sort the CAS list by slot address (total order, deadlock-free).
//!    A duplicate target means the same slot was claimed twice in one
//!    reaction; the commit refuses and returns false.
//! 2. Acquire all slot locks, validate every `expected` by identity.
//!    Any mismatch releases everything untouched and returns false.
//! 3. Publish every `new` value, release the locks, then run post-commit
//!    callbacks in registration order on the committing thread.

use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::atom::{same_atom, Atom};
use crate::metrics;
use crate::offer::Offer;
use crate::reagent::Reactant;

// ---------------------------------------------------------------------------
// CasSlot
// ---------------------------------------------------------------------------

/// A CAS-capable storage word holding an [`Atom`] with identity-compare
/// semantics. Shared cells and offer status words are built on this.
pub struct CasSlot {
    cell: Mutex<Atom>,
}

impl CasSlot {
    pub fn new(initial: Atom) -> Self {
        Self {
            cell: Mutex::new(initial),
        }
    }

    /// Current value.
    #[must_use]
    pub fn load(&self) -> Atom {
        self.cell.lock().clone()
    }

    /// Single-word compare-and-set. `expected` is compared by identity.
    pub fn compare_and_set(&self, expected: &Atom, new: Atom) -> bool {
        let mut cur = self.cell.lock();
        if same_atom(&*cur, expected) {
            *cur = new;
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for CasSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CasSlot").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Reaction
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct TentativeCas {
    slot: Arc<CasSlot>,
    expected: Atom,
    new: Atom,
}

type PostCommitFn = Arc<dyn Fn() + Send + Sync>;

/// An in-flight, not-yet-committed bundle of tentative CAS operations and
/// post-commit callbacks. Never partially applied.
#[derive(Clone, Default)]
pub struct Reaction {
    cas_list: SmallVec<[TentativeCas; 2]>,
    post_commits: SmallVec<[PostCommitFn; 2]>,
}

impl Reaction {
    /// The canonical empty reaction.
    #[must_use]
    pub fn inert() -> Self {
        Self::default()
    }

    /// Extend with a tentative CAS. Recording the same slot twice makes the
    /// eventual commit fail.
    #[must_use]
    pub fn with_cas(mut self, slot: Arc<CasSlot>, expected: Atom, new: Atom) -> Self {
        self.cas_list.push(TentativeCas {
            slot,
            expected,
            new,
        });
        self
    }

    /// Extend with a post-commit callback, run after a successful commit in
    /// registration order.
    #[must_use]
    pub fn with_post_commit(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.post_commits.push(Arc::new(f));
        self
    }

    /// Concatenate another reaction's log onto this one. Used when an active
    /// party adopts the partial reaction a stalled partner published with
    /// its offer.
    #[must_use]
    pub fn merge(mut self, other: Reaction) -> Self {
        self.cas_list.extend(other.cas_list);
        self.post_commits.extend(other.post_commits);
        self
    }

    /// Number of tentative CAS entries.
    #[must_use]
    pub fn cas_count(&self) -> usize {
        self.cas_list.len()
    }

    /// True when a leaf may short-circuit with a single direct CAS instead
    /// of extending the log: the continuation is the terminal commit, no
    /// enclosing offer constrains the attempt, and the log is empty.
    #[must_use]
    pub fn can_cas_immediate(&self, k: &dyn Reactant, enclosing: Option<&Arc<Offer>>) -> bool {
        self.cas_list.is_empty() && enclosing.is_none() && k.is_commit()
    }

    /// Atomically apply the whole log. On success the post-commit callbacks
    /// run in order on this thread before returning true. On any mismatch
    /// nothing is mutated and the result is false.
    pub fn try_commit(self) -> bool {
        let Reaction {
            mut cas_list,
            post_commits,
        } = self;

        match cas_list.len() {
            0 => {}
            1 => {
                let entry = &cas_list[0];
                if !entry.slot.compare_and_set(&entry.expected, entry.new.clone()) {
                    metrics::record_commit_conflict();
                    return false;
                }
            }
            _ => {
                cas_list.sort_by_key(|e| Arc::as_ptr(&e.slot) as usize);
                if cas_list
                    .windows(2)
                    .any(|w| Arc::ptr_eq(&w[0].slot, &w[1].slot))
                {
                    metrics::record_commit_conflict();
                    return false;
                }

                let mut guards = Vec::with_capacity(cas_list.len());
                for entry in &cas_list {
                    guards.push(entry.slot.cell.lock());
                }
                for (entry, guard) in cas_list.iter().zip(&guards) {
                    if !same_atom(&**guard, &entry.expected) {
                        metrics::record_commit_conflict();
                        return false;
                    }
                }
                for (entry, guard) in cas_list.iter().zip(guards.iter_mut()) {
                    **guard = entry.new.clone();
                }
            }
        }

        metrics::record_commit(cas_list.len());
        tracing::trace!(
            target: "fchem.commit",
            cas_count = cas_list.len(),
            post_commits = post_commits.len(),
            "reaction committed"
        );
        for pc in post_commits {
            pc();
        }
        true
    }
}

impl std::fmt::Debug for Reaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaction")
            .field("cas_count", &self.cas_list.len())
            .field("post_commits", &self.post_commits.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
