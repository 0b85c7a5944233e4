//! Engine metrics.
//!
//! Counters are lock-free `AtomicU64` with `Relaxed` ordering: callers may
//! observe stale reads but never torn values. Tests should assert on deltas
//! between snapshots rather than absolute values.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

static FCHEM_REACTIONS_COMMITTED_TOTAL: AtomicU64 = AtomicU64::new(0);
static FCHEM_COMMIT_CONFLICTS_TOTAL: AtomicU64 = AtomicU64::new(0);
static FCHEM_CAS_WORDS_COMMITTED_TOTAL: AtomicU64 = AtomicU64::new(0);
static FCHEM_PARKS_TOTAL: AtomicU64 = AtomicU64::new(0);
static FCHEM_UNPARKS_TOTAL: AtomicU64 = AtomicU64::new(0);
static FCHEM_OFFER_ABORTS_TOTAL: AtomicU64 = AtomicU64::new(0);
static FCHEM_CATALYST_REINSTALLS_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Point-in-time snapshot of engine activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineMetrics {
    pub fchem_reactions_committed_total: u64,
    pub fchem_commit_conflicts_total: u64,
    pub fchem_cas_words_committed_total: u64,
    pub fchem_parks_total: u64,
    pub fchem_unparks_total: u64,
    pub fchem_offer_aborts_total: u64,
    pub fchem_catalyst_reinstalls_total: u64,
}

/// Read current engine metrics.
#[must_use]
pub fn engine_metrics() -> EngineMetrics {
    EngineMetrics {
        fchem_reactions_committed_total: FCHEM_REACTIONS_COMMITTED_TOTAL.load(Ordering::Relaxed),
        fchem_commit_conflicts_total: FCHEM_COMMIT_CONFLICTS_TOTAL.load(Ordering::Relaxed),
        fchem_cas_words_committed_total: FCHEM_CAS_WORDS_COMMITTED_TOTAL.load(Ordering::Relaxed),
        fchem_parks_total: FCHEM_PARKS_TOTAL.load(Ordering::Relaxed),
        fchem_unparks_total: FCHEM_UNPARKS_TOTAL.load(Ordering::Relaxed),
        fchem_offer_aborts_total: FCHEM_OFFER_ABORTS_TOTAL.load(Ordering::Relaxed),
        fchem_catalyst_reinstalls_total: FCHEM_CATALYST_REINSTALLS_TOTAL.load(Ordering::Relaxed),
    }
}

/// Reset all counters to zero (tests/diagnostics).
pub fn reset_engine_metrics() {
    FCHEM_REACTIONS_COMMITTED_TOTAL.store(0, Ordering::Relaxed);
    FCHEM_COMMIT_CONFLICTS_TOTAL.store(0, Ordering::Relaxed);
    FCHEM_CAS_WORDS_COMMITTED_TOTAL.store(0, Ordering::Relaxed);
    FCHEM_PARKS_TOTAL.store(0, Ordering::Relaxed);
    FCHEM_UNPARKS_TOTAL.store(0, Ordering::Relaxed);
    FCHEM_OFFER_ABORTS_TOTAL.store(0, Ordering::Relaxed);
    FCHEM_CATALYST_REINSTALLS_TOTAL.store(0, Ordering::Relaxed);
}

impl std::fmt::Display for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "engine(committed={} conflicts={} cas_words={} parks={} unparks={} aborts={} reinstalls={})",
            self.fchem_reactions_committed_total,
            self.fchem_commit_conflicts_total,
            self.fchem_cas_words_committed_total,
            self.fchem_parks_total,
            self.fchem_unparks_total,
            self.fchem_offer_aborts_total,
            self.fchem_catalyst_reinstalls_total,
        )
    }
}

pub(crate) fn record_commit(cas_words: usize) {
    FCHEM_REACTIONS_COMMITTED_TOTAL.fetch_add(1, Ordering::Relaxed);
    FCHEM_CAS_WORDS_COMMITTED_TOTAL.fetch_add(cas_words as u64, Ordering::Relaxed);
}

pub(crate) fn record_commit_conflict() {
    FCHEM_COMMIT_CONFLICTS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_park() {
    FCHEM_PARKS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_unpark() {
    FCHEM_UNPARKS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_offer_abort() {
    FCHEM_OFFER_ABORTS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_catalyst_reinstall() {
    FCHEM_CATALYST_REINSTALLS_TOTAL.fetch_add(1, Ordering::Relaxed);
}
