#![forbid(unsafe_code)]

//! Reagent execution engine.
//!
//! A reagent is a first-class concurrent action that can be sequenced,
//! chosen between, and committed atomically as one reaction. This crate is
//! the engine only: the two-phase try-react/commit protocol, the reaction
//! log of tentative CAS operations, the offer mechanism for rendezvous and
//! blocking, and the back-off/parking driver that turns a lock-free attempt
//! into a blocking or retrying invocation. Concrete shared cells and
//! channels live in `fchem-sync`.

pub mod atom;
pub mod backoff;
pub mod combinators;
pub mod error;
pub mod metrics;
pub mod offer;
pub mod reaction;
pub mod reagent;

pub use atom::{atom, unit_atom, Atom};
pub use backoff::Backoff;
pub use combinators::{
    choice, commit, computed, lift, never, post_commit, ret, Consume,
};
pub use error::ChemError;
pub use metrics::{engine_metrics, reset_engine_metrics, EngineMetrics};
pub use offer::{AbortResult, Offer};
pub use reaction::{CasSlot, Reaction};
pub use reagent::{dissolve, Outcome, Reactant, Reagent};
