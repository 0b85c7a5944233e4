//! Engine error type.

use thiserror::Error;

/// Errors surfaced by the reagent engine.
///
/// Transient protocol outcomes (`Retry`, `Block`) are not errors; they are
/// part of the [`Outcome`](crate::reagent::Outcome) protocol. This enum
/// covers the genuinely exceptional conditions.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChemError {
    /// A dissolved reagent returned a value or a retry instead of parking
    /// its catalyst offer into a pool.
    #[error("dissolved reagent did not park as a catalyst")]
    MalformedCatalyst,
}
