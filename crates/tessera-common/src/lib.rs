//! Shared building blocks for the tessera crates.
//!
//! Wire types exchanged with the controller, the JSON error code table,
//! retry/backoff policy with cancellable sleeps, an injectable wall clock,
//! correlation IDs and data-directory helpers.

pub mod backoff;
pub mod clock;
pub mod error;
pub mod id;
pub mod paths;
pub mod types;
