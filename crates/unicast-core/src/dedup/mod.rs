//! Dedup cache for correlation ids.
//!
//! [`RequestStore`] remembers every id it has seen, in arrival order, and
//! evicts them in batches driven by the [`Cleaner`] cycle. The same cycle also
//! rotates client session pools.

mod cleaner;
mod store;

pub use cleaner::{Cleaner, CleanerPhase, CleanerStep};
pub use store::{Completion, CompletionHandle, CompletionWaiter, Registration, RequestStore};
