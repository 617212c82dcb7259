//! Race-free pairing of consumers with providers that come and go at runtime.
//!
//! A consumer declares that it needs a capability. Providers of that capability
//! appear, change and disappear asynchronously, reported by an external registry
//! through [`ProviderEvents`]. This crate keeps every consumer bound to exactly one
//! suitable provider per capability and reports each transition to the consumer.
//!
//! - [`RequirementTracker`]: one capability. Owns the known providers, the waiting and
//!   bound consumers, and runs the matching algorithm.
//! - [`WrongPairingCache`]: memo of `(consumer, provider)` pairs already proven
//!   unsuitable, scoped to one tracker.
//! - [`MultiRequirementAggregator`]: composes several named trackers per consumer and
//!   emits a single start when all of them are satisfied and a single stop when the
//!   first of them is lost.
//!
//! Suitability is decided by a [`Suitability`] strategy supplied at tracker
//! construction. It also produces the change signature used to ignore provider
//! modifications that do not matter to this capability.
//!
//! ## Ordering
//!
//! Providers are scanned in registration order and waiting consumers in the order they
//! started waiting. For a single `(consumer, tracker)` pair callbacks strictly alternate
//! between `available` and `removed`.

mod aggregate;
mod cache;
mod suitability;
mod tracker;
mod traits;

#[cfg(test)]
mod testing;

pub use aggregate::{MultiRequirementAggregator, MultiRequirementListener};
pub use cache::WrongPairingCache;
pub use suitability::{AcceptAll, BoxError, FnSuitability, Suitability};
pub use tracker::{RequirementTracker, SubscribeOutcome};
pub use traits::{ProviderEvents, Requirement, RequirementListener};

/// Bounds shared by consumer identities and provider handles.
///
/// Both sides are opaque to this crate: they only need to be cheap to clone,
/// comparable, hashable and printable for diagnostics.
pub trait Identity: Clone + Eq + std::hash::Hash + std::fmt::Debug + Send + Sync + 'static {}

impl<T> Identity for T where T: Clone + Eq + std::hash::Hash + std::fmt::Debug + Send + Sync + 'static {}
