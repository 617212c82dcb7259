//! In-memory provider registry that feeds requirement trackers.
//!
//! Providers are registered with a set of string [`Attributes`]. A watch pairs a
//! [`Selector`] with a [`ProviderEvents`] sink and receives an event whenever a
//! provider starts matching, changes while matching, or stops matching.
//! [`TrackedRequirement`] wires a [`RequirementTracker`] to such a watch, and
//! [`RequirementsConfig`] builds a set of them from a TOML capability table.
//!
//! [`ProviderEvents`]: tether_requisite::ProviderEvents
//! [`RequirementTracker`]: tether_requisite::RequirementTracker

mod attributes;
pub mod config;
mod error;
mod provider;
mod registry;
pub mod selector;
mod tracked;

pub use attributes::Attributes;
pub use config::{CapabilityConfig, RequirementsConfig};
pub use error::{Error, Result};
pub use provider::{ProviderId, ProviderRef};
pub use registry::{ProviderRegistry, ProviderSink, WatchId};
pub use selector::{Selector, SelectorError};
pub use tracked::{TrackedRequirement, requirements};
