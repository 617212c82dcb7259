use std::ops::Deref;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tether_requisite::{Identity, Requirement, RequirementTracker, Suitability};
use tracing::{debug, warn};

use crate::registry::{ProviderRegistry, WatchId};
use crate::selector::Selector;
use crate::ProviderRef;

/// A requirement tracker fed by a registry watch.
///
/// Opening replays the providers that already match. Closing (explicitly or on
/// drop) closes the watch, so every bound consumer sees `removed` and the tracker
/// ends up with no providers.
pub struct TrackedRequirement<C, S>
where
	S: Suitability<C, ProviderRef>,
{
	tracker: Arc<RequirementTracker<C, ProviderRef, S>>,
	registry: ProviderRegistry,
	selector: Selector,
	watch: Mutex<Option<WatchId>>,
}

impl<C, S> TrackedRequirement<C, S>
where
	C: Identity,
	S: Suitability<C, ProviderRef> + 'static,
{
	pub fn open(registry: &ProviderRegistry, label: impl Into<String>, selector: Selector, suitability: S) -> Self {
		let tracker = Arc::new(RequirementTracker::new(label, suitability));
		let watch = registry.watch(selector.clone(), tracker.clone());
		debug!(tracker = %tracker.label(), watch = %watch, selector = %selector, "requirement opened");
		Self {
			tracker,
			registry: registry.clone(),
			selector,
			watch: Mutex::new(Some(watch)),
		}
	}

	/// Closes the underlying watch. Returns `false` if already closed.
	pub fn close(&self) -> bool {
		let Some(watch) = self.watch.lock().take() else {
			return false;
		};
		debug!(tracker = %self.tracker.label(), watch = %watch, "requirement closed");
		release(&self.registry, self.tracker.label(), watch);
		true
	}

	pub fn is_open(&self) -> bool {
		self.watch.lock().is_some()
	}

	pub fn selector(&self) -> &Selector {
		&self.selector
	}

	pub fn tracker(&self) -> &Arc<RequirementTracker<C, ProviderRef, S>> {
		&self.tracker
	}

	/// The tracker as an object-safe requirement, ready for an aggregator.
	pub fn requirement(&self) -> Arc<dyn Requirement<C, ProviderRef>> {
		self.tracker.clone()
	}
}

impl<C, S> Deref for TrackedRequirement<C, S>
where
	S: Suitability<C, ProviderRef>,
{
	type Target = RequirementTracker<C, ProviderRef, S>;

	fn deref(&self) -> &Self::Target {
		&self.tracker
	}
}

impl<C, S> Drop for TrackedRequirement<C, S>
where
	S: Suitability<C, ProviderRef>,
{
	fn drop(&mut self) {
		if let Some(watch) = self.watch.get_mut().take() {
			debug!(tracker = %self.tracker.label(), watch = %watch, "requirement dropped");
			release(&self.registry, self.tracker.label(), watch);
		}
	}
}

fn release(registry: &ProviderRegistry, label: &str, watch: WatchId) {
	if let Err(err) = registry.unwatch(watch) {
		warn!(tracker = %label, watch = %watch, error = %err, "closing requirement watch failed");
	}
}

/// Object-safe requirements keyed by capability name, in the same order.
pub fn requirements<C, S>(tracked: &IndexMap<String, TrackedRequirement<C, S>>) -> IndexMap<String, Arc<dyn Requirement<C, ProviderRef>>>
where
	C: Identity,
	S: Suitability<C, ProviderRef> + 'static,
{
	tracked
		.iter()
		.map(|(name, requirement)| (name.clone(), requirement.requirement()))
		.collect()
}
