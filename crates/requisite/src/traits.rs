use std::sync::Arc;

use crate::Identity;
use crate::tracker::SubscribeOutcome;

/// Callbacks a consumer receives from one tracker.
///
/// Registered once per `(consumer, tracker)` pair at subscription time. Calls for the
/// same pair strictly alternate, starting with `available`.
pub trait RequirementListener<C, P>: Send + Sync {
	/// `provider` is now bound to `consumer`.
	fn available(&self, consumer: &C, provider: &P);

	/// `provider` is no longer bound to `consumer`.
	fn removed(&self, consumer: &C, provider: &P);
}

/// Ingestion surface fed by an external provider registry.
///
/// The registry does the coarse filtering: only providers that may offer the
/// tracked capability are delivered.
pub trait ProviderEvents<P>: Send + Sync {
	fn on_provider_added(&self, provider: &P);

	fn on_provider_modified(&self, provider: &P);

	fn on_provider_removed(&self, provider: &P);
}

/// Object-safe view of a tracker, used where trackers with different suitability
/// strategies are held side by side.
pub trait Requirement<C: Identity, P: Identity>: Send + Sync {
	/// Human-readable name used in diagnostics.
	fn label(&self) -> &str;

	fn subscribe(&self, consumer: C, listener: Arc<dyn RequirementListener<C, P>>) -> SubscribeOutcome<P>;

	fn unsubscribe(&self, consumer: &C) -> bool;

	fn bound_provider(&self, consumer: &C) -> Option<P>;
}
