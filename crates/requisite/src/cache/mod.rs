//! Negative-match memo for one tracker.
//!
//! # Invariants
//!
//! - `by_consumer[c]` contains `p` iff `by_provider[p]` contains `c`.
//! - Neither index keeps an empty set once a side has been purged.

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::Identity;

#[derive(Debug)]
struct Indices<C, P> {
	/// Providers each consumer has rejected.
	by_consumer: FxHashMap<C, FxHashSet<P>>,
	/// Consumers that rejected each provider.
	by_provider: FxHashMap<P, FxHashSet<C>>,
}

/// Bidirectional memo of `(consumer, provider)` pairs proven unsuitable.
///
/// Shared by the provider-event and consumer-event paths of a tracker, so every
/// access goes through one mutex.
#[derive(Debug)]
pub struct WrongPairingCache<C, P> {
	inner: Mutex<Indices<C, P>>,
}

impl<C: Identity, P: Identity> Default for WrongPairingCache<C, P> {
	fn default() -> Self {
		Self::new()
	}
}

impl<C: Identity, P: Identity> WrongPairingCache<C, P> {
	pub fn new() -> Self {
		Self {
			inner: Mutex::new(Indices {
				by_consumer: FxHashMap::default(),
				by_provider: FxHashMap::default(),
			}),
		}
	}

	pub fn is_wrong_pairing(&self, consumer: &C, provider: &P) -> bool {
		self.inner
			.lock()
			.by_consumer
			.get(consumer)
			.is_some_and(|providers| providers.contains(provider))
	}

	pub fn add_wrong_pairing(&self, consumer: &C, provider: &P) {
		let mut inner = self.inner.lock();
		inner.by_consumer.entry(consumer.clone()).or_default().insert(provider.clone());
		inner.by_provider.entry(provider.clone()).or_default().insert(consumer.clone());
	}

	/// Forgets every verdict about `provider`. Called when it leaves the tracker.
	pub fn remove_provider(&self, provider: &P) {
		let mut inner = self.inner.lock();
		let Some(consumers) = inner.by_provider.remove(provider) else {
			return;
		};
		for consumer in consumers {
			if let Some(providers) = inner.by_consumer.get_mut(&consumer) {
				providers.remove(provider);
				if providers.is_empty() {
					inner.by_consumer.remove(&consumer);
				}
			}
		}
	}

	/// Forgets every verdict about `consumer`. Called on unsubscribe.
	pub fn remove_consumer(&self, consumer: &C) {
		let mut inner = self.inner.lock();
		let Some(providers) = inner.by_consumer.remove(consumer) else {
			return;
		};
		for provider in providers {
			if let Some(consumers) = inner.by_provider.get_mut(&provider) {
				consumers.remove(consumer);
				if consumers.is_empty() {
					inner.by_provider.remove(&provider);
				}
			}
		}
	}

	/// Number of cached wrong pairings.
	pub fn len(&self) -> usize {
		self.inner.lock().by_consumer.values().map(FxHashSet::len).sum()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().by_consumer.is_empty()
	}

	#[cfg(test)]
	pub(crate) fn is_consistent(&self) -> bool {
		let inner = self.inner.lock();
		let forward = inner
			.by_consumer
			.iter()
			.all(|(c, ps)| !ps.is_empty() && ps.iter().all(|p| inner.by_provider.get(p).is_some_and(|cs| cs.contains(c))));
		let backward = inner
			.by_provider
			.iter()
			.all(|(p, cs)| !cs.is_empty() && cs.iter().all(|c| inner.by_consumer.get(c).is_some_and(|ps| ps.contains(p))));
		forward && backward
	}
}
