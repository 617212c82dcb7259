//! Single-capability requirement tracking.
//!
//! # Role
//!
//! A [`RequirementTracker`] owns the providers known for one capability and the
//! consumers that need it. It binds every subscribed consumer to at most one
//! suitable provider and reports each bind and unbind to the consumer's
//! [`RequirementListener`].
//!
//! # Invariants
//!
//! - A subscribed consumer is either waiting or bound, never both.
//! - `bound[c] == p` iff `consumers_of[p]` contains `c`.
//! - Every bound provider is a known provider.
//! - A pairing in the wrong-pairing cache is not retried while the provider stays
//!   registered with an unchanged signature.
//!
//! # Concurrency
//!
//! All tables live behind one reentrant mutex. Listener callbacks and the
//! suitability strategy run while the mutex is held but with no table borrow
//! active, so callbacks for one tracker are serialized across threads and a
//! callback may call back into the same tracker on its own thread.

use std::cell::RefCell;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use parking_lot::ReentrantMutex;
use rustc_hash::{FxBuildHasher, FxHashMap};
use tracing::{debug, error, trace, warn};

use crate::cache::WrongPairingCache;
use crate::suitability::Suitability;
use crate::traits::{ProviderEvents, Requirement, RequirementListener};
use crate::Identity;

type FxIndexMap<K, V> = IndexMap<K, V, FxBuildHasher>;
type FxIndexSet<T> = IndexSet<T, FxBuildHasher>;

/// Result of [`RequirementTracker::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome<P> {
	/// A provider was bound before `subscribe` returned; `available` already fired.
	Bound(P),
	/// No suitable provider yet.
	Waiting,
	/// The consumer was already subscribed. Nothing changed.
	AlreadySubscribed,
}

struct TrackerState<C, P, Sig> {
	/// Known providers with their change signatures, in registration order.
	providers: FxIndexMap<P, Sig>,
	/// Consumers without a provider, in the order they started waiting.
	waiting: FxIndexSet<C>,
	bound: FxHashMap<C, P>,
	consumers_of: FxHashMap<P, FxIndexSet<C>>,
	/// One entry per subscribed consumer, waiting or bound.
	listeners: FxHashMap<C, Arc<dyn RequirementListener<C, P>>>,
}

impl<C: Identity, P: Identity, Sig> TrackerState<C, P, Sig> {
	fn new() -> Self {
		Self {
			providers: FxIndexMap::default(),
			waiting: FxIndexSet::default(),
			bound: FxHashMap::default(),
			consumers_of: FxHashMap::default(),
			listeners: FxHashMap::default(),
		}
	}

	fn bind(&mut self, consumer: &C, provider: &P) {
		self.waiting.shift_remove(consumer);
		self.bound.insert(consumer.clone(), provider.clone());
		self.consumers_of.entry(provider.clone()).or_default().insert(consumer.clone());
	}

	/// Clears the binding of `consumer` from both directions.
	fn unbind(&mut self, consumer: &C) -> Option<P> {
		let provider = self.bound.remove(consumer)?;
		let now_empty = match self.consumers_of.get_mut(&provider) {
			Some(consumers) => {
				consumers.shift_remove(consumer);
				consumers.is_empty()
			}
			None => false,
		};
		if now_empty {
			self.consumers_of.remove(&provider);
		}
		Some(provider)
	}
}

/// Tracks one capability for many consumers.
///
/// Fed by an external registry through [`ProviderEvents`] and driven by callers
/// through [`subscribe`](Self::subscribe) and [`unsubscribe`](Self::unsubscribe).
pub struct RequirementTracker<C, P, S>
where
	S: Suitability<C, P>,
{
	label: String,
	suitability: S,
	state: ReentrantMutex<RefCell<TrackerState<C, P, S::Signature>>>,
	wrong_pairings: WrongPairingCache<C, P>,
}

type StateCell<C, P, Sig> = RefCell<TrackerState<C, P, Sig>>;

impl<C, P, S> RequirementTracker<C, P, S>
where
	S: Suitability<C, P>,
{
	pub fn label(&self) -> &str {
		&self.label
	}
}

impl<C, P, S> RequirementTracker<C, P, S>
where
	C: Identity,
	P: Identity,
	S: Suitability<C, P>,
{
	pub fn new(label: impl Into<String>, suitability: S) -> Self {
		Self {
			label: label.into(),
			suitability,
			state: ReentrantMutex::new(RefCell::new(TrackerState::new())),
			wrong_pairings: WrongPairingCache::new(),
		}
	}

	pub fn suitability(&self) -> &S {
		&self.suitability
	}

	pub fn wrong_pairings(&self) -> &WrongPairingCache<C, P> {
		&self.wrong_pairings
	}

	/// Registers the need of `consumer` and tries every known provider in
	/// registration order, stopping at the first suitable one.
	///
	/// At most one `available` fires before this returns. Subscribing twice is a
	/// warning, not an error.
	pub fn subscribe(&self, consumer: C, listener: Arc<dyn RequirementListener<C, P>>) -> SubscribeOutcome<P> {
		let guard = self.state.lock();
		{
			let mut state = guard.borrow_mut();
			if state.listeners.contains_key(&consumer) {
				drop(state);
				warn!(tracker = %self.label, consumer = ?consumer, "consumer already subscribed, ignoring");
				return SubscribeOutcome::AlreadySubscribed;
			}
			state.listeners.insert(consumer.clone(), listener);
			state.waiting.insert(consumer.clone());
		}
		debug!(tracker = %self.label, consumer = ?consumer, "consumer subscribed");

		match self.match_consumer(&guard, &consumer) {
			Some(provider) => SubscribeOutcome::Bound(provider),
			None => SubscribeOutcome::Waiting,
		}
	}

	/// Drops the need of `consumer`.
	///
	/// A bound consumer gets `removed` for its provider; a waiting one is dropped
	/// silently. Returns `false` for consumers this tracker does not know.
	pub fn unsubscribe(&self, consumer: &C) -> bool {
		let guard = self.state.lock();
		let released = {
			let mut state = guard.borrow_mut();
			match state.listeners.remove(consumer) {
				Some(listener) => {
					state.waiting.shift_remove(consumer);
					Some((listener, state.unbind(consumer)))
				}
				None => None,
			}
		};
		let Some((listener, provider)) = released else {
			warn!(tracker = %self.label, consumer = ?consumer, "unsubscribe for unknown consumer, ignoring");
			return false;
		};
		self.wrong_pairings.remove_consumer(consumer);
		debug!(tracker = %self.label, consumer = ?consumer, provider = ?provider, "consumer unsubscribed");

		if let Some(provider) = provider {
			listener.removed(consumer, &provider);
		}
		true
	}

	/// Records `provider` and offers it to every waiting consumer.
	///
	/// One provider may serve any number of consumers. A provider that is already
	/// known is handled as a modification.
	pub fn provider_added(&self, provider: &P) {
		let guard = self.state.lock();
		let known = guard.borrow().providers.contains_key(provider);
		if known {
			trace!(tracker = %self.label, provider = ?provider, "provider already known, checking for modification");
			self.provider_modified(provider);
			return;
		}

		let signature = self.suitability.signature(provider);
		guard.borrow_mut().providers.insert(provider.clone(), signature);
		debug!(tracker = %self.label, provider = ?provider, "provider added");

		self.offer(&guard, provider);
	}

	/// Re-reads the change signature of `provider`.
	///
	/// An unchanged signature is ignored. A changed one removes the provider
	/// (unbinding and rematching its consumers) and adds it again, which also
	/// drops every cached verdict about it.
	pub fn provider_modified(&self, provider: &P) {
		let guard = self.state.lock();
		let signature = self.suitability.signature(provider);
		let changed = guard.borrow().providers.get(provider).map(|stored| *stored != signature);

		match changed {
			None => {
				debug!(tracker = %self.label, provider = ?provider, "modification of unknown provider, adding it");
				self.provider_added(provider);
			}
			Some(false) => {
				trace!(tracker = %self.label, provider = ?provider, ?signature, "signature unchanged, ignoring modification");
			}
			Some(true) => {
				debug!(tracker = %self.label, provider = ?provider, ?signature, "signature changed, re-adding provider");
				self.provider_removed(provider);
				self.provider_added(provider);
			}
		}
	}

	/// Forgets `provider`.
	///
	/// Every consumer bound to it receives `removed`, returns to waiting and is
	/// immediately matched against the remaining providers.
	pub fn provider_removed(&self, provider: &P) {
		let guard = self.state.lock();
		let dependents: Vec<C> = {
			let mut state = guard.borrow_mut();
			if state.providers.shift_remove(provider).is_none() {
				drop(state);
				debug!(tracker = %self.label, provider = ?provider, "removal of unknown provider, ignoring");
				return;
			}
			state
				.consumers_of
				.get(provider)
				.map(|consumers| consumers.iter().cloned().collect())
				.unwrap_or_default()
		};
		self.wrong_pairings.remove_provider(provider);
		debug!(tracker = %self.label, provider = ?provider, dependents = dependents.len(), "provider removed");

		let mut released = Vec::with_capacity(dependents.len());
		for consumer in dependents {
			// A callback fired earlier in this loop may have unsubscribed or rebound it.
			let listener = {
				let mut state = guard.borrow_mut();
				if state.bound.get(&consumer) != Some(provider) {
					continue;
				}
				state.unbind(&consumer);
				state.waiting.insert(consumer.clone());
				state.listeners.get(&consumer).cloned()
			};
			match listener {
				Some(listener) => listener.removed(&consumer, provider),
				None => self.invariant_broken("bound consumer has no listener", &consumer),
			}
			released.push(consumer);
		}

		for consumer in released {
			self.match_consumer(&guard, &consumer);
		}
	}

	/// Rejects a pairing after the fact.
	///
	/// The consumer returns to waiting and the pairing is cached as wrong. If the
	/// pairing had been announced, `removed` fires; otherwise nothing does. The
	/// consumer is not rematched until another provider event arrives.
	pub fn cancel_acceptance(&self, consumer: &C, provider: &P) {
		let guard = self.state.lock();
		let outcome = {
			let mut state = guard.borrow_mut();
			if state.listeners.contains_key(consumer) {
				let announced = if state.bound.get(consumer) == Some(provider) {
					state.unbind(consumer);
					state.waiting.insert(consumer.clone());
					state.listeners.get(consumer).cloned()
				} else {
					None
				};
				Some((announced, state.providers.contains_key(provider)))
			} else {
				None
			}
		};
		let Some((announced, provider_known)) = outcome else {
			warn!(tracker = %self.label, consumer = ?consumer, "cancel_acceptance for unknown consumer, ignoring");
			return;
		};
		if provider_known {
			self.wrong_pairings.add_wrong_pairing(consumer, provider);
		}
		debug!(tracker = %self.label, consumer = ?consumer, provider = ?provider, "acceptance cancelled");

		if let Some(listener) = announced {
			listener.removed(consumer, provider);
		}
	}

	/// Provider currently bound to `consumer`.
	pub fn bound_provider(&self, consumer: &C) -> Option<P> {
		self.state.lock().borrow().bound.get(consumer).cloned()
	}

	pub fn is_waiting(&self, consumer: &C) -> bool {
		self.state.lock().borrow().waiting.contains(consumer)
	}

	pub fn is_subscribed(&self, consumer: &C) -> bool {
		self.state.lock().borrow().listeners.contains_key(consumer)
	}

	/// Known providers in registration order.
	pub fn providers(&self) -> Vec<P> {
		self.state.lock().borrow().providers.keys().cloned().collect()
	}

	pub fn provider_count(&self) -> usize {
		self.state.lock().borrow().providers.len()
	}

	/// Waiting consumers in the order they will be offered new providers.
	pub fn waiting(&self) -> Vec<C> {
		self.state.lock().borrow().waiting.iter().cloned().collect()
	}

	/// Consumers bound to `provider`, in bind order.
	pub fn consumers_of(&self, provider: &P) -> Vec<C> {
		self.state
			.lock()
			.borrow()
			.consumers_of
			.get(provider)
			.map(|consumers| consumers.iter().cloned().collect())
			.unwrap_or_default()
	}

	pub fn consumer_count(&self) -> usize {
		self.state.lock().borrow().listeners.len()
	}

	/// Offers a freshly added provider to the waiting consumers.
	fn offer(&self, state: &StateCell<C, P, S::Signature>, provider: &P) {
		let waiting: Vec<C> = state.borrow().waiting.iter().cloned().collect();
		for consumer in waiting {
			if !state.borrow().providers.contains_key(provider) {
				break;
			}
			self.try_pair(state, &consumer, provider);
		}
	}

	/// Scans known providers for a waiting consumer and binds the first suitable one.
	fn match_consumer(&self, state: &StateCell<C, P, S::Signature>, consumer: &C) -> Option<P> {
		let candidates: Vec<P> = state.borrow().providers.keys().cloned().collect();
		for provider in candidates {
			if !state.borrow().waiting.contains(consumer) {
				return None;
			}
			if self.try_pair(state, consumer, &provider) {
				return Some(provider);
			}
		}
		None
	}

	fn try_pair(&self, state: &StateCell<C, P, S::Signature>, consumer: &C, provider: &P) -> bool {
		if self.wrong_pairings.is_wrong_pairing(consumer, provider) {
			trace!(tracker = %self.label, consumer = ?consumer, provider = ?provider, "known wrong pairing, skipping");
			return false;
		}
		if !Self::is_candidate(&state.borrow(), consumer, provider) {
			return false;
		}

		let verdict = catch_unwind(AssertUnwindSafe(|| self.suitability.is_suitable(consumer, provider)));
		let suitable = match verdict {
			Ok(Ok(suitable)) => suitable,
			Ok(Err(err)) => {
				warn!(tracker = %self.label, consumer = ?consumer, provider = ?provider, error = %err, "suitability check failed");
				false
			}
			Err(_) => {
				error!(tracker = %self.label, consumer = ?consumer, provider = ?provider, "suitability check panicked");
				false
			}
		};

		// The strategy may have re-entered this tracker and changed the tables.
		if !Self::is_candidate(&state.borrow(), consumer, provider) {
			return false;
		}
		if !suitable {
			trace!(tracker = %self.label, consumer = ?consumer, provider = ?provider, "pairing rejected");
			self.wrong_pairings.add_wrong_pairing(consumer, provider);
			return false;
		}

		let listener = {
			let mut state = state.borrow_mut();
			let listener = state.listeners.get(consumer).cloned();
			let Some(listener) = listener else {
				drop(state);
				self.invariant_broken("waiting consumer has no listener", consumer);
				return false;
			};
			state.bind(consumer, provider);
			listener
		};
		debug!(tracker = %self.label, consumer = ?consumer, provider = ?provider, "provider bound");
		listener.available(consumer, provider);
		true
	}

	fn is_candidate(state: &TrackerState<C, P, S::Signature>, consumer: &C, provider: &P) -> bool {
		state.waiting.contains(consumer) && state.providers.contains_key(provider)
	}

	fn invariant_broken(&self, what: &str, consumer: &C) {
		error!(tracker = %self.label, consumer = ?consumer, "invariant violated: {what}");
		if cfg!(debug_assertions) {
			panic!("tracker '{}': {what}: {consumer:?}", self.label);
		}
	}

	/// Verifies the table invariants, returning the first violation found.
	#[cfg(test)]
	pub(crate) fn check_invariants(&self) -> Result<(), String> {
		let guard = self.state.lock();
		let state = guard.borrow();
		for consumer in &state.waiting {
			if state.bound.contains_key(consumer) {
				return Err(format!("{consumer:?} both waiting and bound"));
			}
		}
		for consumer in state.listeners.keys() {
			if !state.waiting.contains(consumer) && !state.bound.contains_key(consumer) {
				return Err(format!("{consumer:?} subscribed but neither waiting nor bound"));
			}
		}
		if state.waiting.len() + state.bound.len() != state.listeners.len() {
			return Err("waiting and bound do not partition the subscribed consumers".into());
		}
		for (consumer, provider) in &state.bound {
			if !state.providers.contains_key(provider) {
				return Err(format!("{consumer:?} bound to unknown provider {provider:?}"));
			}
			if !state.consumers_of.get(provider).is_some_and(|consumers| consumers.contains(consumer)) {
				return Err(format!("{consumer:?} -> {provider:?} missing from the inverse index"));
			}
		}
		for (provider, consumers) in &state.consumers_of {
			if consumers.is_empty() {
				return Err(format!("empty inverse entry for {provider:?}"));
			}
			for consumer in consumers {
				if state.bound.get(consumer) != Some(provider) {
					return Err(format!("inverse index lists {consumer:?} under {provider:?}"));
				}
			}
		}
		if !self.wrong_pairings.is_consistent() {
			return Err("wrong-pairing indices disagree".into());
		}
		Ok(())
	}
}

impl<C, P, S> fmt::Debug for RequirementTracker<C, P, S>
where
	C: Identity,
	P: Identity,
	S: Suitability<C, P>,
{
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let guard = self.state.lock();
		let state = guard.borrow();
		f.debug_struct("RequirementTracker")
			.field("label", &self.label)
			.field("providers", &state.providers.len())
			.field("waiting", &state.waiting.len())
			.field("bound", &state.bound.len())
			.finish_non_exhaustive()
	}
}

impl<C, P, S> ProviderEvents<P> for RequirementTracker<C, P, S>
where
	C: Identity,
	P: Identity,
	S: Suitability<C, P>,
{
	fn on_provider_added(&self, provider: &P) {
		self.provider_added(provider);
	}

	fn on_provider_modified(&self, provider: &P) {
		self.provider_modified(provider);
	}

	fn on_provider_removed(&self, provider: &P) {
		self.provider_removed(provider);
	}
}

impl<C, P, S> Requirement<C, P> for RequirementTracker<C, P, S>
where
	C: Identity,
	P: Identity,
	S: Suitability<C, P>,
{
	fn label(&self) -> &str {
		&self.label
	}

	fn subscribe(&self, consumer: C, listener: Arc<dyn RequirementListener<C, P>>) -> SubscribeOutcome<P> {
		RequirementTracker::subscribe(self, consumer, listener)
	}

	fn unsubscribe(&self, consumer: &C) -> bool {
		RequirementTracker::unsubscribe(self, consumer)
	}

	fn bound_provider(&self, consumer: &C) -> Option<P> {
		RequirementTracker::bound_provider(self, consumer)
	}
}
