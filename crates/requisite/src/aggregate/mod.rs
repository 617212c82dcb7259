//! Multi-capability aggregation.
//!
//! # Role
//!
//! A consumer that needs several capabilities at once registers one tracker per
//! capability name. The aggregator turns the independent per-tracker callbacks into
//! a single start when every name is satisfied and a single stop when the first of
//! them is lost.
//!
//! # Invariants
//!
//! - `satisfied` holds an entry for a name only while that tracker has a provider
//!   bound to the consumer.
//! - `started` is true iff a start was queued and no stop has been queued since;
//!   outside the zero-capability case this is exactly `satisfied.len() == trackers.len()`.
//! - `subscribed` lists exactly the trackers this aggregator subscribed the consumer
//!   to. Teardown unsubscribes those and nothing else.
//! - Start and stop for one consumer are delivered in the order they were queued,
//!   so they strictly alternate.
//!
//! # Concurrency
//!
//! No aggregator lock is held while calling into a tracker or the listener. The
//! satisfied-set check and mutation happen under the `inner` mutex, and the
//! resulting transition is queued in the consumer's outbox under the same lock.
//! Whoever creates the outbox drains it with the lock released; a transition
//! queued meanwhile, from any thread, is delivered by that drainer.
//!
//! Registration and teardown of one consumer are serialized by its [`Phase`]: a
//! consumer is not re-registered until its teardown finished, and unregistering
//! during registration leaves the teardown to the registering call.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::Identity;
use crate::tracker::SubscribeOutcome;
use crate::traits::{Requirement, RequirementListener};

/// Receives the whole-consumer transitions.
pub trait MultiRequirementListener<C, P>: Send + Sync {
	/// Every named requirement of `consumer` is satisfied. `providers` lists the bound
	/// provider per name in registration order.
	fn start(&self, consumer: &C, providers: &IndexMap<String, P>);

	/// `consumer` was started and just lost one of its requirements.
	fn stop(&self, consumer: &C);
}

type Requirements<C, P> = IndexMap<String, Arc<dyn Requirement<C, P>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
	/// `register_consumer` is still subscribing.
	Opening,
	Open,
	/// Unregistered while opening; the registering call tears down.
	Cancelled,
	/// Unsubscribing from trackers; callbacks are ignored.
	Closing,
}

enum Transition<P> {
	Start(IndexMap<String, P>),
	Stop,
}

struct ConsumerEntry<C, P> {
	generation: u64,
	phase: Phase,
	trackers: Requirements<C, P>,
	subscribed: Requirements<C, P>,
	satisfied: IndexMap<String, P>,
	started: bool,
}

impl<C: Identity, P: Identity> ConsumerEntry<C, P> {
	fn is_live(&self) -> bool {
		matches!(self.phase, Phase::Opening | Phase::Open)
	}

	fn is_full(&self) -> bool {
		self.satisfied.len() == self.trackers.len()
	}

	/// Bound providers keyed by name, in registration order.
	fn providers(&self) -> IndexMap<String, P> {
		self.trackers
			.keys()
			.filter_map(|name| self.satisfied.get(name).map(|provider| (name.clone(), provider.clone())))
			.collect()
	}

	fn missing(&self) -> Vec<String> {
		self.trackers.keys().filter(|name| !self.satisfied.contains_key(*name)).cloned().collect()
	}
}

struct Inner<C, P> {
	next_generation: u64,
	entries: FxHashMap<C, ConsumerEntry<C, P>>,
	/// Present while some thread is draining transitions for that consumer.
	outboxes: FxHashMap<C, VecDeque<Transition<P>>>,
}

struct Shared<C, P> {
	listener: Arc<dyn MultiRequirementListener<C, P>>,
	inner: Mutex<Inner<C, P>>,
}

impl<C: Identity, P: Identity> Shared<C, P> {
	/// Queues `transition` for `consumer` and, unless another call is already
	/// draining that consumer's outbox, delivers everything queued.
	fn emit<'a>(&'a self, mut inner: MutexGuard<'a, Inner<C, P>>, consumer: &C, transition: Transition<P>) {
		if let Some(outbox) = inner.outboxes.get_mut(consumer) {
			trace!(consumer = ?consumer, "transition queued behind an active delivery");
			outbox.push_back(transition);
			return;
		}
		inner.outboxes.insert(consumer.clone(), VecDeque::from([transition]));
		let reset = OutboxReset { shared: self, consumer };

		loop {
			let next = inner.outboxes.get_mut(consumer).and_then(VecDeque::pop_front);
			let Some(transition) = next else {
				inner.outboxes.remove(consumer);
				std::mem::forget(reset);
				return;
			};
			drop(inner);
			match &transition {
				Transition::Start(providers) => {
					info!(consumer = ?consumer, providers = ?providers, "all requirements available, starting");
					self.listener.start(consumer, providers);
				}
				Transition::Stop => {
					info!(consumer = ?consumer, "requirement lost, stopping");
					self.listener.stop(consumer);
				}
			}
			inner = self.inner.lock();
		}
	}
}

/// Drops the outbox if the listener unwinds, so later transitions still get a drainer.
struct OutboxReset<'a, C: Identity, P: Identity> {
	shared: &'a Shared<C, P>,
	consumer: &'a C,
}

impl<C: Identity, P: Identity> Drop for OutboxReset<'_, C, P> {
	fn drop(&mut self) {
		self.shared.inner.lock().outboxes.remove(self.consumer);
	}
}

/// Per-name listener subscribed to each tracker on behalf of a consumer.
struct NamedListener<C, P> {
	name: String,
	generation: u64,
	shared: Weak<Shared<C, P>>,
}

impl<C: Identity, P: Identity> NamedListener<C, P> {
	/// The consumer's entry, if it still belongs to this listener's registration
	/// and accepts callbacks.
	fn entry<'a>(&self, inner: &'a mut Inner<C, P>, consumer: &C) -> Option<&'a mut ConsumerEntry<C, P>> {
		inner
			.entries
			.get_mut(consumer)
			.filter(|entry| entry.generation == self.generation && entry.is_live())
	}
}

impl<C: Identity, P: Identity> RequirementListener<C, P> for NamedListener<C, P> {
	fn available(&self, consumer: &C, provider: &P) {
		let Some(shared) = self.shared.upgrade() else {
			return;
		};
		let mut inner = shared.inner.lock();
		let Some(entry) = self.entry(&mut inner, consumer) else {
			trace!(capability = %self.name, consumer = ?consumer, "availability for retired registration, ignoring");
			return;
		};
		entry.satisfied.insert(self.name.clone(), provider.clone());
		if !entry.is_full() || entry.started {
			debug!(
				capability = %self.name,
				consumer = ?consumer,
				provider = ?provider,
				missing = ?entry.missing(),
				"requirement available, waiting for the rest"
			);
			return;
		}
		entry.started = true;
		let providers = entry.providers();
		debug!(capability = %self.name, consumer = ?consumer, "last requirement available");
		shared.emit(inner, consumer, Transition::Start(providers));
	}

	fn removed(&self, consumer: &C, provider: &P) {
		let Some(shared) = self.shared.upgrade() else {
			return;
		};
		let mut inner = shared.inner.lock();
		let Some(entry) = self.entry(&mut inner, consumer) else {
			trace!(capability = %self.name, consumer = ?consumer, "removal for retired registration, ignoring");
			return;
		};
		// Decided before the name is dropped: only a full-to-partial transition stops.
		let was_started = entry.started;
		debug_assert_eq!(was_started, entry.is_full(), "started flag out of sync for {consumer:?}");
		entry.satisfied.shift_remove(&self.name);
		entry.started = false;
		debug!(capability = %self.name, consumer = ?consumer, provider = ?provider, "requirement removed");
		if was_started {
			shared.emit(inner, consumer, Transition::Stop);
		}
	}
}

/// Starts a consumer once all its named requirements are met and stops it when
/// the first one is lost.
pub struct MultiRequirementAggregator<C, P> {
	shared: Arc<Shared<C, P>>,
}

impl<C, P> Clone for MultiRequirementAggregator<C, P> {
	fn clone(&self) -> Self {
		Self {
			shared: self.shared.clone(),
		}
	}
}

impl<C: Identity, P: Identity> MultiRequirementAggregator<C, P> {
	pub fn new(listener: Arc<dyn MultiRequirementListener<C, P>>) -> Self {
		Self {
			shared: Arc::new(Shared {
				listener,
				inner: Mutex::new(Inner {
					next_generation: 0,
					entries: FxHashMap::default(),
					outboxes: FxHashMap::default(),
				}),
			}),
		}
	}

	/// Subscribes `consumer` to every tracker in `trackers`, in map order.
	///
	/// Start may fire from inside this call, typically during the last subscription.
	/// A consumer without requirements starts immediately. Returns `false` and
	/// changes nothing if the consumer is already registered, or if one of the
	/// trackers already has a subscription for it that this aggregator does not own.
	pub fn register_consumer(&self, consumer: C, trackers: Requirements<C, P>) -> bool {
		let generation = {
			let mut inner = self.shared.inner.lock();
			if inner.entries.contains_key(&consumer) {
				drop(inner);
				warn!(consumer = ?consumer, "consumer already registered, ignoring");
				return false;
			}
			inner.next_generation += 1;
			let generation = inner.next_generation;
			let immediate = trackers.is_empty();
			inner.entries.insert(
				consumer.clone(),
				ConsumerEntry {
					generation,
					phase: if immediate { Phase::Open } else { Phase::Opening },
					trackers: trackers.clone(),
					subscribed: IndexMap::new(),
					satisfied: IndexMap::new(),
					started: immediate,
				},
			);
			debug!(consumer = ?consumer, requirements = ?trackers.keys().collect::<Vec<_>>(), "consumer registered");
			if immediate {
				info!(consumer = ?consumer, "no requirements");
				self.shared.emit(inner, &consumer, Transition::Start(IndexMap::new()));
				return true;
			}
			generation
		};

		for (name, tracker) in &trackers {
			let listener = Arc::new(NamedListener {
				name: name.clone(),
				generation,
				shared: Arc::downgrade(&self.shared),
			});
			let outcome = tracker.subscribe(consumer.clone(), listener);

			let mut inner = self.shared.inner.lock();
			let Some(entry) = inner.entries.get_mut(&consumer) else {
				return false;
			};
			if matches!(outcome, SubscribeOutcome::AlreadySubscribed) {
				entry.phase = Phase::Closing;
				drop(inner);
				warn!(
					capability = %name,
					tracker = %tracker.label(),
					consumer = ?consumer,
					"consumer already subscribed to tracker outside this aggregator, rolling back"
				);
				self.teardown(&consumer);
				return false;
			}
			entry.subscribed.insert(name.clone(), tracker.clone());
			if entry.phase == Phase::Cancelled {
				entry.phase = Phase::Closing;
				drop(inner);
				debug!(consumer = ?consumer, "unregistered during registration");
				self.teardown(&consumer);
				return true;
			}
		}

		let mut inner = self.shared.inner.lock();
		let Some(entry) = inner.entries.get_mut(&consumer) else {
			return false;
		};
		match entry.phase {
			Phase::Opening => entry.phase = Phase::Open,
			Phase::Cancelled => {
				entry.phase = Phase::Closing;
				drop(inner);
				self.teardown(&consumer);
			}
			Phase::Open | Phase::Closing => {}
		}
		true
	}

	/// Unsubscribes `consumer` from the trackers it was subscribed to here and
	/// forgets it.
	///
	/// A started consumer gets exactly one stop. Returns `false` for consumers that
	/// were never registered or are already being unregistered. Called while the
	/// consumer is still registering on another thread, the teardown completes
	/// when that registration returns.
	pub fn unregister_consumer(&self, consumer: &C) -> bool {
		let mut inner = self.shared.inner.lock();
		let Some(entry) = inner.entries.get_mut(consumer) else {
			drop(inner);
			warn!(consumer = ?consumer, "unregister for unknown consumer, ignoring");
			return false;
		};
		match entry.phase {
			Phase::Opening => {
				entry.phase = Phase::Cancelled;
				debug!(consumer = ?consumer, "unregister during registration, deferring teardown");
				true
			}
			Phase::Open => {
				entry.phase = Phase::Closing;
				drop(inner);
				self.teardown(consumer);
				true
			}
			Phase::Cancelled | Phase::Closing => {
				drop(inner);
				debug!(consumer = ?consumer, "consumer already being unregistered");
				false
			}
		}
	}

	/// Unsubscribes a `Closing` consumer, drops its entry and queues the final stop.
	fn teardown(&self, consumer: &C) {
		let subscribed = self
			.shared
			.inner
			.lock()
			.entries
			.get(consumer)
			.map(|entry| entry.subscribed.clone())
			.unwrap_or_default();
		for tracker in subscribed.values() {
			tracker.unsubscribe(consumer);
		}

		let mut inner = self.shared.inner.lock();
		let Some(entry) = inner.entries.remove(consumer) else {
			return;
		};
		debug!(consumer = ?consumer, unsubscribed = subscribed.len(), "consumer unregistered");
		if entry.started {
			self.shared.emit(inner, consumer, Transition::Stop);
		}
	}

	pub fn is_registered(&self, consumer: &C) -> bool {
		self.shared.inner.lock().entries.get(consumer).is_some_and(ConsumerEntry::is_live)
	}

	/// Whether `consumer` is currently started.
	pub fn is_satisfied(&self, consumer: &C) -> bool {
		self.shared
			.inner
			.lock()
			.entries
			.get(consumer)
			.is_some_and(|entry| entry.is_live() && entry.started)
	}

	/// Providers currently bound for `consumer`, by requirement name.
	pub fn satisfied(&self, consumer: &C) -> Option<IndexMap<String, P>> {
		self.shared
			.inner
			.lock()
			.entries
			.get(consumer)
			.filter(|entry| entry.is_live())
			.map(ConsumerEntry::providers)
	}

	/// Requirement names `consumer` is still waiting for, in registration order.
	pub fn missing(&self, consumer: &C) -> Vec<String> {
		self.shared
			.inner
			.lock()
			.entries
			.get(consumer)
			.filter(|entry| entry.is_live())
			.map(ConsumerEntry::missing)
			.unwrap_or_default()
	}

	pub fn consumer_count(&self) -> usize {
		self.shared.inner.lock().entries.values().filter(|entry| entry.is_live()).count()
	}
}
