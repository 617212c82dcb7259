//! Provider registry with selector watches.
//!
//! # Role
//!
//! Holds the registered providers and the open watches. Every mutation works out
//! which watches gain, keep or lose the provider and queues one event per affected
//! watch.
//!
//! # Invariants
//!
//! - A watch's `tracked` set is exactly the registered providers its selector
//!   matched at the last mutation, and the events queued for it so far are the
//!   transitions between those sets.
//! - Events are delivered in the order they were queued.
//!
//! # Concurrency
//!
//! State lives behind a reentrant mutex. Sinks run with the mutex held and no
//! borrow active. A mutation issued from inside a sink only queues its events;
//! they are delivered once the current event returns, so every sink sees events
//! in mutation order.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use rustc_hash::FxBuildHasher;
use tether_requisite::ProviderEvents;
use tracing::{debug, trace, warn};

use crate::provider::{ProviderId, ProviderRef};
use crate::selector::Selector;
use crate::{Attributes, Error, Result};

type FxIndexMap<K, V> = IndexMap<K, V, FxBuildHasher>;
type FxIndexSet<T> = IndexSet<T, FxBuildHasher>;

/// Sink type accepted by [`ProviderRegistry::watch`].
pub type ProviderSink = Arc<dyn ProviderEvents<ProviderRef>>;

/// Handle for an open watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchId(u64);

impl fmt::Display for WatchId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "watch#{}", self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
	Added,
	Modified,
	Removed,
}

struct Delivery {
	watch: WatchId,
	kind: EventKind,
	sink: ProviderSink,
	provider: ProviderRef,
}

impl Delivery {
	fn deliver(self) {
		trace!(watch = %self.watch, provider = %self.provider.id(), kind = ?self.kind, "delivering provider event");
		match self.kind {
			EventKind::Added => self.sink.on_provider_added(&self.provider),
			EventKind::Modified => self.sink.on_provider_modified(&self.provider),
			EventKind::Removed => self.sink.on_provider_removed(&self.provider),
		}
	}
}

struct Watch {
	selector: Selector,
	sink: ProviderSink,
	tracked: FxIndexSet<ProviderId>,
}

#[derive(Default)]
struct RegistryState {
	next_provider: u64,
	next_watch: u64,
	providers: FxIndexMap<ProviderId, ProviderRef>,
	watches: FxIndexMap<WatchId, Watch>,
	pending: VecDeque<Delivery>,
	delivering: bool,
}

impl RegistryState {
	fn queue(&mut self, watch_id: WatchId, kind: EventKind, provider: &ProviderRef) {
		let Some(watch) = self.watches.get(&watch_id) else {
			return;
		};
		self.pending.push_back(Delivery {
			watch: watch_id,
			kind,
			sink: watch.sink.clone(),
			provider: provider.clone(),
		});
	}

	/// Recomputes membership of `provider` in every watch and queues the transitions.
	/// `changed` turns a continued match into a modification.
	fn reconcile(&mut self, provider: &ProviderRef, registered: bool, changed: bool) {
		let id = provider.id();
		let mut transitions = Vec::new();
		for (watch_id, watch) in &mut self.watches {
			let was = watch.tracked.contains(&id);
			let now = registered && provider.with_attributes(|attributes| watch.selector.matches(attributes));
			let kind = match (was, now) {
				(false, true) => {
					watch.tracked.insert(id);
					EventKind::Added
				}
				(true, false) => {
					watch.tracked.shift_remove(&id);
					EventKind::Removed
				}
				(true, true) if changed => EventKind::Modified,
				_ => continue,
			};
			transitions.push((*watch_id, kind));
		}
		for (watch_id, kind) in transitions {
			self.queue(watch_id, kind, provider);
		}
	}
}

/// Thread-safe in-memory registry. Clones share the same registry.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
	state: Arc<ReentrantMutex<RefCell<RegistryState>>>,
}

type Guard<'a> = ReentrantMutexGuard<'a, RefCell<RegistryState>>;

/// Clears the delivering flag even when a sink unwinds.
struct DeliveringReset<'a, 'g>(&'a Guard<'g>);

impl Drop for DeliveringReset<'_, '_> {
	fn drop(&mut self) {
		self.0.borrow_mut().delivering = false;
	}
}

impl ProviderRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a provider and announces it to every matching watch.
	pub fn register(&self, attributes: Attributes) -> ProviderRef {
		let guard = self.state.lock();
		let provider = {
			let mut state = guard.borrow_mut();
			state.next_provider += 1;
			let provider = ProviderRef::new(ProviderId(state.next_provider), attributes);
			state.providers.insert(provider.id(), provider.clone());
			state.reconcile(&provider, true, false);
			provider
		};
		debug!(provider = %provider.id(), attributes = ?provider.attributes(), "provider registered");
		Self::flush(&guard);
		provider
	}

	/// Replaces a provider's attributes.
	///
	/// Watches that still match see a modification, watches that start matching
	/// see an addition and watches that stop matching see a removal.
	pub fn update(&self, id: ProviderId, attributes: Attributes) -> Result<()> {
		let guard = self.state.lock();
		{
			let mut state = guard.borrow_mut();
			let Some(provider) = state.providers.get(&id).cloned() else {
				return Err(Error::UnknownProvider(id));
			};
			provider.replace_attributes(attributes);
			state.reconcile(&provider, true, true);
		}
		debug!(provider = %id, "provider updated");
		Self::flush(&guard);
		Ok(())
	}

	/// Unregisters a provider; every watch tracking it sees a removal.
	pub fn unregister(&self, id: ProviderId) -> Result<()> {
		let guard = self.state.lock();
		{
			let mut state = guard.borrow_mut();
			let Some(provider) = state.providers.shift_remove(&id) else {
				return Err(Error::UnknownProvider(id));
			};
			state.reconcile(&provider, false, false);
		}
		debug!(provider = %id, "provider unregistered");
		Self::flush(&guard);
		Ok(())
	}

	/// Opens a watch. Providers that already match are replayed as additions in
	/// registration order before this returns, unless called from inside a sink.
	pub fn watch(&self, selector: Selector, sink: ProviderSink) -> WatchId {
		let guard = self.state.lock();
		let watch_id = {
			let mut state = guard.borrow_mut();
			state.next_watch += 1;
			let watch_id = WatchId(state.next_watch);
			let matching: Vec<ProviderRef> = state
				.providers
				.values()
				.filter(|provider| provider.with_attributes(|attributes| selector.matches(attributes)))
				.cloned()
				.collect();
			debug!(watch = %watch_id, selector = %selector, matching = matching.len(), "watch opened");
			state.watches.insert(
				watch_id,
				Watch {
					selector,
					sink,
					tracked: matching.iter().map(ProviderRef::id).collect(),
				},
			);
			for provider in &matching {
				state.queue(watch_id, EventKind::Added, provider);
			}
			watch_id
		};
		Self::flush(&guard);
		watch_id
	}

	/// Closes a watch and delivers a removal for every provider it was tracking.
	pub fn unwatch(&self, id: WatchId) -> Result<()> {
		let guard = self.state.lock();
		{
			let mut state = guard.borrow_mut();
			let Some(watch) = state.watches.shift_remove(&id) else {
				warn!(watch = %id, "unwatch for unknown watch");
				return Err(Error::UnknownWatch(id));
			};
			debug!(watch = %id, tracked = watch.tracked.len(), "watch closed");
			for provider_id in &watch.tracked {
				let Some(provider) = state.providers.get(provider_id).cloned() else {
					continue;
				};
				state.pending.push_back(Delivery {
					watch: id,
					kind: EventKind::Removed,
					sink: watch.sink.clone(),
					provider,
				});
			}
		}
		Self::flush(&guard);
		Ok(())
	}

	pub fn get(&self, id: ProviderId) -> Option<ProviderRef> {
		self.state.lock().borrow().providers.get(&id).cloned()
	}

	/// Registered providers in registration order.
	pub fn providers(&self) -> Vec<ProviderRef> {
		self.state.lock().borrow().providers.values().cloned().collect()
	}

	/// Registered providers matching `selector`, in registration order.
	pub fn find(&self, selector: &Selector) -> Vec<ProviderRef> {
		self.state
			.lock()
			.borrow()
			.providers
			.values()
			.filter(|provider| provider.with_attributes(|attributes| selector.matches(attributes)))
			.cloned()
			.collect()
	}

	pub fn provider_count(&self) -> usize {
		self.state.lock().borrow().providers.len()
	}

	pub fn watch_count(&self) -> usize {
		self.state.lock().borrow().watches.len()
	}

	/// Providers currently tracked by a watch, in the order they started matching.
	pub fn tracked(&self, id: WatchId) -> Option<Vec<ProviderId>> {
		self.state
			.lock()
			.borrow()
			.watches
			.get(&id)
			.map(|watch| watch.tracked.iter().copied().collect())
	}

	/// Delivers queued events unless an outer call on this thread is already doing so.
	fn flush(guard: &Guard<'_>) {
		{
			let mut state = guard.borrow_mut();
			if state.delivering {
				return;
			}
			state.delivering = true;
		}
		let _reset = DeliveringReset(guard);
		loop {
			let next = guard.borrow_mut().pending.pop_front();
			let Some(delivery) = next else {
				break;
			};
			delivery.deliver();
		}
	}
}

impl fmt::Debug for ProviderRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let guard = self.state.lock();
		let state = guard.borrow();
		f.debug_struct("ProviderRegistry")
			.field("providers", &state.providers.len())
			.field("watches", &state.watches.len())
			.field("pending", &state.pending.len())
			.finish()
	}
}
