//! Shared listeners for registry integration tests.

use std::sync::atomic::{AtomicI64, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tether_registry::{Attributes, ProviderRef};
use tether_requisite::{MultiRequirementListener, RequirementListener};

pub fn init_tracing() {
	let _ = tracing_subscriber::fmt::try_init();
}

pub fn service(class: &str) -> Attributes {
	Attributes::new().with("objectClass", class)
}

/// Counts `available` up and `removed` down.
#[derive(Default)]
pub struct Counter {
	value: AtomicI64,
}

impl Counter {
	pub fn get(&self) -> i64 {
		self.value.load(Ordering::SeqCst)
	}
}

impl<C> RequirementListener<C, ProviderRef> for Counter {
	fn available(&self, _consumer: &C, _provider: &ProviderRef) {
		self.value.fetch_add(1, Ordering::SeqCst);
	}

	fn removed(&self, _consumer: &C, _provider: &ProviderRef) {
		self.value.fetch_sub(1, Ordering::SeqCst);
	}
}

/// Counts `start` up and `stop` down, remembering the last started providers.
#[derive(Default)]
pub struct MultiCounter {
	value: AtomicI64,
	last_start: Mutex<Option<IndexMap<String, ProviderRef>>>,
}

impl MultiCounter {
	pub fn get(&self) -> i64 {
		self.value.load(Ordering::SeqCst)
	}

	pub fn last_start(&self) -> Option<IndexMap<String, ProviderRef>> {
		self.last_start.lock().clone()
	}
}

impl<C> MultiRequirementListener<C, ProviderRef> for MultiCounter {
	fn start(&self, _consumer: &C, providers: &IndexMap<String, ProviderRef>) {
		*self.last_start.lock() = Some(providers.clone());
		self.value.fetch_add(1, Ordering::SeqCst);
	}

	fn stop(&self, _consumer: &C) {
		self.value.fetch_sub(1, Ordering::SeqCst);
	}
}

/// Checks per-consumer alternation as callbacks arrive and records violations.
#[derive(Default)]
pub struct AlternationCheck {
	bound: Mutex<FxHashMap<u32, ProviderRef>>,
	violations: Mutex<Vec<String>>,
}

impl AlternationCheck {
	pub fn violations(&self) -> Vec<String> {
		self.violations.lock().clone()
	}

	pub fn bound(&self, consumer: u32) -> Option<ProviderRef> {
		self.bound.lock().get(&consumer).cloned()
	}
}

impl RequirementListener<u32, ProviderRef> for AlternationCheck {
	fn available(&self, consumer: &u32, provider: &ProviderRef) {
		if let Some(previous) = self.bound.lock().insert(*consumer, provider.clone()) {
			self.violations
				.lock()
				.push(format!("{consumer}: available {provider:?} while bound to {previous:?}"));
		}
	}

	fn removed(&self, consumer: &u32, provider: &ProviderRef) {
		match self.bound.lock().remove(consumer) {
			Some(previous) if previous == *provider => {}
			other => self
				.violations
				.lock()
				.push(format!("{consumer}: removed {provider:?} but bound to {other:?}")),
		}
	}
}
