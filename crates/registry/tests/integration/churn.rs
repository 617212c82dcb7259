//! Providers and consumers churning from several threads at once.

use std::sync::Arc;
use std::thread;

use pretty_assertions::assert_eq;
use tether_registry::{ProviderRef, ProviderRegistry, Selector, TrackedRequirement};
use tether_requisite::{AcceptAll, BoxError, FnSuitability};

use crate::common::{AlternationCheck, init_tracing, service};

const CONSUMERS: u32 = 16;
const ROUNDS: u32 = 200;

#[test]
fn concurrent_provider_and_consumer_churn_keeps_callbacks_paired() {
	init_tracing();
	let registry = ProviderRegistry::new();
	let tracked: Arc<TrackedRequirement<u32, AcceptAll>> = Arc::new(TrackedRequirement::open(
		&registry,
		"churn",
		Selector::parse("(objectClass=Worker)").unwrap(),
		AcceptAll,
	));
	let check = Arc::new(AlternationCheck::default());

	let providers = (0..3)
		.map(|thread_index| {
			let registry = registry.clone();
			thread::spawn(move || {
				let mut live = Vec::new();
				for round in 0..ROUNDS {
					if round % 3 == 2 {
						if let Some(provider) = live.pop() {
							registry.unregister(provider).unwrap();
						}
					} else {
						let provider = registry.register(service("Worker").with("thread", thread_index.to_string()));
						live.push(provider.id());
					}
				}
			})
		})
		.collect::<Vec<_>>();

	let consumers = {
		let tracked = tracked.clone();
		let check = check.clone();
		thread::spawn(move || {
			for round in 0..ROUNDS {
				let consumer = round % CONSUMERS;
				if tracked.is_subscribed(&consumer) {
					tracked.unsubscribe(&consumer);
				} else {
					tracked.subscribe(consumer, check.clone());
				}
			}
		})
	};

	for handle in providers {
		handle.join().expect("provider thread panicked");
	}
	consumers.join().expect("consumer thread panicked");

	assert_eq!(check.violations(), Vec::<String>::new());
	for consumer in 0..CONSUMERS {
		assert_eq!(check.bound(consumer), tracked.bound_provider(&consumer), "consumer {consumer}");
		if tracked.is_subscribed(&consumer) && tracked.provider_count() > 0 {
			assert!(tracked.bound_provider(&consumer).is_some(), "consumer {consumer} starved");
		}
	}

	tracked.close();
	for consumer in 0..CONSUMERS {
		assert_eq!(check.bound(consumer), None);
	}
	assert_eq!(check.violations(), Vec::<String>::new());
}

#[test]
fn concurrent_updates_rebind_by_signature() {
	init_tracing();
	let registry = ProviderRegistry::new();
	let tracked = TrackedRequirement::open(
		&registry,
		"even workers",
		Selector::parse("(objectClass=Worker)").unwrap(),
		FnSuitability::new(
			|provider: &ProviderRef| provider.get("load"),
			|_consumer: &u32, provider: &ProviderRef| -> Result<bool, BoxError> {
				Ok(provider.get("load").is_some_and(|load| load.len() % 2 == 0))
			},
		),
	);
	let check = Arc::new(AlternationCheck::default());
	for consumer in 0..CONSUMERS {
		tracked.subscribe(consumer, check.clone());
	}

	let workers: Vec<_> = (0..4).map(|_| registry.register(service("Worker").with("load", "0"))).collect();
	let updaters = workers
		.iter()
		.map(|worker| {
			let registry = registry.clone();
			let id = worker.id();
			thread::spawn(move || {
				for round in 0..ROUNDS {
					let load = "x".repeat((round % 4) as usize);
					registry.update(id, service("Worker").with("load", load)).unwrap();
				}
			})
		})
		.collect::<Vec<_>>();
	for handle in updaters {
		handle.join().expect("updater thread panicked");
	}

	// Every worker ends on an odd-length load of three.
	assert_eq!(check.violations(), Vec::<String>::new());
	for consumer in 0..CONSUMERS {
		assert_eq!(tracked.bound_provider(&consumer), None, "consumer {consumer}");
		assert!(tracked.is_waiting(&consumer));
	}

	registry.update(workers[1].id(), service("Worker").with("load", "xx")).unwrap();
	for consumer in 0..CONSUMERS {
		assert_eq!(tracked.bound_provider(&consumer), Some(workers[1].clone()));
	}
	assert_eq!(check.violations(), Vec::<String>::new());
}
