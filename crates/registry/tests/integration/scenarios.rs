//! One provider, two interchangeable providers, and two capabilities aggregated.

use std::sync::Arc;

use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use tether_registry::{ProviderRef, ProviderRegistry, Selector, TrackedRequirement, requirements};
use tether_requisite::{AcceptAll, MultiRequirementAggregator, SubscribeOutcome};

use crate::common::{Counter, MultiCounter, init_tracing, service};

fn open(registry: &ProviderRegistry, class: &str) -> TrackedRequirement<u32, AcceptAll> {
	TrackedRequirement::open(registry, class, Selector::equals("objectClass", class), AcceptAll)
}

#[test]
fn single_provider_comes_and_goes() {
	init_tracing();
	let registry = ProviderRegistry::new();
	let tracked = open(&registry, "TestService");
	let counter = Arc::new(Counter::default());

	assert_eq!(tracked.subscribe(1, counter.clone()), SubscribeOutcome::Waiting);
	let registration = registry.register(service("TestService").with("number", "3"));
	assert_eq!(counter.get(), 1);
	assert_eq!(tracked.bound_provider(&1), Some(registration.clone()));
	assert_eq!(tracked.bound_provider(&1).and_then(|p| p.get("number")).as_deref(), Some("3"));

	registry.unregister(registration.id()).unwrap();
	assert_eq!(counter.get(), 0);
	assert!(tracked.is_waiting(&1));
	assert!(tracked.close());
}

#[test]
fn second_provider_takes_over() {
	init_tracing();
	let registry = ProviderRegistry::new();
	let tracked = open(&registry, "TestService");
	let counter = Arc::new(Counter::default());
	tracked.subscribe(2, counter.clone());

	let first = registry.register(service("TestService").with("number", "3"));
	let second = registry.register(service("TestService").with("number", "6"));
	assert_eq!(counter.get(), 1);
	assert_eq!(tracked.bound_provider(&2), Some(first.clone()));

	registry.unregister(first.id()).unwrap();
	assert_eq!(counter.get(), 1);
	assert_eq!(tracked.bound_provider(&2), Some(second.clone()));

	registry.unregister(second.id()).unwrap();
	assert_eq!(counter.get(), 0);
	tracked.close();
}

#[test]
fn multi_requirement_starts_and_stops() {
	init_tracing();
	let registry = ProviderRegistry::new();
	let multi = open(&registry, "MultiTestService");
	let other = open(&registry, "OtherMultiTestService");
	let counter = Arc::new(MultiCounter::default());
	let aggregator: MultiRequirementAggregator<u32, ProviderRef> = MultiRequirementAggregator::new(counter.clone());

	let mut trackers = IndexMap::new();
	trackers.insert("FIRST".to_string(), multi);
	trackers.insert("SECOND".to_string(), other);
	assert!(aggregator.register_consumer(3, requirements(&trackers)));

	let one = registry.register(service("MultiTestService").with("number", "10"));
	assert_eq!(counter.get(), 0);
	assert_eq!(aggregator.missing(&3), vec!["SECOND".to_string()]);

	let second = registry.register(service("OtherMultiTestService").with("number", "3"));
	assert_eq!(counter.get(), 1);
	let started = counter.last_start().unwrap();
	assert_eq!(started.get("FIRST"), Some(&one));
	assert_eq!(started.get("SECOND"), Some(&second));

	let third = registry.register(service("MultiTestService").with("number", "20"));
	assert_eq!(counter.get(), 1);

	registry.unregister(one.id()).unwrap();
	assert_eq!(counter.get(), 1);
	assert_eq!(counter.last_start().unwrap().get("FIRST"), Some(&third));

	registry.unregister(third.id()).unwrap();
	assert_eq!(counter.get(), 0);

	for tracked in trackers.values() {
		tracked.close();
	}
	assert_eq!(registry.watch_count(), 0);
}

#[test]
fn closing_a_requirement_releases_consumers() {
	init_tracing();
	let registry = ProviderRegistry::new();
	registry.register(service("TestService"));
	let tracked = open(&registry, "TestService");
	let counter = Arc::new(Counter::default());

	assert!(matches!(tracked.subscribe(1, counter.clone()), SubscribeOutcome::Bound(_)));
	assert_eq!(counter.get(), 1);

	drop(tracked);
	assert_eq!(counter.get(), 0);
	assert_eq!(registry.watch_count(), 0);
}
