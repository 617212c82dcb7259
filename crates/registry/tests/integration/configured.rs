//! Capabilities opened from TOML, with a version-aware suitability strategy.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use tether_registry::{Attributes, ProviderRef, ProviderRegistry, RequirementsConfig, requirements};
use tether_requisite::{BoxError, FnSuitability, MultiRequirementAggregator};

use crate::common::{MultiCounter, init_tracing, service};

const CONFIG: &str = r#"
[capabilities.storage]
filter = "(&(objectClass=DataSourceFactory)(driver=postgres))"
label = "postgres storage"

[capabilities.cache]
filter = "(objectClass=Cache)"
"#;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct App {
	min_version: u32,
}

fn storage(version: &str) -> Attributes {
	service("DataSourceFactory").with("driver", "postgres").with("version", version)
}

#[test]
fn config_driven_aggregation_follows_provider_versions() {
	init_tracing();
	let registry = ProviderRegistry::new();
	let old = registry.register(storage("1"));
	let cache = registry.register(service("Cache"));
	registry.register(service("DataSourceFactory").with("driver", "sqlite").with("version", "9"));

	let config = RequirementsConfig::from_toml_str(CONFIG).unwrap();
	let trackers = config
		.open_trackers::<App, _, _>(&registry, |_| {
			FnSuitability::new(
				|provider: &ProviderRef| provider.get("version"),
				|app: &App, provider: &ProviderRef| -> Result<bool, BoxError> {
					match provider.get("version") {
						Some(version) => Ok(version.parse::<u32>()? >= app.min_version),
						None => Ok(true),
					}
				},
			)
		})
		.unwrap();
	assert_eq!(trackers["storage"].label(), "postgres storage");
	assert_eq!(trackers["storage"].provider_count(), 1);

	let counter = Arc::new(MultiCounter::default());
	let aggregator: MultiRequirementAggregator<App, ProviderRef> = MultiRequirementAggregator::new(counter.clone());
	let app = App { min_version: 2 };
	aggregator.register_consumer(app.clone(), requirements(&trackers));

	assert_eq!(counter.get(), 0);
	assert_eq!(aggregator.missing(&app), vec!["storage".to_string()]);
	assert!(trackers["storage"].wrong_pairings().is_wrong_pairing(&app, &old));

	// Upgrading the provider changes its signature and clears the cached verdict.
	registry.update(old.id(), storage("2")).unwrap();
	assert_eq!(counter.get(), 1);
	let started = counter.last_start().unwrap();
	assert_eq!(started.get("storage"), Some(&old));
	assert_eq!(started.get("cache"), Some(&cache));

	// Attributes outside the signature do not disturb the binding.
	registry.update(old.id(), storage("2").with("pool", "16")).unwrap();
	assert_eq!(counter.get(), 1);
	assert_eq!(trackers["storage"].bound_provider(&app), Some(old.clone()));

	// A malformed version makes the predicate fail, which counts as unsuitable.
	registry.update(old.id(), storage("two")).unwrap();
	assert_eq!(counter.get(), 0);
	assert!(trackers["storage"].is_waiting(&app));
	assert!(trackers["storage"].wrong_pairings().is_wrong_pairing(&app, &old));

	let fresh = registry.register(storage("3"));
	assert_eq!(counter.get(), 1);
	assert_eq!(counter.last_start().unwrap().get("storage"), Some(&fresh));

	drop(trackers);
	assert_eq!(counter.get(), 0);
	assert_eq!(registry.watch_count(), 0);
}
