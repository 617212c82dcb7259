//! Capability configuration.
//!
//! A TOML document declares the capabilities a consumer needs, each with a
//! selector filter and an optional display label:
//!
//! ```toml
//! [capabilities.storage]
//! filter = "(&(objectClass=DataSourceFactory)(driver=postgres))"
//!
//! [capabilities.cache]
//! filter = "(objectClass=Cache)"
//! label = "shared cache"
//! ```
//!
//! Capabilities keep the order they appear in the file.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tether_requisite::{Identity, Suitability};
use tracing::debug;

use crate::registry::ProviderRegistry;
use crate::selector::Selector;
use crate::tracked::TrackedRequirement;
use crate::{Error, ProviderRef, Result};

/// One named capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapabilityConfig {
	/// Selector source, see [`Selector`].
	pub filter: String,
	/// Tracker label used in diagnostics. Defaults to the capability name.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub label: Option<String>,
}

impl CapabilityConfig {
	pub fn new(filter: impl Into<String>) -> Self {
		Self {
			filter: filter.into(),
			label: None,
		}
	}

	pub fn with_label(mut self, label: impl Into<String>) -> Self {
		self.label = Some(label.into());
		self
	}
}

/// Set of named capabilities, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequirementsConfig {
	#[serde(default)]
	pub capabilities: IndexMap<String, CapabilityConfig>,
}

impl RequirementsConfig {
	pub fn from_toml_str(source: &str) -> Result<Self> {
		let config: Self = toml::from_str(source)?;
		debug!(capabilities = config.capabilities.len(), "requirements config parsed");
		Ok(config)
	}

	/// Adds a capability, rejecting names that are already configured.
	pub fn add(&mut self, name: impl Into<String>, capability: CapabilityConfig) -> Result<()> {
		let name = name.into();
		if self.capabilities.contains_key(&name) {
			return Err(Error::DuplicateCapability(name));
		}
		self.capabilities.insert(name, capability);
		Ok(())
	}

	/// Compiles every filter. The first invalid one fails the whole config.
	pub fn selectors(&self) -> Result<IndexMap<String, Selector>> {
		self.capabilities
			.iter()
			.map(|(name, capability)| {
				let selector = Selector::parse(&capability.filter).map_err(|source| Error::InvalidCapability {
					name: name.clone(),
					source,
				})?;
				Ok((name.clone(), selector))
			})
			.collect()
	}

	/// Opens one tracked requirement per capability on `registry`, in config order.
	///
	/// `suitability` is called once per capability name. Nothing is opened if any
	/// filter is invalid.
	pub fn open_trackers<C, S, F>(&self, registry: &ProviderRegistry, mut suitability: F) -> Result<IndexMap<String, TrackedRequirement<C, S>>>
	where
		C: Identity,
		S: Suitability<C, ProviderRef> + 'static,
		F: FnMut(&str) -> S,
	{
		let selectors = self.selectors()?;
		let mut opened = IndexMap::with_capacity(selectors.len());
		for (name, selector) in selectors {
			let label = self.capabilities.get(&name).and_then(|capability| capability.label.clone()).unwrap_or_else(|| name.clone());
			let tracked = TrackedRequirement::open(registry, label, selector, suitability(&name));
			opened.insert(name, tracked);
		}
		Ok(opened)
	}
}
